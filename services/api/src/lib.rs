mod cli;
mod infra;
mod replay;
mod routes;
mod server;

use repayment_reconciler::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
