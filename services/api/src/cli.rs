use crate::replay::{run_audit, run_replay, AuditArgs, ReplayArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use repayment_reconciler::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Repayment Reconciler",
    about = "Reconcile repayment notifications from payment channels into the loan ledger",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Apply a file of channel payloads to the demo book and print the outcomes
    Replay(ReplayArgs),
    /// Apply a file of channel payloads and write the resulting ledger as CSV
    Audit(AuditArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Replay(args) => run_replay(args),
        Command::Audit(args) => run_audit(args),
    }
}
