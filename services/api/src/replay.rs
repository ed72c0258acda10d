use crate::infra::{load_payloads, seed_demo_book, CollectingAlertPublisher, DEMO_CUSTOMERS};
use chrono::{Local, NaiveDate};
use clap::Args;
use repayment_reconciler::config::AppConfig;
use repayment_reconciler::error::AppError;
use repayment_reconciler::reconciliation::{
    write_ledger_csv, ChannelPayload, CustomerId, DispatchQueue, Dispatcher, InMemoryLedgerStore,
    ReconciliationError, ReconciliationOutcome, ReconciliationService,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct ReplayArgs {
    /// JSON array of channel payloads to apply in order
    #[arg(long)]
    pub(crate) file: PathBuf,
    /// Statement date printed after the replay (defaults to today)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) as_of: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub(crate) struct AuditArgs {
    /// JSON array of channel payloads to apply before exporting
    #[arg(long)]
    pub(crate) file: PathBuf,
}

type DemoService = ReconciliationService<InMemoryLedgerStore, CollectingAlertPublisher>;

struct DemoBook {
    service: DemoService,
    alerts: Arc<CollectingAlertPublisher>,
    queue: DispatchQueue,
}

fn demo_book() -> Result<DemoBook, AppError> {
    let config = AppConfig::load()?;
    let store = Arc::new(InMemoryLedgerStore::new());
    seed_demo_book(&store).map_err(ReconciliationError::from)?;

    let alerts = Arc::new(CollectingAlertPublisher::default());
    let (dispatcher, queue) = Dispatcher::channel();
    let service = ReconciliationService::new(store, alerts.clone(), dispatcher, config.reconciliation);
    Ok(DemoBook {
        service,
        alerts,
        queue,
    })
}

fn apply_all(
    service: &DemoService,
    payloads: Vec<ChannelPayload>,
) -> Vec<Result<ReconciliationOutcome, ReconciliationError>> {
    payloads
        .into_iter()
        .map(|payload| service.reconcile_payload(payload))
        .collect()
}

pub(crate) fn run_replay(args: ReplayArgs) -> Result<(), AppError> {
    let ReplayArgs { file, as_of } = args;
    let payloads = load_payloads(&file)?;
    let mut book = demo_book()?;
    let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());

    println!("Replaying {} payload(s) from {}", payloads.len(), file.display());
    for (index, result) in apply_all(&book.service, payloads).into_iter().enumerate() {
        match result {
            Ok(outcome) => {
                let receipt = outcome.receipt();
                let label = if outcome.is_duplicate() {
                    "duplicate"
                } else {
                    "applied"
                };
                println!(
                    "{:>3}. {} {} {} -> {} | amount {} | credit {} | {} entries",
                    index + 1,
                    label,
                    receipt.channel,
                    receipt.external_reference,
                    receipt.transaction_id,
                    receipt.amount,
                    receipt.credit,
                    receipt.entries.len()
                );
            }
            Err(err) => println!("{:>3}. failed [{}] {}", index + 1, err.kind(), err),
        }
    }

    println!("\nStatements as of {as_of}");
    for customer in DEMO_CUSTOMERS {
        let statement = book.service.statement(&CustomerId::new(customer), as_of)?;
        println!(
            "- {}: outstanding {} across {} obligation(s) | credit {}",
            statement.customer_id,
            statement.total_outstanding,
            statement.obligations.len(),
            statement.credit_balance
        );
        for obligation in &statement.obligations {
            println!(
                "    {} due {} | {} | outstanding {}",
                obligation.id,
                obligation.due_date,
                obligation.status.label(),
                obligation.outstanding()
            );
        }
    }

    let alerts = book.alerts.events();
    if !alerts.is_empty() {
        println!("\nOperator alerts");
        for alert in alerts {
            println!(
                "- [{:?}] {} {}: {}",
                alert.severity, alert.channel, alert.external_reference, alert.message
            );
        }
    }

    let effects = book.queue.drain_pending();
    println!("\n{} side effect(s) queued for delivery", effects.len());
    Ok(())
}

pub(crate) fn run_audit(args: AuditArgs) -> Result<(), AppError> {
    let payloads = load_payloads(&args.file)?;
    let book = demo_book()?;
    for result in apply_all(&book.service, payloads) {
        if let Err(err) = result {
            eprintln!("skipped payload [{}]: {}", err.kind(), err);
        }
    }

    let entries = book.service.ledger_entries()?;
    write_ledger_csv(&entries, io::stdout().lock())?;
    Ok(())
}
