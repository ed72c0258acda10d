use chrono::NaiveDate;
use metrics_exporter_prometheus::PrometheusHandle;
use repayment_reconciler::error::AppError;
use repayment_reconciler::reconciliation::{
    AlertError, AlertPublisher, Channel, ChannelPayload, CustomerId, InMemoryLedgerStore,
    LedgerStore, Money, Obligation, ObligationId, OperatorAlert, StoreError,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Keeps alerts in memory so the CLI can print them after a replay.
#[derive(Default, Clone)]
pub(crate) struct CollectingAlertPublisher {
    events: Arc<Mutex<Vec<OperatorAlert>>>,
}

impl AlertPublisher for CollectingAlertPublisher {
    fn publish(&self, alert: OperatorAlert) -> Result<(), AlertError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
        Ok(())
    }
}

impl CollectingAlertPublisher {
    pub(crate) fn events(&self) -> Vec<OperatorAlert> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) const DEMO_CUSTOMERS: [&str; 2] = ["cust-1001", "cust-1002"];

fn due(year: i32, month: u32) -> Result<NaiveDate, StoreError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| StoreError::InvalidState(format!("invalid due date {year}-{month:02}")))
}

/// Two borrowers with three monthly installments each, reachable from every channel.
pub(crate) fn seed_demo_book(store: &InMemoryLedgerStore) -> Result<(), StoreError> {
    let first = CustomerId::new(DEMO_CUSTOMERS[0]);
    let second = CustomerId::new(DEMO_CUSTOMERS[1]);

    for (month, late_fee) in [(1, 25_000), (2, 0), (3, 0)] {
        store.insert_obligation(Obligation::new(
            ObligationId::new(format!("obl-1001-2024-{month:02}")),
            first.clone(),
            due(2024, month)?,
            Money(1_000_000),
            Money(120_000),
            Money(late_fee),
        ))?;
        store.insert_obligation(Obligation::new(
            ObligationId::new(format!("obl-1002-2024-{month:02}")),
            second.clone(),
            due(2024, month)?,
            Money(500_000),
            Money(60_000),
            Money::ZERO,
        ))?;
    }

    store.register_account(Channel::Bca, "1234500001", first.clone())?;
    store.register_account(Channel::Ovo, "6281234567890", first.clone())?;
    store.register_account(Channel::Credgenics, "LN-1001", first)?;
    store.register_account(Channel::Bca, "1234500002", second.clone())?;
    store.register_account(Channel::Dana, "dana-1002", second.clone())?;
    store.register_account(Channel::Credgenics, "LN-1002", second)?;
    Ok(())
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// Reads a JSON array of channel payloads.
pub(crate) fn load_payloads(path: &Path) -> Result<Vec<ChannelPayload>, AppError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
