use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::NaiveDate;
use serde_json::Value;

use crate::config::ReconciliationConfig;
use crate::reconciliation::alerts::{AlertError, AlertPublisher, OperatorAlert};
use crate::reconciliation::dispatch::{
    DispatchQueue, Dispatcher, Notifier, NotifyError, RetryPolicy, SideEffect,
};
use crate::reconciliation::domain::{
    Channel, Currency, CustomerId, ExternalReference, LedgerEntry, Money, Obligation,
    ObligationId, PaymentNotification, PendingTransaction, TransactionId,
};
use crate::reconciliation::guard::RowLock;
use crate::reconciliation::router::reconciliation_router;
use crate::reconciliation::service::ReconciliationService;
use crate::reconciliation::store::{
    Committed, InMemoryLedgerStore, LedgerStore, StoreError, TransactionDraft, UnitOfWork,
};

pub(super) type TestService = ReconciliationService<InMemoryLedgerStore, RecordingAlerts>;

pub(super) const BCA_ACCOUNT: &str = "1234500001";

pub(super) fn customer() -> CustomerId {
    CustomerId::new("cust-1")
}

pub(super) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// January: 100_000 principal, 10_000 interest, 5_000 late fee.
/// February: 100_000 principal, 10_000 interest.
pub(super) fn seeded_store() -> Arc<InMemoryLedgerStore> {
    let store = Arc::new(InMemoryLedgerStore::new());
    store
        .insert_obligation(Obligation::new(
            ObligationId::new("obl-2024-02"),
            customer(),
            date(2024, 2, 1),
            Money(100_000),
            Money(10_000),
            Money::ZERO,
        ))
        .expect("seed february");
    store
        .insert_obligation(Obligation::new(
            ObligationId::new("obl-2024-01"),
            customer(),
            date(2024, 1, 1),
            Money(100_000),
            Money(10_000),
            Money(5_000),
        ))
        .expect("seed january");
    store
        .register_account(Channel::Bca, BCA_ACCOUNT, customer())
        .expect("register bca");
    store
        .register_account(Channel::Credgenics, "LN-0001", customer())
        .expect("register credgenics");
    store
        .register_account(Channel::Ovo, "6281200000002", CustomerId::new("cust-2"))
        .expect("register ovo");
    store
}

pub(super) fn stored_obligation(store: &InMemoryLedgerStore, id: &str) -> Obligation {
    store
        .obligations(&customer())
        .expect("obligations")
        .into_iter()
        .find(|obligation| obligation.id.as_str() == id)
        .expect("obligation exists")
}

pub(super) fn notification(reference: &str, amount: i64) -> PaymentNotification {
    PaymentNotification {
        channel: Channel::Bca,
        external_reference: ExternalReference::new(reference),
        account_key: BCA_ACCOUNT.to_string(),
        amount: Money(amount),
        currency: Currency::idr(),
        paid_at: None,
    }
}

pub(super) struct Harness<S = InMemoryLedgerStore> {
    pub(super) service: ReconciliationService<S, RecordingAlerts>,
    pub(super) store: Arc<S>,
    pub(super) alerts: Arc<RecordingAlerts>,
    pub(super) queue: DispatchQueue,
}

pub(super) fn build_service() -> Harness {
    build_service_with(ReconciliationConfig::default())
}

pub(super) fn build_service_with(config: ReconciliationConfig) -> Harness {
    harness_over(seeded_store(), config)
}

pub(super) fn build_faulty_service() -> Harness<FaultyStore> {
    let store = Arc::new(FaultyStore::new(seeded_store().as_ref().clone()));
    harness_over(store, ReconciliationConfig::default())
}

fn harness_over<S: LedgerStore + 'static>(store: Arc<S>, config: ReconciliationConfig) -> Harness<S> {
    let alerts = Arc::new(RecordingAlerts::default());
    let (dispatcher, queue) = Dispatcher::channel();
    let service = ReconciliationService::new(store.clone(), alerts.clone(), dispatcher, config);
    Harness {
        service,
        store,
        alerts,
        queue,
    }
}

pub(super) fn router_for(service: TestService) -> axum::Router {
    reconciliation_router(Arc::new(service))
}

/// In-memory store with switchable faults: obligation reads that return an
/// earlier snapshot, and read outages that begin right after a commit.
pub(super) struct FaultyStore {
    inner: InMemoryLedgerStore,
    stale: Mutex<Option<(Vec<Obligation>, usize)>>,
    fail_reads_after_commit: AtomicBool,
    reads_down: AtomicBool,
}

impl FaultyStore {
    fn new(inner: InMemoryLedgerStore) -> Self {
        Self {
            inner,
            stale: Mutex::new(None),
            fail_reads_after_commit: AtomicBool::new(false),
            reads_down: AtomicBool::new(false),
        }
    }

    pub(super) fn inner(&self) -> &InMemoryLedgerStore {
        &self.inner
    }

    /// The next `times` obligation reads return `snapshot`.
    pub(super) fn serve_stale_obligations(&self, snapshot: Vec<Obligation>, times: usize) {
        *self.stale.lock().expect("stale mutex poisoned") = Some((snapshot, times));
    }

    pub(super) fn fail_reads_after_next_commit(&self) {
        self.fail_reads_after_commit.store(true, Ordering::SeqCst);
    }

    pub(super) fn recover(&self) {
        self.reads_down.store(false, Ordering::SeqCst);
        *self.stale.lock().expect("stale mutex poisoned") = None;
    }

    fn read(&self) -> Result<(), StoreError> {
        if self.reads_down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("read replica offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl LedgerStore for FaultyStore {
    fn lock_transaction(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError> {
        self.inner.lock_transaction(id, timeout)
    }

    fn get_or_create_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<(PendingTransaction, bool), StoreError> {
        self.inner.get_or_create_transaction(draft)
    }

    fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<PendingTransaction>, StoreError> {
        self.read()?;
        self.inner.fetch_transaction(id)
    }

    fn find_by_reference(
        &self,
        channel: &Channel,
        reference: &ExternalReference,
    ) -> Result<Option<PendingTransaction>, StoreError> {
        self.read()?;
        self.inner.find_by_reference(channel, reference)
    }

    fn save_transaction(
        &self,
        lock: &RowLock,
        transaction: PendingTransaction,
    ) -> Result<(), StoreError> {
        self.inner.save_transaction(lock, transaction)
    }

    fn outstanding_obligations(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<Obligation>, StoreError> {
        self.read()?;
        let mut stale = self.stale.lock().expect("stale mutex poisoned");
        if let Some((snapshot, remaining)) = stale.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(snapshot.clone());
            }
        }
        drop(stale);
        self.inner.outstanding_obligations(customer)
    }

    fn obligations(&self, customer: &CustomerId) -> Result<Vec<Obligation>, StoreError> {
        self.read()?;
        self.inner.obligations(customer)
    }

    fn insert_obligation(&self, obligation: Obligation) -> Result<(), StoreError> {
        self.inner.insert_obligation(obligation)
    }

    fn commit(&self, lock: &RowLock, work: UnitOfWork) -> Result<Committed, StoreError> {
        let committed = self.inner.commit(lock, work)?;
        if self.fail_reads_after_commit.swap(false, Ordering::SeqCst) {
            self.reads_down.store(true, Ordering::SeqCst);
        }
        Ok(committed)
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.read()?;
        self.inner.ledger_entries()
    }

    fn entries_for_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.read()?;
        self.inner.entries_for_transaction(id)
    }

    fn credit_balance(&self, customer: &CustomerId) -> Result<Money, StoreError> {
        self.read()?;
        self.inner.credit_balance(customer)
    }

    fn register_account(
        &self,
        channel: Channel,
        account_key: &str,
        customer: CustomerId,
    ) -> Result<(), StoreError> {
        self.inner.register_account(channel, account_key, customer)
    }

    fn resolve_account(
        &self,
        channel: &Channel,
        account_key: &str,
    ) -> Result<Option<CustomerId>, StoreError> {
        self.inner.resolve_account(channel, account_key)
    }
}

#[derive(Default)]
pub(super) struct RecordingAlerts {
    events: Mutex<Vec<OperatorAlert>>,
}

impl RecordingAlerts {
    pub(super) fn events(&self) -> Vec<OperatorAlert> {
        self.events.lock().expect("alert mutex poisoned").clone()
    }
}

impl AlertPublisher for RecordingAlerts {
    fn publish(&self, alert: OperatorAlert) -> Result<(), AlertError> {
        self.events
            .lock()
            .expect("alert mutex poisoned")
            .push(alert);
        Ok(())
    }
}

/// Replays scripted results, then succeeds; records every attempt.
#[derive(Default)]
pub(super) struct ScriptedNotifier {
    script: Mutex<VecDeque<Result<(), NotifyError>>>,
    attempts: Mutex<Vec<&'static str>>,
}

impl ScriptedNotifier {
    pub(super) fn failing(times: usize) -> Self {
        let notifier = Self::default();
        {
            let mut script = notifier.script.lock().expect("script mutex poisoned");
            for _ in 0..times {
                script.push_back(Err(NotifyError::Rejected {
                    status: 503,
                    body: "partner gateway busy".to_string(),
                }));
            }
        }
        notifier
    }

    pub(super) fn attempts(&self) -> Vec<&'static str> {
        self.attempts.lock().expect("attempt mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    async fn deliver(&self, effect: &SideEffect) -> Result<(), NotifyError> {
        self.attempts
            .lock()
            .expect("attempt mutex poisoned")
            .push(effect.label());
        self.script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

pub(super) fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) async fn read_text_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    String::from_utf8(body.to_vec()).expect("utf-8 body")
}
