mod memory;

pub use memory::InMemoryLedgerStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Channel, Currency, CustomerId, ExternalReference, LedgerEntry, Money, Obligation,
    ObligationId, PendingTransaction, TransactionId,
};
use super::guard::RowLock;
use super::ledger::LedgerLine;

/// Fields needed to create a transaction row on first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub channel: Channel,
    pub external_reference: ExternalReference,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub received_at: DateTime<Utc>,
}

/// Everything one successful attempt writes, applied all-or-nothing by
/// [`LedgerStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub transaction_id: TransactionId,
    pub customer_id: CustomerId,
    pub obligations: Vec<Obligation>,
    pub lines: Vec<LedgerLine>,
    pub credit: Money,
}

/// What a successful [`LedgerStore::commit`] published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub transaction: PendingTransaction,
    pub entries: Vec<LedgerEntry>,
}

impl UnitOfWork {
    pub fn total(&self) -> Money {
        self.lines.iter().map(|line| line.amount).sum()
    }
}

/// Persistence seam for transactions, obligations and the ledger.
///
/// Mutations that touch a transaction row take the caller's [`RowLock`] as
/// proof of exclusive access.
pub trait LedgerStore: Send + Sync {
    fn lock_transaction(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError>;

    /// Atomic get-or-create on `(channel, external_reference)`. The flag is
    /// `true` when this call created the row.
    fn get_or_create_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<(PendingTransaction, bool), StoreError>;

    fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<PendingTransaction>, StoreError>;

    fn find_by_reference(
        &self,
        channel: &Channel,
        reference: &ExternalReference,
    ) -> Result<Option<PendingTransaction>, StoreError>;

    fn save_transaction(
        &self,
        lock: &RowLock,
        transaction: PendingTransaction,
    ) -> Result<(), StoreError>;

    /// Obligations with a positive outstanding balance, oldest due date first.
    fn outstanding_obligations(&self, customer: &CustomerId)
        -> Result<Vec<Obligation>, StoreError>;

    fn obligations(&self, customer: &CustomerId) -> Result<Vec<Obligation>, StoreError>;

    fn insert_obligation(&self, obligation: Obligation) -> Result<(), StoreError>;

    /// Apply `work` and mark the transaction processed in one step. Either
    /// everything is published or nothing is.
    fn commit(&self, lock: &RowLock, work: UnitOfWork) -> Result<Committed, StoreError>;

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError>;

    fn entries_for_transaction(&self, id: &TransactionId)
        -> Result<Vec<LedgerEntry>, StoreError>;

    fn credit_balance(&self, customer: &CustomerId) -> Result<Money, StoreError>;

    fn register_account(
        &self,
        channel: Channel,
        account_key: &str,
        customer: CustomerId,
    ) -> Result<(), StoreError>;

    fn resolve_account(
        &self,
        channel: &Channel,
        account_key: &str,
    ) -> Result<Option<CustomerId>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for lock on transaction {transaction_id}")]
    LockTimeout {
        transaction_id: TransactionId,
        waited: Duration,
    },
    #[error("lock held does not cover transaction {0}")]
    LockNotHeld(TransactionId),
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),
    #[error("obligation {0} not found")]
    ObligationNotFound(ObligationId),
    #[error("obligation {0} already exists")]
    ObligationConflict(ObligationId),
    #[error("obligation {id} changed concurrently (expected version {expected}, found {found})")]
    StaleObligation {
        id: ObligationId,
        expected: u64,
        found: u64,
    },
    #[error("credit balance for customer {0} would overflow")]
    BalanceOverflow(CustomerId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
