//! Row-level locking and the at-most-once gate in front of the ledger.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use super::domain::{InvalidTransition, PendingTransaction, TransactionId, TransactionStatus};
use super::store::{LedgerStore, StoreError};

/// Table of exclusively held transaction rows.
#[derive(Debug, Default)]
pub struct RowLocks {
    held: Mutex<HashSet<TransactionId>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until `id` is free or `timeout` elapses.
    pub fn acquire(
        self: &Arc<Self>,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        while held.contains(id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout {
                    transaction_id: id.clone(),
                    waited: timeout,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }

        held.insert(id.clone());
        Ok(RowLock {
            id: id.clone(),
            table: Arc::clone(self),
        })
    }

    pub fn is_held(&self, id: &TransactionId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Exclusive hold on one transaction row. Released on drop, whether the
/// surrounding work committed or rolled back.
#[derive(Debug)]
pub struct RowLock {
    id: TransactionId,
    table: Arc<RowLocks>,
}

impl RowLock {
    pub fn transaction_id(&self) -> &TransactionId {
        &self.id
    }

    pub(crate) fn belongs_to(&self, table: &Arc<RowLocks>) -> bool {
        Arc::ptr_eq(&self.table, table)
    }
}

impl Drop for RowLock {
    fn drop(&mut self) {
        let mut held = self
            .table
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.id);
        self.table.released.notify_all();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Already processed; the caller answers success without touching the ledger.
    AlreadyProcessed(PendingTransaction),
    /// Moved to `processing`; the caller owns the attempt.
    Proceed(PendingTransaction),
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("transaction {transaction_id} is locked by another worker")]
    LockContention { transaction_id: TransactionId },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for GuardError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::LockTimeout { transaction_id, .. } => {
                GuardError::LockContention { transaction_id }
            }
            other => GuardError::Store(other),
        }
    }
}

pub struct IdempotencyGuard<S> {
    store: Arc<S>,
    lock_timeout: Duration,
}

impl<S> IdempotencyGuard<S>
where
    S: LedgerStore,
{
    pub fn new(store: Arc<S>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_timeout,
        }
    }

    pub fn lock(&self, id: &TransactionId) -> Result<RowLock, GuardError> {
        let lock = self.store.lock_transaction(id, self.lock_timeout)?;
        debug!(transaction_id = %id, "row lock acquired");
        Ok(lock)
    }

    /// Inspect the locked row and decide whether this delivery may apply funds.
    pub fn enter(&self, lock: &RowLock) -> Result<GuardDecision, GuardError> {
        let id = lock.transaction_id();
        let mut transaction = self
            .store
            .fetch_transaction(id)?
            .ok_or_else(|| StoreError::TransactionNotFound(id.clone()))?;

        match transaction.status {
            TransactionStatus::Processed => return Ok(GuardDecision::AlreadyProcessed(transaction)),
            TransactionStatus::Processing => {
                warn!(
                    transaction_id = %id,
                    attempts = transaction.attempts,
                    "recovering transaction left in processing by an earlier worker"
                );
            }
            TransactionStatus::Pending | TransactionStatus::Failed => {
                transaction.status = transaction
                    .status
                    .transition(TransactionStatus::Processing)?;
            }
        }

        transaction.attempts += 1;
        transaction.updated_at = Utc::now();
        self.store.save_transaction(lock, transaction.clone())?;

        Ok(GuardDecision::Proceed(transaction))
    }
}
