use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;

use super::{Committed, LedgerStore, StoreError, TransactionDraft, UnitOfWork};
use crate::reconciliation::domain::{
    Channel, CustomerId, ExternalReference, LedgerEntry, LedgerEntryId, Money, Obligation,
    ObligationId, PendingTransaction, TransactionId, TransactionStatus,
};
use crate::reconciliation::guard::{RowLock, RowLocks};

#[derive(Debug, Default)]
struct LedgerState {
    transactions: HashMap<TransactionId, PendingTransaction>,
    references: HashMap<(Channel, ExternalReference), TransactionId>,
    obligations: BTreeMap<ObligationId, Obligation>,
    entries: Vec<LedgerEntry>,
    credits: HashMap<CustomerId, Money>,
    accounts: HashMap<(Channel, String), CustomerId>,
    transaction_sequence: u64,
    entry_sequence: u64,
    commit_fault: Option<usize>,
}

/// Process-local store. A single mutex guards every table, so each method is
/// atomic; row locks are tracked separately so waiting on one transaction
/// never blocks others.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    locks: Arc<RowLocks>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            locks: RowLocks::new(),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure: the next commit aborts after staging
    /// `after_entries` ledger entries, before anything is published.
    pub fn inject_commit_fault(&self, after_entries: usize) {
        self.state().commit_fault = Some(after_entries);
    }

    pub fn is_locked(&self, id: &TransactionId) -> bool {
        self.locks.is_held(id)
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_lock(&self, lock: &RowLock, id: &TransactionId) -> Result<(), StoreError> {
        if lock.belongs_to(&self.locks) && lock.transaction_id() == id {
            Ok(())
        } else {
            Err(StoreError::LockNotHeld(id.clone()))
        }
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn lock_transaction(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError> {
        self.locks.acquire(id, timeout)
    }

    fn get_or_create_transaction(
        &self,
        draft: TransactionDraft,
    ) -> Result<(PendingTransaction, bool), StoreError> {
        let mut state = self.state();
        let key = (draft.channel.clone(), draft.external_reference.clone());

        if let Some(existing) = state.references.get(&key) {
            let transaction = state
                .transactions
                .get(existing)
                .cloned()
                .ok_or_else(|| StoreError::TransactionNotFound(existing.clone()))?;
            return Ok((transaction, false));
        }

        state.transaction_sequence += 1;
        let id = TransactionId(format!("txn-{:06}", state.transaction_sequence));
        let transaction = PendingTransaction {
            id: id.clone(),
            channel: draft.channel,
            external_reference: draft.external_reference,
            customer_id: draft.customer_id,
            amount: draft.amount,
            currency: draft.currency,
            status: TransactionStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: draft.received_at,
            updated_at: draft.received_at,
        };

        state.references.insert(key, id.clone());
        state.transactions.insert(id, transaction.clone());
        Ok((transaction, true))
    }

    fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<PendingTransaction>, StoreError> {
        Ok(self.state().transactions.get(id).cloned())
    }

    fn find_by_reference(
        &self,
        channel: &Channel,
        reference: &ExternalReference,
    ) -> Result<Option<PendingTransaction>, StoreError> {
        let state = self.state();
        let key = (channel.clone(), reference.clone());
        Ok(state
            .references
            .get(&key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    fn save_transaction(
        &self,
        lock: &RowLock,
        transaction: PendingTransaction,
    ) -> Result<(), StoreError> {
        self.ensure_lock(lock, &transaction.id)?;
        let mut state = self.state();
        match state.transactions.get_mut(&transaction.id) {
            Some(slot) => {
                *slot = transaction;
                Ok(())
            }
            None => Err(StoreError::TransactionNotFound(transaction.id)),
        }
    }

    fn outstanding_obligations(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<Obligation>, StoreError> {
        let mut open: Vec<Obligation> = self
            .obligations(customer)?
            .into_iter()
            .filter(|item| item.outstanding().is_positive())
            .collect();
        open.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        Ok(open)
    }

    fn obligations(&self, customer: &CustomerId) -> Result<Vec<Obligation>, StoreError> {
        Ok(self
            .state()
            .obligations
            .values()
            .filter(|item| &item.customer_id == customer)
            .cloned()
            .collect())
    }

    fn insert_obligation(&self, obligation: Obligation) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.obligations.contains_key(&obligation.id) {
            return Err(StoreError::ObligationConflict(obligation.id));
        }
        state.obligations.insert(obligation.id.clone(), obligation);
        Ok(())
    }

    fn commit(&self, lock: &RowLock, work: UnitOfWork) -> Result<Committed, StoreError> {
        self.ensure_lock(lock, &work.transaction_id)?;
        let mut state = self.state();
        let fault = state.commit_fault.take();

        let mut transaction = state
            .transactions
            .get(&work.transaction_id)
            .cloned()
            .ok_or_else(|| StoreError::TransactionNotFound(work.transaction_id.clone()))?;
        transaction.status = transaction
            .status
            .transition(TransactionStatus::Processed)
            .map_err(|err| StoreError::InvalidState(err.to_string()))?;

        let mut staged_obligations = Vec::with_capacity(work.obligations.len());
        for updated in work.obligations {
            let current = state
                .obligations
                .get(&updated.id)
                .ok_or_else(|| StoreError::ObligationNotFound(updated.id.clone()))?;
            if current.version != updated.version {
                return Err(StoreError::StaleObligation {
                    id: updated.id,
                    expected: updated.version,
                    found: current.version,
                });
            }
            if current.customer_id != work.customer_id {
                return Err(StoreError::InvalidState(format!(
                    "obligation {} does not belong to customer {}",
                    updated.id, work.customer_id
                )));
            }
            let mut next = updated;
            next.version += 1;
            staged_obligations.push(next);
        }

        let recorded_at = Utc::now();
        let mut sequence = state.entry_sequence;
        let mut staged_entries = Vec::with_capacity(work.lines.len());
        for line in work.lines {
            if fault.is_some_and(|after| staged_entries.len() >= after) {
                return Err(injected_fault(staged_entries.len()));
            }
            sequence += 1;
            staged_entries.push(LedgerEntry {
                id: LedgerEntryId(format!("le-{sequence:06}")),
                transaction_id: work.transaction_id.clone(),
                customer_id: work.customer_id.clone(),
                obligation_id: line.obligation_id,
                bucket: line.bucket,
                amount: line.amount,
                recorded_at,
            });
        }
        if fault.is_some() {
            return Err(injected_fault(staged_entries.len()));
        }

        let current_credit = state
            .credits
            .get(&work.customer_id)
            .copied()
            .unwrap_or_default();
        let next_credit = current_credit
            .checked_add(work.credit)
            .ok_or_else(|| StoreError::BalanceOverflow(work.customer_id.clone()))?;

        // Publish: nothing below can fail.
        state.entry_sequence = sequence;
        for obligation in staged_obligations {
            state.obligations.insert(obligation.id.clone(), obligation);
        }
        state.entries.extend(staged_entries.iter().cloned());
        if work.credit.is_positive() {
            state.credits.insert(work.customer_id, next_credit);
        }
        transaction.last_error = None;
        transaction.updated_at = recorded_at;
        state
            .transactions
            .insert(transaction.id.clone(), transaction.clone());

        Ok(Committed {
            transaction,
            entries: staged_entries,
        })
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.state().entries.clone())
    }

    fn entries_for_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .state()
            .entries
            .iter()
            .filter(|entry| &entry.transaction_id == id)
            .cloned()
            .collect())
    }

    fn credit_balance(&self, customer: &CustomerId) -> Result<Money, StoreError> {
        Ok(self
            .state()
            .credits
            .get(customer)
            .copied()
            .unwrap_or_default())
    }

    fn register_account(
        &self,
        channel: Channel,
        account_key: &str,
        customer: CustomerId,
    ) -> Result<(), StoreError> {
        self.state()
            .accounts
            .insert((channel, account_key.trim().to_string()), customer);
        Ok(())
    }

    fn resolve_account(
        &self,
        channel: &Channel,
        account_key: &str,
    ) -> Result<Option<CustomerId>, StoreError> {
        let key = (channel.clone(), account_key.trim().to_string());
        Ok(self.state().accounts.get(&key).cloned())
    }
}

fn injected_fault(staged: usize) -> StoreError {
    StoreError::Unavailable(format!(
        "commit aborted after staging {staged} ledger entries"
    ))
}
