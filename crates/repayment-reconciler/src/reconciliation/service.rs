use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::alerts::{AlertPublisher, AlertSeverity, OperatorAlert};
use super::channels::{check_amount, ChannelPayload, NormalizationError};
use super::dispatch::{Dispatcher, PostCommit, SideEffect};
use super::domain::{
    Channel, CustomerId, ExternalReference, InvalidTransition, LedgerEntry, Money, Obligation,
    PaymentNotification, PendingTransaction, TransactionId, TransactionStatus,
};
use super::guard::{GuardDecision, GuardError, IdempotencyGuard, RowLock};
use super::ledger::{Allocation, LedgerApplier, LedgerError};
use super::resolver::{ResolveError, TransactionIdentityResolver};
use super::store::{Committed, LedgerStore, StoreError, UnitOfWork};
use crate::config::ReconciliationConfig;

/// Allocate-and-commit rounds allowed when another payment for the same
/// customer commits between our obligation read and our commit.
const MAX_ALLOCATION_ATTEMPTS: u32 = 3;

/// Orchestrates resolve → lock → allocate → commit → dispatch for one notification.
pub struct ReconciliationService<S, A> {
    store: Arc<S>,
    alerts: Arc<A>,
    dispatcher: Dispatcher,
    config: ReconciliationConfig,
    resolver: TransactionIdentityResolver<S>,
    guard: IdempotencyGuard<S>,
}

/// Result of a successful call; duplicates are successes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    Applied { receipt: Receipt },
    Duplicate { receipt: Receipt },
}

impl ReconciliationOutcome {
    pub fn receipt(&self) -> &Receipt {
        match self {
            ReconciliationOutcome::Applied { receipt }
            | ReconciliationOutcome::Duplicate { receipt } => receipt,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReconciliationOutcome::Duplicate { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub transaction_id: TransactionId,
    pub channel: Channel,
    pub external_reference: ExternalReference,
    pub customer_id: CustomerId,
    pub status: TransactionStatus,
    pub amount: Money,
    pub credit: Money,
    pub entries: Vec<LedgerEntry>,
}

impl Receipt {
    fn new(transaction: &PendingTransaction, entries: Vec<LedgerEntry>) -> Self {
        let credit: Money = entries
            .iter()
            .filter(|entry| entry.obligation_id.is_none())
            .map(|entry| entry.amount)
            .sum();

        Self {
            transaction_id: transaction.id.clone(),
            channel: transaction.channel.clone(),
            external_reference: transaction.external_reference.clone(),
            customer_id: transaction.customer_id.clone(),
            status: transaction.status,
            amount: transaction.amount,
            credit,
            entries,
        }
    }
}

/// Outstanding bill for a customer, as served to VA inquiry requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerStatement {
    pub customer_id: CustomerId,
    pub as_of: NaiveDate,
    pub obligations: Vec<Obligation>,
    pub total_outstanding: Money,
    pub credit_balance: Money,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("customer {customer_id} has no outstanding obligation")]
    UnknownObligation { customer_id: CustomerId },
    #[error("no customer is registered for {channel} account '{account_key}'")]
    UnknownAccount { channel: Channel, account_key: String },
    #[error("transaction {transaction_id} is being processed by another worker")]
    LockContention { transaction_id: TransactionId },
    #[error("overpayment rejected for {transaction_id}: amount {amount} exceeds outstanding {outstanding}")]
    OverpaymentRejected {
        transaction_id: TransactionId,
        amount: Money,
        outstanding: Money,
    },
    #[error("reference {external_reference} was first delivered with amount {stored}, now {received}")]
    AmountMismatch {
        external_reference: ExternalReference,
        stored: Money,
        received: Money,
    },
    #[error("ledger mismatch for {transaction_id}: allocated {allocated}, expected {expected}")]
    LedgerMismatch {
        transaction_id: TransactionId,
        expected: Money,
        allocated: Money,
    },
    #[error(transparent)]
    Invalid(#[from] NormalizationError),
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconciliationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconciliationError::UnknownObligation { .. } => "unknown_obligation",
            ReconciliationError::UnknownAccount { .. } => "unknown_account",
            ReconciliationError::LockContention { .. } => "lock_contention",
            ReconciliationError::OverpaymentRejected { .. } => "overpayment_rejected",
            ReconciliationError::AmountMismatch { .. } => "amount_mismatch",
            ReconciliationError::LedgerMismatch { .. } => "ledger_mismatch",
            ReconciliationError::Invalid(_) => "invalid_notification",
            ReconciliationError::InvalidState(_) => "invalid_state",
            ReconciliationError::Store(_) => "store_failure",
        }
    }

    /// Transient failures the channel may redeliver without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconciliationError::LockContention { .. }
                | ReconciliationError::Store(StoreError::StaleObligation { .. })
                | ReconciliationError::Store(StoreError::Unavailable(_))
        )
    }

    /// Hard failures propagate to the caller as server errors; the rest map to
    /// a defined client-facing response. A concurrent obligation update that
    /// outlasted every re-allocation is a conflict, not a fault.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconciliationError::LedgerMismatch { .. } | ReconciliationError::InvalidState(_) => {
                true
            }
            ReconciliationError::Store(StoreError::StaleObligation { .. }) => false,
            ReconciliationError::Store(_) => true,
            _ => false,
        }
    }

    fn severity(&self) -> AlertSeverity {
        if self.is_fatal() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

impl From<ResolveError> for ReconciliationError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::UnknownAccount {
                channel,
                account_key,
            } => ReconciliationError::UnknownAccount {
                channel,
                account_key,
            },
            ResolveError::AmountMismatch {
                external_reference,
                stored,
                received,
            } => ReconciliationError::AmountMismatch {
                external_reference,
                stored,
                received,
            },
            ResolveError::Store(err) => ReconciliationError::Store(err),
        }
    }
}

impl From<GuardError> for ReconciliationError {
    fn from(value: GuardError) -> Self {
        match value {
            GuardError::LockContention { transaction_id } => {
                ReconciliationError::LockContention { transaction_id }
            }
            GuardError::Transition(err) => ReconciliationError::InvalidState(err),
            GuardError::Store(err) => ReconciliationError::Store(err),
        }
    }
}

impl<S, A> ReconciliationService<S, A>
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    pub fn new(
        store: Arc<S>,
        alerts: Arc<A>,
        dispatcher: Dispatcher,
        config: ReconciliationConfig,
    ) -> Self {
        let resolver = TransactionIdentityResolver::new(Arc::clone(&store));
        let guard = IdempotencyGuard::new(Arc::clone(&store), config.lock_timeout);

        Self {
            store,
            alerts,
            dispatcher,
            config,
            resolver,
            guard,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Normalize a channel payload, then reconcile it.
    pub fn reconcile_payload(
        &self,
        payload: ChannelPayload,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        let channel = payload.channel();
        let notification = payload.normalize().map_err(|err| {
            warn!(%channel, error = %err, "rejected malformed channel payload");
            ReconciliationError::from(err)
        })?;
        self.reconcile(notification)
    }

    /// Apply one payment notification at most once.
    pub fn reconcile(
        &self,
        notification: PaymentNotification,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        check_amount(notification.amount)?;

        let resolved = match self.resolver.resolve(&notification) {
            Ok(resolved) => resolved,
            Err(err) => {
                let err = ReconciliationError::from(err);
                self.report_failure(&notification, None, &err);
                return Err(err);
            }
        };
        let transaction_id = resolved.transaction.id.clone();

        let lock = match self.guard.lock(&transaction_id) {
            Ok(lock) => lock,
            Err(err) => {
                let err = ReconciliationError::from(err);
                warn!(
                    transaction_id = %transaction_id,
                    channel = %notification.channel,
                    external_reference = %notification.external_reference,
                    "lock contention; channel may retry"
                );
                return Err(err);
            }
        };

        let decision = match self.guard.enter(&lock) {
            Ok(decision) => decision,
            Err(err) => {
                drop(lock);
                let err = ReconciliationError::from(err);
                self.report_failure(&notification, Some(&transaction_id), &err);
                return Err(err);
            }
        };

        let transaction = match decision {
            GuardDecision::AlreadyProcessed(transaction) => {
                drop(lock);
                info!(
                    transaction_id = %transaction.id,
                    channel = %transaction.channel,
                    external_reference = %transaction.external_reference,
                    "duplicate notification; already processed"
                );
                let receipt = self.receipt(&transaction)?;
                return Ok(ReconciliationOutcome::Duplicate { receipt });
            }
            GuardDecision::Proceed(transaction) => transaction,
        };

        let as_of = notification
            .paid_at
            .unwrap_or_else(Utc::now)
            .date_naive();

        let (committed, post_commit) = match self.apply(&lock, &transaction, as_of) {
            Ok(applied) => applied,
            Err(err) => {
                self.roll_back(&lock, transaction, &err);
                drop(lock);
                self.report_failure(&notification, Some(&transaction_id), &err);
                return Err(err);
            }
        };

        // The commit stands from here on; later problems are logged, never returned.
        drop(lock);
        let processed = committed.transaction;
        info!(
            transaction_id = %processed.id,
            channel = %processed.channel,
            external_reference = %processed.external_reference,
            customer_id = %processed.customer_id,
            amount = processed.amount.minor_units(),
            "payment reconciled"
        );
        match post_commit.release(&self.dispatcher) {
            Ok(count) => info!(transaction_id = %processed.id, count, "side effects queued"),
            Err(err) => warn!(
                transaction_id = %processed.id,
                error = %err,
                "side effects could not be queued; ledger commit stands"
            ),
        }

        Ok(ReconciliationOutcome::Applied {
            receipt: Receipt::new(&processed, committed.entries),
        })
    }

    /// Allocate against a fresh obligation read and commit. A stale obligation
    /// version means another payment for the customer committed first, so the
    /// allocation is redone under the same row lock.
    fn apply(
        &self,
        lock: &RowLock,
        transaction: &PendingTransaction,
        as_of: NaiveDate,
    ) -> Result<(Committed, PostCommit), ReconciliationError> {
        let applier = LedgerApplier::new(self.config.policy_for(&transaction.channel));
        let mut attempt = 1;

        loop {
            let obligations = self.store.outstanding_obligations(&transaction.customer_id)?;
            let allocation = applier
                .allocate(transaction.amount, &obligations, as_of)
                .map_err(|err| allocation_error(transaction, err))?;

            let work = UnitOfWork {
                transaction_id: transaction.id.clone(),
                customer_id: transaction.customer_id.clone(),
                obligations: allocation.obligations.clone(),
                lines: allocation.lines.clone(),
                credit: allocation.credit,
            };
            let allocated = work.total();
            if allocated != transaction.amount {
                return Err(ReconciliationError::LedgerMismatch {
                    transaction_id: transaction.id.clone(),
                    expected: transaction.amount,
                    allocated,
                });
            }

            let outstanding_before: Money = obligations.iter().map(Obligation::outstanding).sum();
            let post_commit = side_effects(transaction, &allocation, outstanding_before);

            match self.store.commit(lock, work) {
                Ok(committed) => return Ok((committed, post_commit)),
                Err(StoreError::StaleObligation { id, .. }) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(
                        transaction_id = %transaction.id,
                        obligation_id = %id,
                        attempt,
                        "obligation changed during allocation; re-allocating"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Staged ledger work is already discarded; record the failed attempt.
    fn roll_back(&self, lock: &RowLock, mut transaction: PendingTransaction, err: &ReconciliationError) {
        match transaction.status.transition(TransactionStatus::Failed) {
            Ok(status) => transaction.status = status,
            Err(transition) => {
                error!(transaction_id = %transaction.id, error = %transition, "cannot mark transaction failed");
                return;
            }
        }
        transaction.last_error = Some(err.to_string());
        transaction.updated_at = Utc::now();

        if let Err(store_err) = self.store.save_transaction(lock, transaction) {
            error!(
                transaction_id = %lock.transaction_id(),
                error = %store_err,
                "failed to persist failed status"
            );
        }
    }

    fn report_failure(
        &self,
        notification: &PaymentNotification,
        transaction_id: Option<&TransactionId>,
        err: &ReconciliationError,
    ) {
        error!(
            transaction_id = transaction_id.map(|id| id.as_str()).unwrap_or("-"),
            channel = %notification.channel,
            external_reference = %notification.external_reference,
            kind = err.kind(),
            error = %err,
            "reconciliation failed; ledger left untouched"
        );

        let mut details = BTreeMap::new();
        details.insert("account_key".to_string(), notification.account_key.clone());
        details.insert(
            "amount".to_string(),
            notification.amount.minor_units().to_string(),
        );
        details.insert("currency".to_string(), notification.currency.to_string());
        details.insert("retryable".to_string(), err.is_retryable().to_string());

        let alert = OperatorAlert {
            severity: err.severity(),
            channel: notification.channel.clone(),
            transaction_id: transaction_id.cloned(),
            external_reference: notification.external_reference.clone(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            details,
        };

        if let Err(alert_err) = self.alerts.publish(alert) {
            warn!(error = %alert_err, "operator alert could not be published");
        }
    }

    fn receipt(&self, transaction: &PendingTransaction) -> Result<Receipt, ReconciliationError> {
        let entries = self.store.entries_for_transaction(&transaction.id)?;
        Ok(Receipt::new(transaction, entries))
    }

    pub fn transaction(
        &self,
        id: &TransactionId,
    ) -> Result<PendingTransaction, ReconciliationError> {
        self.store
            .fetch_transaction(id)?
            .ok_or_else(|| StoreError::TransactionNotFound(id.clone()).into())
    }

    pub fn transaction_by_reference(
        &self,
        channel: &Channel,
        reference: &ExternalReference,
    ) -> Result<Option<PendingTransaction>, ReconciliationError> {
        Ok(self.store.find_by_reference(channel, reference)?)
    }

    pub fn statement(
        &self,
        customer_id: &CustomerId,
        as_of: NaiveDate,
    ) -> Result<CustomerStatement, ReconciliationError> {
        let mut obligations = self.store.outstanding_obligations(customer_id)?;
        for obligation in &mut obligations {
            obligation.refresh_status(as_of);
        }
        let total_outstanding: Money = obligations.iter().map(Obligation::outstanding).sum();
        let credit_balance = self.store.credit_balance(customer_id)?;

        Ok(CustomerStatement {
            customer_id: customer_id.clone(),
            as_of,
            obligations,
            total_outstanding,
            credit_balance,
        })
    }

    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>, ReconciliationError> {
        Ok(self.store.ledger_entries()?)
    }
}

fn allocation_error(transaction: &PendingTransaction, err: LedgerError) -> ReconciliationError {
    match err {
        LedgerError::NoOutstandingObligation => ReconciliationError::UnknownObligation {
            customer_id: transaction.customer_id.clone(),
        },
        LedgerError::OverpaymentRejected {
            amount,
            outstanding,
        } => ReconciliationError::OverpaymentRejected {
            transaction_id: transaction.id.clone(),
            amount,
            outstanding,
        },
        LedgerError::Mismatch {
            expected,
            allocated,
        } => ReconciliationError::LedgerMismatch {
            transaction_id: transaction.id.clone(),
            expected,
            allocated,
        },
        LedgerError::NonPositiveAmount(_) => NormalizationError::NonPositiveAmount.into(),
    }
}

/// CRM sync, partner ack and analytics for a payment about to commit. Built
/// from pre-commit data so nothing after the commit has to read the store.
fn side_effects(
    transaction: &PendingTransaction,
    allocation: &Allocation,
    outstanding_before: Money,
) -> PostCommit {
    let applied = allocation.total() - allocation.credit;
    let remaining = outstanding_before - applied;
    let mut post_commit = PostCommit::default();

    let mut attributes = BTreeMap::new();
    attributes.insert(
        "last_payment_amount".to_string(),
        json!(transaction.amount.minor_units()),
    );
    attributes.insert("last_payment_channel".to_string(), json!(transaction.channel));
    attributes.insert(
        "total_outstanding".to_string(),
        json!(remaining.minor_units()),
    );
    post_commit.push(SideEffect::CrmSync {
        customer_id: transaction.customer_id.clone(),
        attributes,
    });
    post_commit.push(SideEffect::PartnerAck {
        channel: transaction.channel.clone(),
        external_reference: transaction.external_reference.clone(),
        transaction_id: transaction.id.clone(),
        status: TransactionStatus::Processed,
    });

    let mut properties = BTreeMap::new();
    properties.insert("transaction_id".to_string(), json!(transaction.id));
    properties.insert(
        "amount".to_string(),
        json!(transaction.amount.minor_units()),
    );
    properties.insert(
        "obligations_touched".to_string(),
        json!(allocation.obligations.len()),
    );
    properties.insert("credit".to_string(), json!(allocation.credit.minor_units()));
    post_commit.push(SideEffect::AnalyticsEvent {
        name: "repayment_received".to_string(),
        customer_id: transaction.customer_id.clone(),
        properties,
    });

    post_commit
}
