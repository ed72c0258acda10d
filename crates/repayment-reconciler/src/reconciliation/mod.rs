//! Payment reconciliation: turn channel callbacks into ledger entries exactly once.
//!
//! A notification is resolved to its transaction row, guarded by a row lock and the
//! transaction status, allocated across the customer's obligations and committed as
//! one unit of work. Downstream notifications are queued only after the commit.

pub mod alerts;
pub mod audit;
pub mod channels;
pub mod dispatch;
pub mod domain;
pub mod guard;
pub mod ledger;
pub mod resolver;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use alerts::{AlertError, AlertPublisher, AlertSeverity, OperatorAlert, QueuedAlertPublisher};
pub use audit::{ledger_csv, write_ledger_csv, AuditExportError};
pub use channels::{
    BcaVirtualAccountPayment, ChannelPayload, CredgenicsPayment, DanaAmount,
    DanaRepaymentNotification, NormalizationError, OvoPushNotification,
};
pub use dispatch::{
    DispatchError, DispatchQueue, DispatchWorker, Dispatcher, HttpNotifier, NotificationTargets,
    Notifier, NotifyError, PostCommit, RetryPolicy, SideEffect,
};
pub use domain::{
    Channel, Currency, CustomerId, ExternalReference, LedgerBucket, LedgerEntry, Money,
    Obligation, ObligationId, ObligationStatus, PaymentNotification, PendingTransaction,
    TransactionId, TransactionStatus,
};
pub use guard::{GuardDecision, GuardError, IdempotencyGuard, RowLock};
pub use ledger::{Allocation, BucketPriority, ChannelPolicy, LedgerApplier, OverpaymentPolicy};
pub use resolver::{ResolveError, TransactionIdentityResolver};
pub use router::reconciliation_router;
pub use service::{
    CustomerStatement, Receipt, ReconciliationError, ReconciliationOutcome, ReconciliationService,
};
pub use store::{Committed, InMemoryLedgerStore, LedgerStore, StoreError, UnitOfWork};
