use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::domain::{Channel, CustomerId, ExternalReference, Money, PaymentNotification, PendingTransaction};
use super::store::{LedgerStore, StoreError, TransactionDraft};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub transaction: PendingTransaction,
    pub created: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no customer is registered for {channel} account '{account_key}'")]
    UnknownAccount { channel: Channel, account_key: String },
    #[error("reference {external_reference} was first delivered with amount {stored}, now {received}")]
    AmountMismatch {
        external_reference: ExternalReference,
        stored: Money,
        received: Money,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Maps a channel reference onto the internal transaction row, creating it on
/// first delivery.
pub struct TransactionIdentityResolver<S> {
    store: Arc<S>,
}

impl<S> TransactionIdentityResolver<S>
where
    S: LedgerStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn resolve_customer(
        &self,
        channel: &Channel,
        account_key: &str,
    ) -> Result<CustomerId, ResolveError> {
        self.store
            .resolve_account(channel, account_key)?
            .ok_or_else(|| ResolveError::UnknownAccount {
                channel: channel.clone(),
                account_key: account_key.to_string(),
            })
    }

    pub fn resolve(
        &self,
        notification: &PaymentNotification,
    ) -> Result<ResolvedTransaction, ResolveError> {
        let customer_id = self.resolve_customer(&notification.channel, &notification.account_key)?;

        let draft = TransactionDraft {
            channel: notification.channel.clone(),
            external_reference: notification.external_reference.clone(),
            customer_id,
            amount: notification.amount,
            currency: notification.currency.clone(),
            received_at: Utc::now(),
        };
        let (transaction, created) = self.store.get_or_create_transaction(draft)?;

        if !created
            && (transaction.amount != notification.amount
                || transaction.currency != notification.currency)
        {
            return Err(ResolveError::AmountMismatch {
                external_reference: notification.external_reference.clone(),
                stored: transaction.amount,
                received: notification.amount,
            });
        }

        debug!(
            transaction_id = %transaction.id,
            channel = %transaction.channel,
            external_reference = %transaction.external_reference,
            created,
            "notification resolved"
        );

        Ok(ResolvedTransaction {
            transaction,
            created,
        })
    }
}
