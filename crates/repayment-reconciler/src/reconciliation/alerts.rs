use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::dispatch::{DispatchError, Dispatcher, SideEffect};
use super::domain::{Channel, ExternalReference, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Operator-facing alert raised when a notification cannot be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub severity: AlertSeverity,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    pub external_reference: ExternalReference,
    pub kind: String,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

/// Outbound alert hook (chat webhook, pager, e-mail adapters).
pub trait AlertPublisher: Send + Sync {
    fn publish(&self, alert: OperatorAlert) -> Result<(), AlertError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert transport unavailable: {0}")]
    Transport(String),
}

impl From<DispatchError> for AlertError {
    fn from(value: DispatchError) -> Self {
        AlertError::Transport(value.to_string())
    }
}

/// Routes alerts through the side-effect queue so delivery retries happen off
/// the request path.
#[derive(Debug, Clone)]
pub struct QueuedAlertPublisher {
    dispatcher: Dispatcher,
}

impl QueuedAlertPublisher {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl AlertPublisher for QueuedAlertPublisher {
    fn publish(&self, alert: OperatorAlert) -> Result<(), AlertError> {
        self.dispatcher.enqueue(SideEffect::OperatorAlert(alert))?;
        Ok(())
    }
}
