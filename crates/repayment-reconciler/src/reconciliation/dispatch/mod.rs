//! Downstream notifications that run strictly after the ledger commit.
//!
//! Effects are buffered in a [`PostCommit`] while the ledger work is in
//! flight and only handed to the [`Dispatcher`] once the commit succeeded.
//! A [`DispatchWorker`] drains the queue on the async runtime and retries
//! each delivery independently of the financial mutation.

mod http;
mod worker;

pub use http::{HttpNotifier, NotificationTargets};
pub use worker::{
    deliver_with_retry, DispatchSummary, DispatchWorker, Notifier, NotifyError, DEFAULT_MAX_IN_FLIGHT,
};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::alerts::OperatorAlert;
use super::domain::{Channel, CustomerId, ExternalReference, TransactionId, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    CrmSync {
        customer_id: CustomerId,
        attributes: BTreeMap<String, serde_json::Value>,
    },
    PartnerAck {
        channel: Channel,
        external_reference: ExternalReference,
        transaction_id: TransactionId,
        status: TransactionStatus,
    },
    AnalyticsEvent {
        name: String,
        customer_id: CustomerId,
        properties: BTreeMap<String, serde_json::Value>,
    },
    OperatorAlert(OperatorAlert),
}

impl SideEffect {
    pub fn label(&self) -> &'static str {
        match self {
            SideEffect::CrmSync { .. } => "crm_sync",
            SideEffect::PartnerAck { .. } => "partner_ack",
            SideEffect::AnalyticsEvent { .. } => "analytics_event",
            SideEffect::OperatorAlert(_) => "operator_alert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("side-effect queue is closed")]
    QueueClosed,
    #[error("{effect} delivery failed after {attempts} attempts: {reason}")]
    DownstreamNotificationFailure {
        effect: &'static str,
        attempts: u32,
        reason: String,
    },
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Sending half of the side-effect queue. Enqueueing never blocks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<SideEffect>,
}

/// Receiving half, owned by a [`DispatchWorker`].
#[derive(Debug)]
pub struct DispatchQueue {
    receiver: mpsc::UnboundedReceiver<SideEffect>,
}

impl Dispatcher {
    pub fn channel() -> (Dispatcher, DispatchQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Dispatcher { sender }, DispatchQueue { receiver })
    }

    pub fn enqueue(&self, effect: SideEffect) -> Result<(), DispatchError> {
        self.sender
            .send(effect)
            .map_err(|_| DispatchError::QueueClosed)
    }
}

impl DispatchQueue {
    pub async fn recv(&mut self) -> Option<SideEffect> {
        self.receiver.recv().await
    }

    /// Take whatever is queued right now without waiting.
    pub fn drain_pending(&mut self) -> Vec<SideEffect> {
        let mut drained = Vec::new();
        while let Ok(effect) = self.receiver.try_recv() {
            drained.push(effect);
        }
        drained
    }
}

/// Effects collected during an attempt, released only after commit.
#[derive(Debug, Default)]
pub struct PostCommit {
    effects: Vec<SideEffect>,
}

impl PostCommit {
    pub fn push(&mut self, effect: SideEffect) {
        self.effects.push(effect);
    }

    pub fn release(self, dispatcher: &Dispatcher) -> Result<usize, DispatchError> {
        let count = self.effects.len();
        for effect in self.effects {
            dispatcher.enqueue(effect)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analytics(name: &str) -> SideEffect {
        SideEffect::AnalyticsEvent {
            name: name.to_string(),
            customer_id: CustomerId::new("cust-1"),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn post_commit_releases_in_order() {
        let (dispatcher, mut queue) = Dispatcher::channel();
        let mut buffer = PostCommit::default();
        buffer.push(analytics("first"));
        buffer.push(analytics("second"));

        assert_eq!(buffer.release(&dispatcher), Ok(2));
        let drained = queue.drain_pending();
        assert_eq!(drained, vec![analytics("first"), analytics("second")]);
    }

    #[test]
    fn dropped_buffer_never_reaches_the_queue() {
        let (_dispatcher, mut queue) = Dispatcher::channel();
        let mut buffer = PostCommit::default();
        buffer.push(analytics("rolled-back"));
        drop(buffer);
        assert!(queue.drain_pending().is_empty());
    }

    #[test]
    fn enqueue_fails_once_worker_is_gone() {
        let (dispatcher, queue) = Dispatcher::channel();
        drop(queue);
        assert_eq!(
            dispatcher.enqueue(analytics("late")),
            Err(DispatchError::QueueClosed)
        );
    }

    #[test]
    fn effects_serialize_with_an_effect_tag() {
        let effect = SideEffect::PartnerAck {
            channel: Channel::Ovo,
            external_reference: ExternalReference::new("AUTH-1"),
            transaction_id: TransactionId::new("txn-000001"),
            status: TransactionStatus::Processed,
        };
        let json = serde_json::to_value(&effect).expect("serializes");
        assert_eq!(json["effect"], "partner_ack");
        assert_eq!(json["channel"], "ovo");
        assert_eq!(json["status"], "processed");
    }
}
