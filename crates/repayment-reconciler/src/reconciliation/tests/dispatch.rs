use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::common::*;
use crate::reconciliation::alerts::{
    AlertPublisher, AlertSeverity, OperatorAlert, QueuedAlertPublisher,
};
use crate::reconciliation::dispatch::{
    deliver_with_retry, DispatchError, DispatchWorker, Dispatcher, Notifier, NotifyError,
    RetryPolicy, SideEffect,
};
use crate::reconciliation::domain::{
    Channel, ExternalReference, TransactionId, TransactionStatus,
};

fn analytics() -> SideEffect {
    SideEffect::AnalyticsEvent {
        name: "repayment_received".to_string(),
        customer_id: customer(),
        properties: BTreeMap::new(),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_delivered() {
    let notifier = ScriptedNotifier::failing(2);

    let attempts = deliver_with_retry(&notifier, &analytics(), &fast_retry(5))
        .await
        .expect("delivered");

    assert_eq!(attempts, 3);
    assert_eq!(notifier.attempts().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_a_downstream_failure() {
    let notifier = ScriptedNotifier::failing(10);

    match deliver_with_retry(&notifier, &analytics(), &fast_retry(3)).await {
        Err(DispatchError::DownstreamNotificationFailure {
            effect, attempts, ..
        }) => {
            assert_eq!(effect, "analytics_event");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected downstream failure, got {other:?}"),
    }
    assert_eq!(notifier.attempts().len(), 3);
}

#[tokio::test]
async fn worker_delivers_committed_effects_and_stops_when_senders_close() {
    let store = seeded_store();
    let alerts = Arc::new(RecordingAlerts::default());
    let (dispatcher, queue) = Dispatcher::channel();
    let service = crate::reconciliation::service::ReconciliationService::new(
        store,
        alerts,
        dispatcher,
        crate::config::ReconciliationConfig::default(),
    );
    service
        .reconcile(notification("REQ-1", 115_000))
        .expect("reconciled");
    drop(service);

    let notifier = Arc::new(ScriptedNotifier::failing(1));
    let summary = DispatchWorker::new(queue, notifier.clone(), fast_retry(3))
        .run()
        .await;

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.failed, 0);
    let mut attempts = notifier.attempts();
    assert_eq!(attempts.len(), 4);
    attempts.sort_unstable();
    attempts.dedup();
    assert_eq!(attempts, vec!["analytics_event", "crm_sync", "partner_ack"]);
}

/// CRM is down for good; every other downstream accepts.
#[derive(Default)]
struct CrmOutage {
    delivered: Mutex<Vec<&'static str>>,
    partner_acked: Notify,
}

impl CrmOutage {
    fn delivered(&self) -> Vec<&'static str> {
        self.delivered.lock().expect("delivery mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for CrmOutage {
    async fn deliver(&self, effect: &SideEffect) -> Result<(), NotifyError> {
        if let SideEffect::CrmSync { .. } = effect {
            return Err(NotifyError::Transport("connection refused".to_string()));
        }
        self.delivered
            .lock()
            .expect("delivery mutex poisoned")
            .push(effect.label());
        if let SideEffect::PartnerAck { .. } = effect {
            self.partner_acked.notify_one();
        }
        Ok(())
    }
}

#[tokio::test]
async fn failing_downstream_does_not_hold_back_partner_acks() {
    let (dispatcher, queue) = Dispatcher::channel();
    dispatcher
        .enqueue(SideEffect::CrmSync {
            customer_id: customer(),
            attributes: BTreeMap::new(),
        })
        .expect("queued");
    dispatcher
        .enqueue(SideEffect::PartnerAck {
            channel: Channel::Bca,
            external_reference: ExternalReference::new("REQ-1"),
            transaction_id: TransactionId::new("txn-000001"),
            status: TransactionStatus::Processed,
        })
        .expect("queued");

    let notifier = Arc::new(CrmOutage::default());
    let slow_retry = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
    };
    let worker = tokio::spawn(DispatchWorker::new(queue, notifier.clone(), slow_retry).run());

    tokio::time::timeout(Duration::from_secs(5), notifier.partner_acked.notified())
        .await
        .expect("partner ack delivered while crm is still backing off");
    assert_eq!(notifier.delivered(), vec!["partner_ack"]);

    drop(dispatcher);
    worker.abort();
}

#[tokio::test]
async fn queued_alerts_travel_through_the_dispatcher() {
    let (dispatcher, mut queue) = Dispatcher::channel();
    let publisher = QueuedAlertPublisher::new(dispatcher);

    publisher
        .publish(OperatorAlert {
            severity: AlertSeverity::Critical,
            channel: Channel::Dana,
            transaction_id: None,
            external_reference: ExternalReference::new("ORD-1"),
            kind: "store_failure".to_string(),
            message: "commit aborted".to_string(),
            details: BTreeMap::new(),
        })
        .expect("queued");

    let queued = queue.drain_pending();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].label(), "operator_alert");

    drop(publisher);
    assert!(queue.recv().await.is_none());
}
