use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use super::{DispatchError, DispatchQueue, RetryPolicy, SideEffect};

/// Delivers one side effect to its downstream system.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, effect: &SideEffect) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("downstream rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Try `effect` up to `retry.attempts()` times, sleeping between failures.
/// Returns the number of attempts used.
pub async fn deliver_with_retry(
    notifier: &dyn Notifier,
    effect: &SideEffect,
    retry: &RetryPolicy,
) -> Result<u32, DispatchError> {
    let max_attempts = retry.attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match notifier.deliver(effect).await {
            Ok(()) => return Ok(attempt),
            Err(err) if attempt >= max_attempts => {
                return Err(DispatchError::DownstreamNotificationFailure {
                    effect: effect.label(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                let delay = retry.backoff(attempt);
                warn!(
                    effect = effect.label(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "side-effect delivery failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Deliveries in flight when the worker is not told otherwise.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

type Delivery = (&'static str, Result<u32, DispatchError>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchSummary {
    fn record(&mut self, joined: Result<Delivery, JoinError>) {
        match joined {
            Ok((effect, Ok(attempts))) => {
                self.delivered += 1;
                info!(effect, attempts, "side effect delivered");
            }
            Ok((effect, Err(err))) => {
                self.failed += 1;
                error!(
                    effect,
                    error = %err,
                    "side effect dropped after exhausting retries"
                );
            }
            Err(err) => {
                self.failed += 1;
                error!(error = %err, "side-effect delivery task aborted");
            }
        }
    }
}

/// Drains the side-effect queue. Each effect is delivered on its own task
/// with its own retry schedule, so a failing downstream never holds back
/// deliveries to the others.
pub struct DispatchWorker {
    queue: DispatchQueue,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    max_in_flight: usize,
}

impl DispatchWorker {
    pub fn new(queue: DispatchQueue, notifier: Arc<dyn Notifier>, retry: RetryPolicy) -> Self {
        Self {
            queue,
            notifier,
            retry,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Drain the queue until every [`Dispatcher`](super::Dispatcher) is dropped,
    /// then wait for deliveries still in flight.
    pub async fn run(mut self) -> DispatchSummary {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut deliveries: JoinSet<Delivery> = JoinSet::new();
        let mut summary = DispatchSummary::default();

        loop {
            tokio::select! {
                received = self.queue.recv() => {
                    let Some(effect) = received else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        error!(effect = effect.label(), "delivery permits closed; stopping worker");
                        break;
                    };
                    let notifier = Arc::clone(&self.notifier);
                    let retry = self.retry;
                    deliveries.spawn(async move {
                        let _permit = permit;
                        let result = deliver_with_retry(notifier.as_ref(), &effect, &retry).await;
                        (effect.label(), result)
                    });
                }
                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    summary.record(joined);
                }
            }
        }

        while let Some(joined) = deliveries.join_next().await {
            summary.record(joined);
        }

        summary
    }
}
