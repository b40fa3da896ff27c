//! Background job consumer.
//!
//! Connects to the broker, consumes preview jobs, runs each one on its own
//! task and publishes the result. Any transport failure drops back to
//! `Disconnected` and retries after a fixed interval, forever, until the
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerSession, Delivery, Publish, QueueError};
use crate::config::Config;
use crate::models::{PreviewJob, PreviewResult};
use crate::preview::PreviewService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
}

#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    /// Delay between a transport failure and the next connect attempt.
    pub retry_interval: Duration,
    /// Upper bound on jobs being processed at once.
    pub max_in_flight: usize,
    pub result_queue: Arc<str>,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        ConsumerSettings {
            retry_interval: config.broker_retry_interval,
            max_in_flight: config.preview_workers,
            result_queue: Arc::from(config.result_queue.as_str()),
        }
    }
}

pub struct JobConsumer<B> {
    broker: B,
    previews: PreviewService,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl<B: Broker> JobConsumer<B> {
    pub fn new(broker: B, previews: PreviewService, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            broker,
            previews,
            settings,
            state,
        }
    }

    /// Observe state transitions. The current state is available immediately.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Job consumer state changed");
        }
    }

    /// Run until `cancel` fires. Never returns on its own.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Job consumer started");

        loop {
            self.transition(ConsumerState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.broker.connect() => result,
            };

            match connected {
                Ok(session) => {
                    tracing::info!("Consuming preview jobs");
                    self.transition(ConsumerState::Consuming);
                    match self.consume(session, &cancel).await {
                        Ok(()) => break,
                        Err(e) => tracing::warn!(
                            error = %e,
                            retry_in_ms = self.settings.retry_interval.as_millis() as u64,
                            "Lost broker connection"
                        ),
                    }
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    retry_in_ms = self.settings.retry_interval.as_millis() as u64,
                    "Failed to connect to broker"
                ),
            }

            self.transition(ConsumerState::Disconnected);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
            }
        }

        self.transition(ConsumerState::Disconnected);
        tracing::info!("Job consumer stopped");
    }

    /// Pull deliveries until cancelled (`Ok`) or the session fails (`Err`).
    ///
    /// Jobs still running when this returns are aborted along with the
    /// `JoinSet`; their messages were never acked, so the broker redelivers
    /// them.
    async fn consume(
        &self,
        mut session: Box<dyn BrokerSession>,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let publisher = session.publisher();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let max_in_flight = self.settings.max_in_flight.max(1);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_job_exit(joined);
                }
                next = session.next_delivery(), if in_flight.len() < max_in_flight => {
                    match next {
                        Some(Ok(delivery)) => {
                            in_flight.spawn(process_delivery(
                                self.previews.clone(),
                                Arc::clone(&publisher),
                                Arc::clone(&self.settings.result_queue),
                                delivery,
                            ));
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(QueueError::StreamClosed),
                    }
                }
            }
        }
    }
}

fn log_job_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Preview job task panicked");
        }
    }
}

/// Handle one job message end to end. Settles the delivery exactly once.
async fn process_delivery(
    previews: PreviewService,
    publisher: Arc<dyn Publish>,
    result_queue: Arc<str>,
    delivery: Delivery,
) {
    let Delivery { payload, acker } = delivery;

    let job: PreviewJob = match serde_json::from_slice(&payload) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, bytes = payload.len(), "Rejecting malformed preview job");
            if let Err(e) = acker.reject().await {
                tracing::warn!(error = %e, "Failed to reject malformed preview job");
            }
            return;
        }
    };

    tracing::debug!(url_id = %job.url_id, url = %job.original_url, "Processing preview job");

    let metadata = previews.preview(&job.original_url).await.into_metadata();
    let result = PreviewResult::completed(job.url_id, metadata);

    let body = match serde_json::to_vec(&result) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, url_id = %result.url_id, "Failed to encode preview result");
            if let Err(e) = acker.reject().await {
                tracing::warn!(error = %e, url_id = %result.url_id, "Failed to reject preview job");
            }
            return;
        }
    };

    match publisher.publish(&result_queue, &body).await {
        Ok(()) => {
            if let Err(e) = acker.ack().await {
                tracing::warn!(error = %e, url_id = %result.url_id, "Failed to ack preview job");
            } else {
                tracing::info!(url_id = %result.url_id, "Preview job completed");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, url_id = %result.url_id, "Failed to publish preview result");
            if let Err(e) = acker.requeue().await {
                tracing::warn!(
                    error = %e,
                    url_id = %result.url_id,
                    "Failed to requeue preview job"
                );
            }
        }
    }
}
