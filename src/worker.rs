//! Queue-polling worker
//!
//! A worker repeatedly fetches a batch from the queue, bills every message in
//! it one after another, and acknowledges the messages that were billed and
//! persisted. Each iteration runs to completion; the shutdown token is only
//! consulted between iterations. Anything that goes wrong inside an
//! iteration, including a panic, ends that iteration as
//! [`IterationOutcome::Faulted`] and the loop carries on.

use futures::FutureExt;
use std::{any::Any, collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    billing::BillingClient,
    config::Config,
    database::BillingStore,
    error::AppResult,
    metrics::{FailureStage, WorkerMetrics},
    models::{BalanceResponse, BillingEvent, DeleteEntry, QueueMessage},
    queue::MessageQueue,
};

/// Polling and acknowledgement knobs for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_events: u32,
    pub wait_time: Duration,
    pub delete_retry_count: u32,
    pub fault_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_events: config.worker.max_events,
            wait_time: config.worker.wait_time(),
            delete_retry_count: config.queue.retry_count,
            fault_backoff: config.worker.fault_backoff(),
        }
    }
}

/// What a completed iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub received: usize,
    pub billed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub undeleted: usize,
}

/// Result of one fetch → process → delete pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed(IterationReport),
    Faulted(String),
}

/// One independent polling loop with its own queue handle and billing client
pub struct Worker {
    id: usize,
    queue: Arc<dyn MessageQueue>,
    billing: BillingClient,
    store: Arc<dyn BillingStore>,
    settings: WorkerSettings,
    metrics: WorkerMetrics,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn MessageQueue>,
        billing: BillingClient,
        store: Arc<dyn BillingStore>,
        settings: WorkerSettings,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            id,
            queue,
            billing,
            store,
            settings,
            metrics,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs iterations until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let span = info_span!(
            "worker",
            worker_id = self.id,
            transaction = %Uuid::new_v4()
        );

        async move {
            self.metrics.worker_started();
            info!("Worker {} started", self.id);

            while !shutdown.is_cancelled() {
                match self.run_iteration().await {
                    IterationOutcome::Completed(report) => {
                        if report.received > 0 {
                            info!(
                                received = report.received,
                                billed = report.billed,
                                skipped = report.skipped,
                                deleted = report.deleted,
                                undeleted = report.undeleted,
                                "Processed queue batch"
                            );
                        }
                    }
                    IterationOutcome::Faulted(reason) => {
                        error!(error = %reason, "Recovering worker after fault");
                        self.metrics.record_iteration_fault();

                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(self.settings.fault_backoff) => {}
                        }
                    }
                }
            }

            self.metrics.worker_stopped();
            info!("Successfully closed worker {}", self.id);
        }
        .instrument(span)
        .await
    }

    /// Runs one iteration, converting errors and panics into a fault
    pub async fn run_iteration(&self) -> IterationOutcome {
        match AssertUnwindSafe(self.iterate()).catch_unwind().await {
            Ok(Ok(report)) => IterationOutcome::Completed(report),
            Ok(Err(err)) => IterationOutcome::Faulted(err.to_string()),
            Err(panic) => IterationOutcome::Faulted(panic_message(panic.as_ref())),
        }
    }

    async fn iterate(&self) -> AppResult<IterationReport> {
        let messages = self.fetch().await?;
        if messages.is_empty() {
            debug!("Queue returned no messages");
            return Ok(IterationReport::default());
        }
        self.metrics.record_received(messages.len());

        let delete_entries = self.process_messages(&messages).await;
        let billed = delete_entries.len();
        let undeleted = self.delete_messages(delete_entries).await.len();

        Ok(IterationReport {
            received: messages.len(),
            billed,
            skipped: messages.len() - billed,
            deleted: billed - undeleted,
            undeleted,
        })
    }

    /// Long-polls the queue for the next batch
    pub async fn fetch(&self) -> AppResult<Vec<QueueMessage>> {
        self.queue
            .receive(self.settings.max_events, self.settings.wait_time)
            .await
    }

    /// Bills every message in order and returns the entries safe to delete
    ///
    /// A message lands in the result only if it decoded, was billed and its
    /// charge was persisted. Failures are logged and leave the message for
    /// redelivery without affecting the rest of the batch.
    pub async fn process_messages(&self, messages: &[QueueMessage]) -> Vec<DeleteEntry> {
        let mut delete_entries = Vec::new();

        for message in messages {
            let event = match BillingEvent::from_body(&message.body) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        message_id = %message.id,
                        body = %message.body,
                        "Error while decoding queue message: {}",
                        err
                    );
                    self.metrics.record_failure(FailureStage::Decode);
                    continue;
                }
            };

            match self.process_billing_event(&event).await {
                Ok(()) => {
                    self.metrics.record_billed();
                    delete_entries.push(message.delete_entry());
                }
                Err(stage) => {
                    self.metrics.record_failure(stage);
                    debug!(
                        message_id = %message.id,
                        call_id = %event.call_id,
                        stage = stage.as_str(),
                        "Message left for redelivery"
                    );
                }
            }
        }

        delete_entries
    }

    /// Bills one event and persists the charge
    async fn process_billing_event(&self, event: &BillingEvent) -> Result<(), FailureStage> {
        let outcome = self.billing.bill_user(event).await;
        if !outcome.success {
            return Err(FailureStage::Billing);
        }

        let balance = match BalanceResponse::from_slice(&outcome.body) {
            Ok(balance) => balance,
            Err(err) => {
                warn!(
                    call_id = %event.call_id,
                    "Unable to map balance response: {}",
                    err
                );
                return Err(FailureStage::Response);
            }
        };

        if balance.call_id != event.call_id {
            warn!(
                call_id = %event.call_id,
                response_call_id = %balance.call_id,
                "Balance response is for a different call"
            );
            return Err(FailureStage::Response);
        }

        if let Err(err) = self.store.update_call_info(&balance).await {
            warn!(call_id = %event.call_id, "Unable to persist billing cost: {}", err);
            return Err(FailureStage::Store);
        }

        Ok(())
    }

    /// Acknowledges processed messages, returning the entries still on the queue
    ///
    /// Makes at most `delete_retry_count` requests (at least one). A failed
    /// request retries the whole batch; rejected entries are logged and only
    /// those are retried.
    pub async fn delete_messages(&self, entries: Vec<DeleteEntry>) -> Vec<DeleteEntry> {
        if entries.is_empty() {
            return entries;
        }

        let attempts = self.settings.delete_retry_count.max(1);
        let mut remaining = entries;

        for attempt in 1..=attempts {
            match self.queue.delete_batch(&remaining).await {
                Ok(outcome) => {
                    self.metrics.record_deleted(outcome.successful.len());
                    if outcome.failed.is_empty() {
                        return Vec::new();
                    }

                    for failure in &outcome.failed {
                        warn!(
                            code = %failure.code,
                            id = %failure.id,
                            message = %failure.message,
                            sender_fault = failure.sender_fault,
                            "Error while deleting queue message"
                        );
                    }

                    let failed: HashSet<&str> =
                        outcome.failed.iter().map(|f| f.id.as_str()).collect();
                    remaining.retain(|entry| failed.contains(entry.id.as_str()));
                }
                Err(err) => {
                    warn!(
                        attempt,
                        attempts,
                        "Unable to delete messages from queue: {}",
                        err
                    );
                }
            }
        }

        if !remaining.is_empty() {
            warn!(
                count = remaining.len(),
                "Delete retries exhausted, messages will be redelivered"
            );
            self.metrics.record_delete_failures(remaining.len());
        }
        remaining
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic with non-string payload".to_string()
    }
}
