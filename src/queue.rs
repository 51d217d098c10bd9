//! Message queue adapter
//!
//! [`MessageQueue`] is the narrow contract workers rely on: long-poll for a
//! batch of messages, then acknowledge the ones that were fully processed.
//! Delivery is at-least-once. A received message stays invisible for the
//! visibility timeout and is redelivered if it is not deleted in time.
//!
//! [`PgQueue`] implements the contract on a Postgres table, claiming rows
//! with `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the
//! same visible message twice.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    error::AppResult,
    models::{DeleteBatchOutcome, DeleteEntry, DeleteFailure, QueueMessage},
};

/// Failure code for an entry whose receipt handle no longer matches a delivery
pub const INVALID_RECEIPT_HANDLE: &str = "ReceiptHandleIsInvalid";
/// Failure code for an entry whose message id is malformed
pub const INVALID_ID: &str = "InvalidIdFormat";

/// Queue operations used by a worker
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Waits up to `wait` for at least one message and returns at most
    /// `max_messages`. An empty result is not an error.
    async fn receive(&self, max_messages: u32, wait: Duration) -> AppResult<Vec<QueueMessage>>;

    /// Acknowledges deliveries. `Err` means the request itself failed;
    /// per-entry rejections are reported in the outcome.
    async fn delete_batch(&self, entries: &[DeleteEntry]) -> AppResult<DeleteBatchOutcome>;

    /// Enqueues a message body, returning its id
    async fn send(&self, body: &str) -> AppResult<String>;
}

/// Postgres-backed queue on the `billing_queue` table
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            visibility_timeout: config.visibility_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Claims up to `max_messages` visible rows and hides them for the visibility timeout
    async fn claim(&self, max_messages: u32) -> AppResult<Vec<QueueMessage>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String, i32)>(
            r#"
            UPDATE billing_queue SET
                receipt_handle = gen_random_uuid(),
                visible_at = now() + make_interval(secs => $2),
                receive_count = receive_count + 1
            WHERE id IN (
                SELECT id FROM billing_queue
                WHERE visible_at <= now()
                ORDER BY enqueued_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, receipt_handle, body, receive_count
            "#,
        )
        .bind(i64::from(max_messages))
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, receipt_handle, body, receive_count)| {
                if receive_count > 1 {
                    warn!(message_id = %id, receive_count, "Message redelivered");
                }
                QueueMessage {
                    id: id.to_string(),
                    receipt_handle: receipt_handle.to_string(),
                    body,
                }
            })
            .collect())
    }
}

#[async_trait]
impl MessageQueue for PgQueue {
    async fn receive(&self, max_messages: u32, wait: Duration) -> AppResult<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            let messages = self.claim(max_messages).await?;
            if !messages.is_empty() {
                debug!("Received {} messages", messages.len());
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete_batch(&self, entries: &[DeleteEntry]) -> AppResult<DeleteBatchOutcome> {
        let mut outcome = DeleteBatchOutcome::default();
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let (id, receipt_handle) = match (
                Uuid::parse_str(&entry.id),
                Uuid::parse_str(&entry.receipt_handle),
            ) {
                (Ok(id), Ok(receipt_handle)) => (id, receipt_handle),
                (Err(_), _) => {
                    outcome.failed.push(DeleteFailure {
                        id: entry.id.clone(),
                        code: INVALID_ID.to_string(),
                        message: "message id is not a valid UUID".to_string(),
                        sender_fault: true,
                    });
                    continue;
                }
                (_, Err(_)) => {
                    outcome.failed.push(DeleteFailure {
                        id: entry.id.clone(),
                        code: INVALID_RECEIPT_HANDLE.to_string(),
                        message: "receipt handle is not a valid UUID".to_string(),
                        sender_fault: true,
                    });
                    continue;
                }
            };

            let result =
                sqlx::query("DELETE FROM billing_queue WHERE id = $1 AND receipt_handle = $2")
                    .bind(id)
                    .bind(receipt_handle)
                    .execute(&mut *tx)
                    .await?;

            if result.rows_affected() == 0 {
                outcome.failed.push(DeleteFailure {
                    id: entry.id.clone(),
                    code: INVALID_RECEIPT_HANDLE.to_string(),
                    message: "message was redelivered or already deleted".to_string(),
                    sender_fault: true,
                });
            } else {
                outcome.successful.push(entry.id.clone());
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn send(&self, body: &str) -> AppResult<String> {
        let id: Uuid =
            sqlx::query_scalar("INSERT INTO billing_queue (body) VALUES ($1) RETURNING id")
                .bind(body)
                .fetch_one(&self.pool)
                .await?;
        Ok(id.to_string())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryQueue;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct State {
        pending: VecDeque<(String, String)>,
        in_flight: HashMap<String, (String, String)>,
        deleted: Vec<String>,
        rejected_ids: HashSet<String>,
        failing_receives: u32,
        failing_deletes: u32,
        delete_calls: u32,
    }

    /// In-memory queue with injectable failures. In-flight messages are only
    /// redelivered when [`MemoryQueue::redeliver`] is called.
    #[derive(Default)]
    pub struct MemoryQueue {
        state: Mutex<State>,
    }

    impl MemoryQueue {
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueues a message with a caller-chosen id
        pub async fn push(&self, id: &str, body: &str) {
            self.state
                .lock()
                .await
                .pending
                .push_back((id.to_string(), body.to_string()));
        }

        /// The next `count` receive calls fail
        pub async fn fail_receives(&self, count: u32) {
            self.state.lock().await.failing_receives = count;
        }

        /// The next `count` delete requests fail as a whole
        pub async fn fail_deletes(&self, count: u32) {
            self.state.lock().await.failing_deletes = count;
        }

        /// Deletes for `id` are always rejected per entry
        pub async fn reject_delete_of(&self, id: &str) {
            self.state.lock().await.rejected_ids.insert(id.to_string());
        }

        /// Makes every in-flight message visible again with a fresh handle
        pub async fn redeliver(&self) {
            let mut state = self.state.lock().await;
            let in_flight: Vec<_> = state.in_flight.drain().collect();
            for (id, (_, body)) in in_flight {
                state.pending.push_back((id, body));
            }
        }

        pub async fn pending_count(&self) -> usize {
            self.state.lock().await.pending.len()
        }

        pub async fn in_flight_ids(&self) -> Vec<String> {
            let mut ids: Vec<_> = self.state.lock().await.in_flight.keys().cloned().collect();
            ids.sort();
            ids
        }

        pub async fn deleted_ids(&self) -> Vec<String> {
            self.state.lock().await.deleted.clone()
        }

        pub async fn delete_calls(&self) -> u32 {
            self.state.lock().await.delete_calls
        }

        async fn take(&self, max_messages: u32, new_call: bool) -> AppResult<Vec<QueueMessage>> {
            let mut state = self.state.lock().await;
            if new_call && state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(crate::queue_error!("injected receive failure"));
            }

            let mut messages = Vec::new();
            while messages.len() < max_messages as usize {
                let Some((id, body)) = state.pending.pop_front() else {
                    break;
                };
                let receipt_handle = Uuid::new_v4().to_string();
                state
                    .in_flight
                    .insert(id.clone(), (receipt_handle.clone(), body.clone()));
                messages.push(QueueMessage {
                    id,
                    receipt_handle,
                    body,
                });
            }
            Ok(messages)
        }
    }

    #[async_trait]
    impl MessageQueue for MemoryQueue {
        async fn receive(
            &self,
            max_messages: u32,
            wait: Duration,
        ) -> AppResult<Vec<QueueMessage>> {
            let messages = self.take(max_messages, true).await?;
            if !messages.is_empty() || wait.is_zero() {
                return Ok(messages);
            }

            sleep(wait).await;
            self.take(max_messages, false).await
        }

        async fn delete_batch(&self, entries: &[DeleteEntry]) -> AppResult<DeleteBatchOutcome> {
            let mut state = self.state.lock().await;
            state.delete_calls += 1;

            if state.failing_deletes > 0 {
                state.failing_deletes -= 1;
                return Err(crate::queue_error!("injected delete failure"));
            }

            let mut outcome = DeleteBatchOutcome::default();
            for entry in entries {
                let matches = state
                    .in_flight
                    .get(&entry.id)
                    .map(|(handle, _)| handle == &entry.receipt_handle)
                    .unwrap_or(false);

                if matches && !state.rejected_ids.contains(&entry.id) {
                    state.in_flight.remove(&entry.id);
                    state.deleted.push(entry.id.clone());
                    outcome.successful.push(entry.id.clone());
                } else {
                    outcome.failed.push(DeleteFailure {
                        id: entry.id.clone(),
                        code: INVALID_RECEIPT_HANDLE.to_string(),
                        message: "receipt handle does not match an in-flight delivery"
                            .to_string(),
                        sender_fault: true,
                    });
                }
            }
            Ok(outcome)
        }

        async fn send(&self, body: &str) -> AppResult<String> {
            let id = Uuid::new_v4().to_string();
            self.push(&id, body).await;
            Ok(id)
        }
    }
}
