//! Fixed-size worker pool with coordinated shutdown

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    error::{AppError, AppResult},
    worker::Worker,
};

/// Owns the worker tasks and the shutdown signal they share
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    exited: Arc<AtomicUsize>,
}

/// Counts a worker as exited when its task ends, even by panic
struct ExitGuard(Arc<AtomicUsize>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Builds `worker_count` workers and starts each on its own task
    ///
    /// Workers are numbered from 1. Every worker is built before any is
    /// started, so a factory error leaves nothing running.
    pub fn new<F>(worker_count: usize, mut make_worker: F) -> AppResult<Self>
    where
        F: FnMut(usize) -> AppResult<Worker>,
    {
        if worker_count == 0 {
            return Err(AppError::Config(
                "worker count must be greater than 0".to_string(),
            ));
        }

        let workers = (1..=worker_count)
            .map(|id| {
                make_worker(id).map_err(|e| {
                    error!(worker_id = id, "Unable to create worker: {}", e);
                    e
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let shutdown = CancellationToken::new();
        let exited = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(worker_count);

        for worker in workers {
            let id = worker.id();
            let token = shutdown.clone();
            let guard = ExitGuard(exited.clone());

            handles.push(tokio::spawn(async move {
                let _guard = guard;
                worker.run(token).await;
            }));
            info!("Worker {} initialized successfully", id);
        }

        Ok(Self {
            shutdown,
            handles,
            exited,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Workers whose task has ended so far
    pub fn exited_workers(&self) -> usize {
        self.exited.load(Ordering::SeqCst)
    }

    /// Token cancelled when the pool starts closing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Signals every worker to stop and waits for all of them to exit
    ///
    /// In-flight iterations run to completion, including any pending retry
    /// sleeps. Returns the number of workers that exited.
    pub async fn close(mut self) -> usize {
        info!("Closing {} workers", self.handles.len());
        self.shutdown.cancel();

        let handles = std::mem::take(&mut self.handles);
        let results = futures::future::join_all(handles).await;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                error!(worker_id = index + 1, "Worker task ended abnormally: {}", err);
            }
        }

        let exited = self.exited_workers();
        info!("Successfully closed {} workers", exited);
        exited
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropped without close: stop the workers but don't wait for them.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        billing::BillingClient,
        config::BalanceServiceConfig,
        database::MemoryStore,
        metrics::WorkerMetrics,
        queue::MemoryQueue,
        worker::WorkerSettings,
    };
    use httpmock::prelude::*;
    use std::time::{Duration, Instant};

    fn balance_config(
        server: &MockServer,
        retry_count: u32,
        retry_interval_ms: u64,
    ) -> BalanceServiceConfig {
        BalanceServiceConfig {
            url: server.base_url(),
            username: "test".to_string(),
            password: "test".to_string(),
            timeout_ms: 1000,
            retry_count,
            retry_interval_ms,
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            max_events: 2,
            wait_time: Duration::from_millis(20),
            delete_retry_count: 2,
            fault_backoff: Duration::from_millis(10),
        }
    }

    fn factory(
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStore>,
        config: BalanceServiceConfig,
        metrics: WorkerMetrics,
    ) -> impl FnMut(usize) -> AppResult<Worker> {
        move |id| {
            Ok(Worker::new(
                id,
                queue.clone(),
                BillingClient::new(&config)?,
                store.clone(),
                settings(),
                metrics.clone(),
            ))
        }
    }

    fn event_body(call_id: &str) -> String {
        serde_json::json!({
            "user_id": 1,
            "product_id": 2,
            "call_id": call_id,
            "answer_time": "2021-07-01 00:30:00",
            "hangup_time": "2021-07-01 01:00:00"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_zero_workers_is_rejected() {
        let result = WorkerPool::new(0, |_| -> AppResult<Worker> {
            Err(AppError::Internal("never called".to_string()))
        });
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_factory_error_starts_nothing() {
        let server = MockServer::start_async().await;
        let metrics = WorkerMetrics::new().unwrap();
        let mut make = factory(
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryStore::new()),
            balance_config(&server, 0, 10),
            metrics.clone(),
        );

        let result = WorkerPool::new(3, |id| {
            if id == 3 {
                Err(AppError::Config("bad worker".to_string()))
            } else {
                make(id)
            }
        });

        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(metrics.workers_running(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_every_worker() {
        let server = MockServer::start_async().await;
        let metrics = WorkerMetrics::new().unwrap();
        let pool = WorkerPool::new(
            3,
            factory(
                Arc::new(MemoryQueue::new()),
                Arc::new(MemoryStore::new()),
                balance_config(&server, 0, 10),
                metrics.clone(),
            ),
        )
        .unwrap();
        let observer = pool.shutdown_token();

        assert_eq!(pool.worker_count(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.exited_workers(), 0);

        assert_eq!(pool.close().await, 3);
        assert!(observer.is_cancelled());
        assert_eq!(metrics.workers_running(), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/Billing/1");
                then.status(200)
                    .body(r#"{"call_id": "shared", "charge_amount": "0.50"}"#);
            })
            .await;

        let queue = Arc::new(MemoryQueue::new());
        for index in 0..6 {
            queue.push(&format!("m{}", index), &event_body("shared")).await;
        }
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(
            2,
            factory(
                queue.clone(),
                store.clone(),
                balance_config(&server, 0, 10),
                WorkerMetrics::new().unwrap(),
            ),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.deleted_ids().await.len() < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.close().await, 2);
        assert_eq!(queue.deleted_ids().await.len(), 6);
        assert_eq!(mock.hits_async().await, 6);
    }

    #[tokio::test]
    async fn test_close_lets_retry_sleep_finish() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/Billing/1");
                then.status(503);
            })
            .await;

        let queue = Arc::new(MemoryQueue::new());
        queue.push("m1", &event_body("call-1")).await;
        let pool = WorkerPool::new(
            1,
            factory(
                queue.clone(),
                Arc::new(MemoryStore::new()),
                balance_config(&server, 1, 300),
                WorkerMetrics::new().unwrap(),
            ),
        )
        .unwrap();

        // First attempt is done and the worker is sleeping before its retry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();

        assert_eq!(pool.close().await, 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(mock.hits_async().await, 2);
        assert!(queue.deleted_ids().await.is_empty());
        assert_eq!(queue.in_flight_ids().await, vec!["m1".to_string()]);
    }
}
