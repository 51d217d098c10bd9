//! Call billing worker
//!
//! Starts the worker pool and the telemetry server, then waits for SIGINT or
//! SIGTERM and closes both.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use call_billing_worker::{
    billing::{self, BillingClient},
    config::{Config, Environment},
    database::{BillingStore, Database},
    http_client::RequestHandler,
    metrics::WorkerMetrics,
    queue::{MessageQueue, PgQueue},
    telemetry::{self, TelemetryState},
    Worker, WorkerPool, WorkerSettings,
};

#[derive(Parser, Debug)]
#[command(name = "call-billing-worker", version, about)]
struct Args {
    /// Runtime environment, selects the config file
    #[arg(short, long, value_enum, default_value = "prod")]
    environment: Environment,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.environment)?;
    init_tracing(&config);

    info!(
        environment = ?args.environment,
        workers = config.worker.count,
        "Starting {} {}",
        call_billing_worker::NAME,
        call_billing_worker::VERSION
    );

    if config.queue.visibility_timeout() < config.batch_billing_budget() {
        warn!(
            visibility_timeout_secs = config.queue.visibility_timeout_secs,
            billing_budget_secs = config.batch_billing_budget().as_secs(),
            "Visibility timeout is shorter than a fully retried batch; slow batches may be billed twice"
        );
    }

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    let metrics = WorkerMetrics::new()?;

    let store: Arc<dyn BillingStore> = Arc::new(database.clone());
    let settings = WorkerSettings::from_config(&config);

    let pool = WorkerPool::new(config.worker.count, |id| {
        let queue: Arc<dyn MessageQueue> =
            Arc::new(PgQueue::new(database.get_pool().clone(), &config.queue));
        let handler = RequestHandler::new(billing::APP_NAME)?.with_metrics(metrics.clone());
        let client = BillingClient::with_handler(&config.balance_service, handler);

        Ok(Worker::new(
            id,
            queue,
            client,
            store.clone(),
            settings.clone(),
            metrics.clone(),
        ))
    })?;

    let telemetry_task = if config.telemetry.enabled {
        let state = TelemetryState {
            metrics: metrics.clone(),
            database: Some(database.clone()),
            expected_workers: pool.worker_count(),
        };
        let address = config.telemetry_address();
        let shutdown = pool.shutdown_token();
        Some(tokio::spawn(async move {
            if let Err(e) = telemetry::serve(&address, state, shutdown).await {
                error!("Telemetry server failed: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("Shutdown signal received, closing workers");

    let exited = pool.close().await;
    if let Some(task) = telemetry_task {
        let _ = task.await;
    }

    info!("Successfully closed {} workers, exiting", exited);
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));

    if config.telemetry.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
