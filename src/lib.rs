//! Call billing worker
//!
//! Drains completed-call events from a message queue, bills each call
//! against the balance service and records the charge. A fixed number of
//! workers poll the queue concurrently and shut down together.

pub mod billing;
pub mod config;
pub mod database;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod queue;
pub mod telemetry;
pub mod worker;

pub use error::{AppError, AppResult};
pub use pool::WorkerPool;
pub use worker::{IterationOutcome, Worker, WorkerSettings};

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
