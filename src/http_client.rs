//! Outbound HTTP calls with retry handling
//!
//! Generic resilient request execution, independent of billing semantics.
//! A [`RequestSpec`] describes one logical call; [`RequestHandler::fetch`]
//! performs it, re-attempting while the retry budget lasts and the retry
//! condition accepts the last status code. Transport timeouts surface as a
//! synthetic `408` so callers treat them like any other status.

use reqwest::{header::HeaderMap, Client, Method};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{error::AppResult, metrics::WorkerMetrics};

/// Retry interval applied when retries are requested without an interval
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Request timeout applied when none is given
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Status reported for a request that timed out in transport
pub const TIMEOUT_STATUS: u16 = 408;
/// Status reported for any other transport failure
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

/// Status codes retried by [`default_retry_condition`]
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 5] = [429, 408, 507, 504, 503];

const MAX_IDLE_CONNECTIONS: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Decides from a response status whether another attempt should be made
pub type RetryCondition = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Retries only on the transient statuses in [`DEFAULT_RETRY_STATUS_CODES`]
pub fn default_retry_condition(status: u16) -> bool {
    DEFAULT_RETRY_STATUS_CODES.contains(&status)
}

/// Request body encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyType {
    #[default]
    Json,
    Form,
}

/// Credentials sent as an HTTP basic `Authorization` header
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Describes one outbound call, built fresh for every request
#[derive(Clone)]
pub struct RequestSpec {
    pub url: String,
    pub method: Method,
    pub body_type: BodyType,
    pub headers: HashMap<String, String>,
    pub params: Map<String, Value>,
    pub timeout: Option<Duration>,
    pub basic_auth: Option<BasicAuth>,
    pub retry_count: u32,
    pub retry_interval: Option<Duration>,
    pub retry_condition: Option<RetryCondition>,
}

impl RequestSpec {
    /// A GET request to `url` with no retries
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            body_type: BodyType::default(),
            headers: HashMap::new(),
            params: Map::new(),
            timeout: None,
            basic_auth: None,
            retry_count: 0,
            retry_interval: None,
            retry_condition: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn body_type(mut self, body_type: BodyType) -> Self {
        self.body_type = body_type;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn retries(mut self, count: u32, interval: Option<Duration>) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    pub fn retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    fn effective_timeout(&self) -> Duration {
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_TIMEOUT,
        }
    }

    fn effective_retry_interval(&self) -> Duration {
        match self.retry_interval {
            Some(interval) if !interval.is_zero() => interval,
            _ => DEFAULT_RETRY_INTERVAL,
        }
    }

    fn should_retry(&self, status: u16) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(status),
            None => default_retry_condition(status),
        }
    }

    fn sends_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD && !self.params.is_empty()
    }
}

impl fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("body_type", &self.body_type)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("basic_auth", &self.basic_auth)
            .field("retry_count", &self.retry_count)
            .field("retry_interval", &self.retry_interval)
            .field("retry_condition", &self.retry_condition.is_some())
            .finish()
    }
}

/// Final attempt of a call. Earlier attempts are only visible in logs.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

impl HttpResponse {
    fn transport_failure(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes [`RequestSpec`]s on a pooled client
#[derive(Clone)]
pub struct RequestHandler {
    app_name: String,
    client: Client,
    metrics: Option<WorkerMetrics>,
}

impl RequestHandler {
    /// Creates a handler with a keep-alive connection pool
    pub fn new(app_name: impl Into<String>) -> AppResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .build()?;

        Ok(Self {
            app_name: app_name.into(),
            client,
            metrics: None,
        })
    }

    /// Records every attempt into `metrics`
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sends the request, retrying while the retry condition holds, and returns
    /// the last attempt
    pub async fn fetch(&self, spec: &RequestSpec) -> HttpResponse {
        let timeout = spec.effective_timeout();
        let retry_interval = spec.effective_retry_interval();

        info!(
            app = %self.app_name,
            http_method = %spec.method,
            url = %spec.url,
            http_timeout_ms = timeout.as_millis() as u64,
            http_require_auth = spec.basic_auth.is_some(),
            http_retry_count = spec.retry_count,
            http_retry_interval_ms = retry_interval.as_millis() as u64,
            "prepared and sending http request"
        );

        let mut response = HttpResponse::transport_failure(TRANSPORT_FAILURE_STATUS);
        let mut attempt: u32 = 0;

        while attempt <= spec.retry_count {
            if attempt >= 1 {
                if !spec.should_retry(response.status) {
                    break;
                }
                warn!(
                    app = %self.app_name,
                    url = %spec.url,
                    status = response.status,
                    "retry attempt {} out of {}",
                    attempt,
                    spec.retry_count
                );
                sleep(retry_interval).await;
            }

            let started = Instant::now();
            response = self.attempt(spec, timeout).await;
            let elapsed = started.elapsed();

            info!(
                app = %self.app_name,
                http_method = %spec.method,
                url = %spec.url,
                attempt = attempt + 1,
                http_response_code = response.status,
                http_response_body = %response.body_text(),
                http_time_elapsed_secs = %format!("{:.4}", elapsed.as_secs_f64()),
                "http response received"
            );

            if let Some(metrics) = &self.metrics {
                metrics.record_http_attempt(&self.app_name, response.status, elapsed);
            }

            attempt += 1;
        }

        response
    }

    /// One attempt; transport errors are folded into a synthetic status
    async fn attempt(&self, spec: &RequestSpec, timeout: Duration) -> HttpResponse {
        let request = self.build_request(spec, timeout);

        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(err) => return self.transport_error(spec, timeout, err),
        };

        let status = upstream.status().as_u16();
        let headers = upstream.headers().clone();
        let body = match upstream.bytes().await {
            Ok(body) => body.to_vec(),
            Err(err) => {
                // The status already arrived; only the body is lost
                error!(
                    app = %self.app_name,
                    url = %spec.url,
                    http_method = %spec.method,
                    http_response_code = status,
                    "failed to read response body: {}",
                    err
                );
                Vec::new()
            }
        };

        HttpResponse {
            status,
            body,
            headers,
        }
    }

    fn build_request(&self, spec: &RequestSpec, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(spec.method.clone(), &spec.url)
            .timeout(timeout);

        if let Some(auth) = &spec.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        for (name, value) in &spec.headers {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            builder = builder.header(name, value.trim());
        }

        if spec.sends_body() {
            debug!(body_type = ?spec.body_type, "attaching request body");
            builder = match spec.body_type {
                BodyType::Json => builder.json(&spec.params),
                BodyType::Form => builder.form(&spec.params),
            };
        }

        builder
    }

    fn transport_error(
        &self,
        spec: &RequestSpec,
        timeout: Duration,
        err: reqwest::Error,
    ) -> HttpResponse {
        if err.is_timeout() {
            error!(
                app = %self.app_name,
                url = %spec.url,
                http_method = %spec.method,
                "timeout encountered with request timeout set to {} milliseconds: {}",
                timeout.as_millis(),
                err
            );
            HttpResponse::transport_failure(TIMEOUT_STATUS)
        } else {
            error!(
                app = %self.app_name,
                url = %spec.url,
                http_method = %spec.method,
                headers = ?spec.headers,
                params = ?spec.params,
                "request failed: {}",
                err
            );
            HttpResponse::transport_failure(TRANSPORT_FAILURE_STATUS)
        }
    }
}
