//! Balance service client
//!
//! Turns a [`BillingEvent`] into a `POST /Billing/{user_id}` call and reports
//! whether the service accepted it. Non-200 answers are ordinary outcomes
//! here, never errors: the worker decides what to do with them.

use reqwest::Method;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error};

use crate::{
    config::BalanceServiceConfig,
    error::AppResult,
    http_client::{RequestHandler, RequestSpec},
    models::BillingEvent,
};

/// Status the balance service answers with when a call was charged
pub const BILLING_SUCCESS_STATUS: u16 = 200;

/// Application name used in request logs and metrics labels
pub const APP_NAME: &str = "balance_api";

/// Result of a billing call
#[derive(Debug, Clone)]
pub struct BillingOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    pub success: bool,
}

/// Client for the external balance service, owned by a single worker
#[derive(Clone)]
pub struct BillingClient {
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
    retry_count: u32,
    retry_interval: Duration,
    request: RequestHandler,
}

impl BillingClient {
    /// Creates a client with its own request handler
    pub fn new(config: &BalanceServiceConfig) -> AppResult<Self> {
        Ok(Self::with_handler(config, RequestHandler::new(APP_NAME)?))
    }

    /// Creates a client on top of an existing request handler
    pub fn with_handler(config: &BalanceServiceConfig, request: RequestHandler) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.timeout(),
            retry_count: config.retry_count,
            retry_interval: config.retry_interval(),
            request,
        }
    }

    /// Bills the user for a completed call
    pub async fn bill_user(&self, event: &BillingEvent) -> BillingOutcome {
        let url = format!("{}/Billing/{}", self.base_url, event.user_id);
        let spec = RequestSpec::new(url)
            .method(Method::POST)
            .params(Self::request_body(event))
            .basic_auth(&self.username, &self.password)
            .timeout(self.timeout)
            .retries(self.retry_count, Some(self.retry_interval));

        let response = self.request.fetch(&spec).await;
        let success = response.status == BILLING_SUCCESS_STATUS;

        if success {
            debug!(
                call_id = %event.call_id,
                response_code = response.status,
                response = %response.body_text(),
                "Response for billing from API"
            );
        } else {
            error!(
                call_id = %event.call_id,
                "Failed to call billing api: {} -- {}",
                response.status,
                response.body_text()
            );
        }

        BillingOutcome {
            status: response.status,
            body: response.body,
            success,
        }
    }

    fn request_body(event: &BillingEvent) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("product_id".to_string(), json!(event.product_id));
        params.insert("call_id".to_string(), json!(event.call_id));
        params.insert("answer_time".to_string(), json!(event.answer_time));
        params.insert("hangup_time".to_string(), json!(event.hangup_time));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const RESPONSE_BODY: &str =
        r#"{"call_id": "e21b0dda-6566-402a-8f8c-0657e5b87eeb", "charge_amount": 1.2}"#;

    fn billing_event() -> BillingEvent {
        BillingEvent {
            user_id: 1,
            product_id: 2,
            call_id: "e21b0dda-6566-402a-8f8c-0657e5b87eeb".to_string(),
            answer_time: "2021-07-01 00:30:00".to_string(),
            hangup_time: "2021-07-01 01:00:00".to_string(),
        }
    }

    fn client_for(server: &MockServer, retry_count: u32) -> BillingClient {
        let config = BalanceServiceConfig {
            url: server.base_url(),
            username: "test".to_string(),
            password: "test".to_string(),
            timeout_ms: 1000,
            retry_count,
            retry_interval_ms: 20,
        };
        BillingClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_positive_bill_user() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/Billing/1")
                    .header("authorization", "Basic dGVzdDp0ZXN0")
                    .json_body(json!({
                        "product_id": 2,
                        "call_id": "e21b0dda-6566-402a-8f8c-0657e5b87eeb",
                        "answer_time": "2021-07-01 00:30:00",
                        "hangup_time": "2021-07-01 01:00:00"
                    }));
                then.status(200).body(RESPONSE_BODY);
            })
            .await;

        let outcome = client_for(&server, 2).bill_user(&billing_event()).await;

        assert!(outcome.success);
        assert_eq!(outcome.status, 200);
        assert_eq!(String::from_utf8(outcome.body).unwrap(), RESPONSE_BODY);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_negative_bill_user() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/Billing/1");
                then.status(400).body(RESPONSE_BODY);
            })
            .await;

        let outcome = client_for(&server, 2).bill_user(&billing_event()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, 400);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_service_is_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/Billing/1");
                then.status(503);
            })
            .await;

        let outcome = client_for(&server, 2).bill_user(&billing_event()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, 503);
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn test_other_success_codes_are_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/Billing/1");
                then.status(201).body(RESPONSE_BODY);
            })
            .await;

        let outcome = client_for(&server, 0).bill_user(&billing_event()).await;
        assert!(!outcome.success);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = BalanceServiceConfig {
            url: "https://balance-svc-dev.com/".to_string(),
            ..BalanceServiceConfig::default()
        };
        let client = BillingClient::new(&config).unwrap();
        assert_eq!(client.base_url, "https://balance-svc-dev.com");
    }
}
