//! Queue and billing data models
//!
//! Wire types exchanged with the queue, the balance service and the store.
//! The call identifier is the correlation key that ties a billing event to
//! its balance response and to the row updated in `call_info`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A completed call waiting to be charged, decoded from a queue message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub user_id: i64,
    pub product_id: i64,
    pub call_id: String,
    pub answer_time: String,
    pub hangup_time: String,
}

impl BillingEvent {
    /// Decodes a raw queue message body
    pub fn from_body(body: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Charge computed by the balance service for a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub call_id: String,
    #[serde(default)]
    pub total_consumed_units: i64,
    // Accepts "1.20" or 1.2 on the wire, always serialized as a string
    pub charge_amount: Decimal,
}

impl BalanceResponse {
    /// Decodes the balance service response body
    pub fn from_slice(body: &[u8]) -> AppResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Opaque envelope delivered by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
}

impl QueueMessage {
    /// Builds the acknowledgement entry for this delivery
    pub fn delete_entry(&self) -> DeleteEntry {
        DeleteEntry {
            id: self.id.clone(),
            receipt_handle: self.receipt_handle.clone(),
        }
    }
}

/// One entry of a batched delete request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

/// Per-entry failure reported by a batched delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

/// Result of a batched delete request that reached the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}
