//! Wire contracts between the services.
//!
//! RPC methods ride as JSON over `/rpc/` routes. Domain-level refusals
//! (insufficient stock or funds) travel inside `{success:false, error}`
//! bodies; transport-level conditions map onto HTTP statuses — 404 not
//! found, 412 failed precondition, 503 unavailable, 500 internal — and the
//! typed clients translate them back into [`RpcError`] variants.

pub mod client;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::KvError;

pub use client::{CommitRpc, OrderClient, PaymentClient, PeerRpc, StockClient};

/// Standard OK/error carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

impl OperationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindItemRequest {
    pub item_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReply {
    pub id: String,
    pub stock: i64,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub item_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub tid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockAdjustmentResponse {
    pub status: OperationResponse,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOrderLine {
    pub item_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkStockAdjustment {
    pub items: Vec<BulkOrderLine>,
    #[serde(default)]
    pub tid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkStockAdjustmentResponse {
    pub status: OperationResponse,
    pub total_cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindUserRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReply {
    pub id: String,
    pub credit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub user_id: String,
    pub amount: i64,
    pub tid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddFundsRequest {
    pub user_id: String,
    pub amount: i64,
}

/// Reconciliation pairing request: the caller reports its own leg outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeCheckRequest {
    pub tid: String,
    pub success: bool,
}

/// The peer leg's outcome, possibly STALE (reported as `success: false`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStatusReply {
    pub tid: String,
    pub success: bool,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("service unavailable")]
    Unavailable,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<KvError> for RpcError {
    fn from(e: KvError) -> Self {
        RpcError::Internal(e.to_string())
    }
}

/// Server-side error carrier for the axum handlers. Converts the error kinds
/// of the fabric onto the status mapping above.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_FAILED, message)
    }

    /// Snapshot window refusal on the order surface.
    pub fn halted() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "service halted: snapshot in progress",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(OperationResponse::err(self.message))).into_response()
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        tracing::error!("store failure surfaced to handler: {}", e);
        Self::internal(e.to_string())
    }
}

impl From<RpcError> for ApiError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::NotFound(m) => Self::not_found(m),
            RpcError::FailedPrecondition(m) => Self::precondition(m),
            RpcError::Unavailable => Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            RpcError::Transport(e) => Self::internal(e.to_string()),
            RpcError::Internal(m) => Self::internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_response_serde() {
        let raw = serde_json::to_string(&OperationResponse::ok()).unwrap();
        assert_eq!(raw, r#"{"success":true,"error":""}"#);

        // `error` may be omitted on the wire.
        let parsed: OperationResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!parsed.success);
        assert!(parsed.error.is_empty());
    }

    #[test]
    fn test_stock_adjustment_tid_optional() {
        let parsed: StockAdjustment =
            serde_json::from_str(r#"{"item_id":"i1","quantity":2}"#).unwrap();
        assert_eq!(parsed.item_id, "i1");
        assert!(parsed.tid.is_empty());
    }

    #[test]
    fn test_api_error_statuses() {
        assert_eq!(ApiError::halted().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ApiError::from(RpcError::FailedPrecondition("locked".into())).status,
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ApiError::from(RpcError::NotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
    }
}
