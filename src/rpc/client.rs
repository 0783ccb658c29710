//! Typed RPC clients.
//!
//! Thin reqwest wrappers over the `/rpc/` routes. Every outbound call
//! carries the 2 s deadline; callers treat a deadline hit like any other
//! transport failure and lean on stream reconciliation for cleanup.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    AddFundsRequest, BulkOrderLine, BulkStockAdjustment, BulkStockAdjustmentResponse,
    FindItemRequest, FindUserRequest, ItemReply, OperationResponse, PaymentRequest,
    PaymentResponse, RpcError, StockAdjustment, StockAdjustmentResponse, TransactionStatusReply,
    UserReply, VibeCheckRequest,
};

/// Per-leg deadline on every outbound RPC.
pub const RPC_DEADLINE: Duration = Duration::from_secs(2);

async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
    http: &reqwest::Client,
    url: String,
    body: &Req,
) -> Result<Resp, RpcError> {
    let response = http
        .post(&url)
        .timeout(RPC_DEADLINE)
        .json(body)
        .send()
        .await?;
    decode_response(response).await
}

async fn post_empty<Resp: DeserializeOwned>(
    http: &reqwest::Client,
    url: String,
) -> Result<Resp, RpcError> {
    let response = http.post(&url).timeout(RPC_DEADLINE).send().await?;
    decode_response(response).await
}

async fn decode_response<Resp: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Resp, RpcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = response
        .json::<OperationResponse>()
        .await
        .map(|r| r.error)
        .unwrap_or_else(|_| status.to_string());
    Err(match status.as_u16() {
        404 => RpcError::NotFound(message),
        412 => RpcError::FailedPrecondition(message),
        503 => RpcError::Unavailable,
        _ => RpcError::Internal(message),
    })
}

/// The reconciliation pairing call, the one seam both legs share.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn vibe_check(&self, tid: &str, success: bool)
    -> Result<TransactionStatusReply, RpcError>;
}

/// The order-service commit hook invoked once both legs agree.
#[async_trait]
pub trait CommitRpc: Send + Sync {
    async fn commit_checkout(&self, tid: &str) -> Result<(), RpcError>;
}

#[derive(Clone)]
pub struct StockClient {
    http: reqwest::Client,
    base: String,
}

impl StockClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/rpc/{}", self.base, method)
    }

    pub async fn find_item(&self, item_id: &str) -> Result<ItemReply, RpcError> {
        let request = FindItemRequest {
            item_id: item_id.to_string(),
        };
        post_json(&self.http, self.url("find_item"), &request).await
    }

    pub async fn add_stock(
        &self,
        item_id: &str,
        quantity: i64,
    ) -> Result<StockAdjustmentResponse, RpcError> {
        let request = StockAdjustment {
            item_id: item_id.to_string(),
            quantity,
            tid: String::new(),
        };
        post_json(&self.http, self.url("add_stock"), &request).await
    }

    pub async fn remove_stock(
        &self,
        item_id: &str,
        quantity: i64,
        tid: &str,
    ) -> Result<StockAdjustmentResponse, RpcError> {
        let request = StockAdjustment {
            item_id: item_id.to_string(),
            quantity,
            tid: tid.to_string(),
        };
        post_json(&self.http, self.url("remove_stock"), &request).await
    }

    pub async fn bulk_order(
        &self,
        items: Vec<BulkOrderLine>,
        tid: &str,
    ) -> Result<BulkStockAdjustmentResponse, RpcError> {
        let request = BulkStockAdjustment {
            items,
            tid: tid.to_string(),
        };
        post_json(&self.http, self.url("bulk_order"), &request).await
    }

    pub async fn bulk_refund(&self, items: Vec<BulkOrderLine>) -> Result<OperationResponse, RpcError> {
        let request = BulkStockAdjustment {
            items,
            tid: String::new(),
        };
        post_json(&self.http, self.url("bulk_refund"), &request).await
    }

    pub async fn prepare_snapshot(&self) -> Result<bool, RpcError> {
        let reply: OperationResponse =
            post_empty(&self.http, self.url("prepare_snapshot")).await?;
        Ok(reply.success)
    }

    pub async fn check_snapshot_ready(&self) -> Result<bool, RpcError> {
        let reply: OperationResponse =
            post_empty(&self.http, self.url("check_snapshot_ready")).await?;
        Ok(reply.success)
    }

    pub async fn snapshot(&self) -> Result<(), RpcError> {
        let _: OperationResponse = post_empty(&self.http, self.url("snapshot")).await?;
        Ok(())
    }

    pub async fn continue_consuming(&self) -> Result<(), RpcError> {
        let _: OperationResponse = post_empty(&self.http, self.url("continue_consuming")).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerRpc for StockClient {
    async fn vibe_check(
        &self,
        tid: &str,
        success: bool,
    ) -> Result<TransactionStatusReply, RpcError> {
        let request = VibeCheckRequest {
            tid: tid.to_string(),
            success,
        };
        post_json(&self.http, self.url("vibe_check_transaction_status"), &request).await
    }
}

#[derive(Clone)]
pub struct PaymentClient {
    http: reqwest::Client,
    base: String,
}

impl PaymentClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/rpc/{}", self.base, method)
    }

    pub async fn find_user(&self, user_id: &str) -> Result<UserReply, RpcError> {
        let request = FindUserRequest {
            user_id: user_id.to_string(),
        };
        post_json(&self.http, self.url("find_user"), &request).await
    }

    pub async fn add_funds(&self, user_id: &str, amount: i64) -> Result<OperationResponse, RpcError> {
        let request = AddFundsRequest {
            user_id: user_id.to_string(),
            amount,
        };
        post_json(&self.http, self.url("add_funds"), &request).await
    }

    pub async fn process_payment(
        &self,
        user_id: &str,
        amount: i64,
        tid: &str,
    ) -> Result<PaymentResponse, RpcError> {
        let request = PaymentRequest {
            user_id: user_id.to_string(),
            amount,
            tid: tid.to_string(),
        };
        post_json(&self.http, self.url("process_payment"), &request).await
    }

    pub async fn prepare_snapshot(&self) -> Result<bool, RpcError> {
        let reply: OperationResponse =
            post_empty(&self.http, self.url("prepare_snapshot")).await?;
        Ok(reply.success)
    }

    pub async fn check_snapshot_ready(&self) -> Result<bool, RpcError> {
        let reply: OperationResponse =
            post_empty(&self.http, self.url("check_snapshot_ready")).await?;
        Ok(reply.success)
    }

    pub async fn snapshot(&self) -> Result<(), RpcError> {
        let _: OperationResponse = post_empty(&self.http, self.url("snapshot")).await?;
        Ok(())
    }

    pub async fn continue_consuming(&self) -> Result<(), RpcError> {
        let _: OperationResponse = post_empty(&self.http, self.url("continue_consuming")).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerRpc for PaymentClient {
    async fn vibe_check(
        &self,
        tid: &str,
        success: bool,
    ) -> Result<TransactionStatusReply, RpcError> {
        let request = VibeCheckRequest {
            tid: tid.to_string(),
            success,
        };
        post_json(&self.http, self.url("vibe_check_transaction_status"), &request).await
    }
}

/// Client for the order service's HTTP surface, used by the reconciliation
/// consumers and the snapshot controller.
#[derive(Clone)]
pub struct OrderClient {
    http: reqwest::Client,
    base: String,
}

impl OrderClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }

    pub async fn prepare_rollback(&self) -> Result<bool, RpcError> {
        let reply: OperationResponse =
            post_empty(&self.http, format!("{}/prepare_rollback", self.base)).await?;
        Ok(reply.success)
    }

    pub async fn snapshot(&self) -> Result<(), RpcError> {
        let _: OperationResponse =
            post_empty(&self.http, format!("{}/snapshot", self.base)).await?;
        Ok(())
    }

    pub async fn continue_serving(&self) -> Result<(), RpcError> {
        let _: OperationResponse =
            post_empty(&self.http, format!("{}/continue", self.base)).await?;
        Ok(())
    }
}

#[async_trait]
impl CommitRpc for OrderClient {
    async fn commit_checkout(&self, tid: &str) -> Result<(), RpcError> {
        let _: OperationResponse =
            post_empty(&self.http, format!("{}/commit_checkout/{}", self.base, tid)).await?;
        Ok(())
    }
}
