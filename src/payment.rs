//! Payment service: credit RPC surface plus its public HTTP endpoints.
//!
//! `ProcessPayment` is the payment saga leg and mirrors the stock side:
//! stale check, PENDING record, stream push, conditional decrement. The
//! decrement script is the only path that debits credit, so a balance can
//! never go negative.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::kv::stream::StreamProducer;
use crate::kv::{KvError, KvStore};
use crate::models::{TRANSACTIONS_STREAM, TransactionStatus, User};
use crate::reconcile::{self, PAYMENT_LEG};
use crate::rpc::{
    AddFundsRequest, ApiError, FindUserRequest, OperationResponse, PaymentRequest,
    PaymentResponse, UserReply, VibeCheckRequest,
};
use crate::snapshot::SnapshotGate;
use crate::txn::TxnLog;

pub struct PaymentService {
    store: KvStore,
    txns: TxnLog,
    producer: StreamProducer,
    gate: SnapshotGate,
}

impl PaymentService {
    pub fn new(store: KvStore, gate: SnapshotGate) -> Self {
        let producer = store.stream_producer(TRANSACTIONS_STREAM);
        Self {
            txns: TxnLog::new(store.clone()),
            producer,
            store,
            gate,
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn gate(&self) -> &SnapshotGate {
        &self.gate
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>, KvError> {
        self.store.get(user_id).await
    }

    pub async fn create_user(&self) -> Result<String, KvError> {
        let user_id = Uuid::new_v4().to_string();
        self.store.save(&User::new(user_id.clone(), 0)).await?;
        info!("user created: {}", user_id);
        Ok(user_id)
    }

    /// Unconditional credit top-up.
    pub async fn add_funds(&self, user_id: &str, amount: i64) -> Result<OperationResponse, KvError> {
        if self.find_user(user_id).await?.is_none() {
            return Ok(OperationResponse::err(format!(
                "User: {user_id} not found!"
            )));
        }
        let new_credit = self.store.increment(user_id, "credit", amount).await?;
        info!(
            "added funds: {} to user {}; new credit: {}",
            amount, user_id, new_credit
        );
        Ok(OperationResponse::ok())
    }

    /// Payment saga leg.
    pub async fn process_payment(
        &self,
        user_id: &str,
        amount: i64,
        tid: &str,
    ) -> Result<PaymentResponse, KvError> {
        if self.txns.status(tid).await? == Some(TransactionStatus::Stale) {
            return Ok(PaymentResponse {
                success: false,
                error: "Transaction is stale".to_string(),
            });
        }

        let mut details = BTreeMap::new();
        details.insert(user_id.to_string(), amount);
        self.txns.create_pending(tid, details).await?;
        self.producer.push_tid(tid).await?;

        if !self
            .store
            .lte_decrement(user_id, "credit", amount, tid)
            .await?
        {
            error!("payment failed for user {}: insufficient credit", user_id);
            return Ok(PaymentResponse {
                success: false,
                error: "Insufficient funds".to_string(),
            });
        }
        self.store
            .increment(user_id, "committed_credit", amount)
            .await?;

        info!("debited {} from user {}", amount, user_id);
        Ok(PaymentResponse {
            success: true,
            error: String::new(),
        })
    }

    pub async fn batch_init(&self, count: i64, starting_credit: i64) -> Result<(), KvError> {
        let users: Vec<User> = (0..count)
            .map(|i| User::new(i.to_string(), starting_credit))
            .collect();
        self.store.save_all(&users).await
    }

    pub async fn stream_len(&self) -> Result<u64, KvError> {
        self.producer.len().await
    }
}

pub fn router(service: Arc<PaymentService>) -> Router {
    Router::new()
        // Public surface
        .route("/create_user", post(create_user))
        .route("/add_funds/{user_id}/{amount}", post(add_funds))
        .route("/find_user/{user_id}", get(find_user))
        .route("/batch_init/{n}/{starting_credit}", post(batch_init))
        .route("/streamsize", get(streamsize))
        // RPC surface
        .route("/rpc/find_user", post(rpc_find_user))
        .route("/rpc/add_funds", post(rpc_add_funds))
        .route("/rpc/process_payment", post(rpc_process_payment))
        .route(
            "/rpc/vibe_check_transaction_status",
            post(rpc_vibe_check),
        )
        .route("/rpc/prepare_snapshot", post(rpc_prepare_snapshot))
        .route("/rpc/check_snapshot_ready", post(rpc_check_snapshot_ready))
        .route("/rpc/snapshot", post(rpc_snapshot))
        .route("/rpc/continue_consuming", post(rpc_continue_consuming))
        .with_state(service)
}

async fn create_user(
    State(service): State<Arc<PaymentService>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = service.create_user().await?;
    Ok(Json(json!({ "user_id": user_id })))
}

async fn add_funds(
    State(service): State<Arc<PaymentService>>,
    Path((user_id, amount)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let reply = service.add_funds(&user_id, amount).await?;
    if !reply.success {
        return Err(ApiError::bad_request(reply.error));
    }
    Ok(Json(reply))
}

async fn find_user(
    State(service): State<Arc<PaymentService>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = service
        .find_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User: {user_id} not found!")))?;
    Ok(Json(json!({
        "user_id": user.id,
        "credit": user.credit,
    })))
}

async fn batch_init(
    State(service): State<Arc<PaymentService>>,
    Path((n, starting_credit)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if n < 0 || starting_credit < 0 {
        return Err(ApiError::bad_request("batch parameters must be non-negative"));
    }
    service.batch_init(n, starting_credit).await?;
    Ok(Json(json!({ "msg": "Batch init for users successful" })))
}

async fn streamsize(
    State(service): State<Arc<PaymentService>>,
) -> Result<impl IntoResponse, ApiError> {
    let size = service.stream_len().await?;
    Ok(Json(json!({ "size": size })))
}

async fn rpc_find_user(
    State(service): State<Arc<PaymentService>>,
    Json(request): Json<FindUserRequest>,
) -> Result<Json<UserReply>, ApiError> {
    let user = service
        .find_user(&request.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User: {} not found!", request.user_id)))?;
    Ok(Json(UserReply {
        id: user.id,
        credit: user.credit,
    }))
}

async fn rpc_add_funds(
    State(service): State<Arc<PaymentService>>,
    Json(request): Json<AddFundsRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    Ok(Json(
        service.add_funds(&request.user_id, request.amount).await?,
    ))
}

async fn rpc_process_payment(
    State(service): State<Arc<PaymentService>>,
    Json(request): Json<PaymentRequest>,
) -> Result<Json<PaymentResponse>, ApiError> {
    Ok(Json(
        service
            .process_payment(&request.user_id, request.amount, &request.tid)
            .await?,
    ))
}

async fn rpc_vibe_check(
    State(service): State<Arc<PaymentService>>,
    Json(request): Json<VibeCheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reply =
        reconcile::vibe_check_handler(&service.store, &service.txns, &PAYMENT_LEG, request).await?;
    Ok(Json(reply))
}

async fn rpc_prepare_snapshot(
    State(service): State<Arc<PaymentService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    let acquired = service.gate.prepare("payment").await?;
    Ok(Json(if acquired {
        OperationResponse::ok()
    } else {
        OperationResponse::err("snapshot already in progress")
    }))
}

async fn rpc_check_snapshot_ready(
    State(service): State<Arc<PaymentService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    let ready = service.gate.ready().await?;
    Ok(Json(if ready {
        OperationResponse::ok()
    } else {
        OperationResponse::err("consumers not parked yet")
    }))
}

async fn rpc_snapshot(
    State(service): State<Arc<PaymentService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    service.gate.snapshot().await?;
    Ok(Json(OperationResponse::ok()))
}

async fn rpc_continue_consuming(
    State(service): State<Arc<PaymentService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    service.gate.resume().await?;
    Ok(Json(OperationResponse::ok()))
}
