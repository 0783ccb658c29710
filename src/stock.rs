//! Stock service: inventory RPC surface plus its public HTTP endpoints.
//!
//! `RemoveStock` and `BulkOrder` are saga legs: stale check, PENDING record,
//! stream push, then the conditional decrement that flips the transaction
//! status in the same script call. Everything else is plain bookkeeping.

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
use crate::models::{Item, TRANSACTIONS_STREAM, TransactionStatus};
use crate::reconcile::{self, STOCK_LEG};
use crate::rpc::{
    ApiError, BulkOrderLine, BulkStockAdjustment, BulkStockAdjustmentResponse, FindItemRequest,
    ItemReply, OperationResponse, StockAdjustment, StockAdjustmentResponse, VibeCheckRequest,
};
use crate::snapshot::SnapshotGate;
use crate::txn::TxnLog;

pub struct StockService {
    store: KvStore,
    txns: TxnLog,
    producer: StreamProducer,
    gate: SnapshotGate,
}

impl StockService {
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

    pub async fn find_item(&self, item_id: &str) -> Result<Option<Item>, KvError> {
        self.store.get(item_id).await
    }

    pub async fn create_item(&self, price: i64) -> Result<String, KvError> {
        let item_id = Uuid::new_v4().to_string();
        self.store.save(&Item::new(item_id.clone(), 0, price)).await?;
        info!("item created: {} at price {}", item_id, price);
        Ok(item_id)
    }

    /// Unconditional restock. A missing item is a domain refusal, not an
    /// abort.
    pub async fn add_stock(
        &self,
        item_id: &str,
        quantity: i64,
    ) -> Result<StockAdjustmentResponse, KvError> {
        let Some(item) = self.find_item(item_id).await? else {
            return Ok(StockAdjustmentResponse {
                status: OperationResponse::err(format!("Item: {item_id} not found!")),
                price: -1,
            });
        };
        let new_stock = self.store.increment(item_id, "stock", quantity).await?;
        info!("added {} to item {}; new stock: {}", quantity, item_id, new_stock);
        Ok(StockAdjustmentResponse {
            status: OperationResponse::ok(),
            price: item.price * quantity,
        })
    }

    /// Single-item saga leg.
    pub async fn remove_stock(
        &self,
        item_id: &str,
        quantity: i64,
        tid: &str,
    ) -> Result<StockAdjustmentResponse, KvError> {
        if self.txns.status(tid).await? == Some(TransactionStatus::Stale) {
            return Ok(StockAdjustmentResponse {
                status: OperationResponse::err("Transaction is stale"),
                price: -1,
            });
        }

        let mut details = BTreeMap::new();
        details.insert(item_id.to_string(), quantity);
        self.txns.create_pending(tid, details).await?;
        self.producer.push_tid(tid).await?;

        if !self
            .store
            .lte_decrement(item_id, "stock", quantity, tid)
            .await?
        {
            error!("insufficient stock for item: {}", item_id);
            return Ok(StockAdjustmentResponse {
                status: OperationResponse::err("Insufficient stock"),
                price: -1,
            });
        }
        self.store
            .increment(item_id, "committed_stock", quantity)
            .await?;

        info!("removed {} from item {}", quantity, item_id);
        let price: i64 = self
            .store
            .get_attr(item_id, "price")
            .await?
            .unwrap_or_default();
        Ok(StockAdjustmentResponse {
            status: OperationResponse::ok(),
            price: price * quantity,
        })
    }

    /// Multi-item saga leg; the decrement is all-or-nothing across lines.
    pub async fn bulk_order(
        &self,
        lines: &[BulkOrderLine],
        tid: &str,
    ) -> Result<BulkStockAdjustmentResponse, KvError> {
        if self.txns.status(tid).await? == Some(TransactionStatus::Stale) {
            return Ok(BulkStockAdjustmentResponse {
                status: OperationResponse::err("Transaction is stale"),
                total_cost: -1,
            });
        }

        let mut changes: BTreeMap<String, i64> = BTreeMap::new();
        for line in lines {
            *changes.entry(line.item_id.clone()).or_insert(0) += line.quantity;
        }

        self.txns.create_pending(tid, changes.clone()).await?;
        self.producer.push_tid(tid).await?;

        if !self.store.m_gte_decrement(tid, &changes, "stock").await? {
            error!("insufficient stock for items in {}", tid);
            return Ok(BulkStockAdjustmentResponse {
                status: OperationResponse::err("Insufficient stock for some items"),
                total_cost: -1,
            });
        }

        let ids: Vec<String> = changes.keys().cloned().collect();
        let prices = self
            .store
            .m_get_attr::<i64>(&ids, "price")
            .await?
            .unwrap_or_default();
        let mut total_cost = 0;
        for (id, quantity) in &changes {
            self.store
                .increment(id, "committed_stock", *quantity)
                .await?;
            total_cost += prices.get(id).copied().unwrap_or_default() * quantity;
        }

        Ok(BulkStockAdjustmentResponse {
            status: OperationResponse::ok(),
            total_cost,
        })
    }

    /// Explicit compensation path; no saga, plain increments.
    pub async fn bulk_refund(&self, lines: &[BulkOrderLine]) -> Result<OperationResponse, KvError> {
        for line in lines {
            if self.find_item(&line.item_id).await?.is_none() {
                return Ok(OperationResponse::err(format!(
                    "Item: {} not found!",
                    line.item_id
                )));
            }
            let new_stock = self
                .store
                .increment(&line.item_id, "stock", line.quantity)
                .await?;
            info!(
                "refunded {} to item {}; new stock: {}",
                line.quantity, line.item_id, new_stock
            );
        }
        Ok(OperationResponse::ok())
    }

    pub async fn batch_init(
        &self,
        count: i64,
        starting_stock: i64,
        price: i64,
    ) -> Result<(), KvError> {
        let items: Vec<Item> = (0..count)
            .map(|i| Item::new(i.to_string(), starting_stock, price))
            .collect();
        self.store.save_all(&items).await
    }

    pub async fn stream_len(&self) -> Result<u64, KvError> {
        self.producer.len().await
    }
}

pub fn router(service: Arc<StockService>) -> Router {
    Router::new()
        // Public surface
        .route("/create/{price}", post(create_item))
        .route("/add/{item_id}/{quantity}", post(add))
        .route("/find/{item_id}", get(find))
        .route("/batch_init/{n}/{starting_stock}/{price}", post(batch_init))
        .route("/streamsize", get(streamsize))
        // RPC surface
        .route("/rpc/find_item", post(rpc_find_item))
        .route("/rpc/add_stock", post(rpc_add_stock))
        .route("/rpc/remove_stock", post(rpc_remove_stock))
        .route("/rpc/bulk_order", post(rpc_bulk_order))
        .route("/rpc/bulk_refund", post(rpc_bulk_refund))
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

async fn create_item(
    State(service): State<Arc<StockService>>,
    Path(price): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let item_id = service.create_item(price).await?;
    Ok(Json(json!({ "item_id": item_id })))
}

async fn add(
    State(service): State<Arc<StockService>>,
    Path((item_id, quantity)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let reply = service.add_stock(&item_id, quantity).await?;
    if !reply.status.success {
        return Err(ApiError::bad_request(reply.status.error));
    }
    Ok(Json(reply))
}

async fn find(
    State(service): State<Arc<StockService>>,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let item = service
        .find_item(&item_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Item: {item_id} not found!")))?;
    Ok(Json(json!({
        "item_id": item.id,
        "stock": item.stock,
        "price": item.price,
    })))
}

async fn batch_init(
    State(service): State<Arc<StockService>>,
    Path((n, starting_stock, price)): Path<(i64, i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if n < 0 || starting_stock < 0 || price < 0 {
        return Err(ApiError::bad_request("batch parameters must be non-negative"));
    }
    service.batch_init(n, starting_stock, price).await?;
    Ok(Json(json!({ "msg": "Batch init for stock successful" })))
}

async fn streamsize(
    State(service): State<Arc<StockService>>,
) -> Result<impl IntoResponse, ApiError> {
    let size = service.stream_len().await?;
    Ok(Json(json!({ "size": size })))
}

async fn rpc_find_item(
    State(service): State<Arc<StockService>>,
    Json(request): Json<FindItemRequest>,
) -> Result<Json<ItemReply>, ApiError> {
    let item = service
        .find_item(&request.item_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Item: {} not found!", request.item_id)))?;
    Ok(Json(ItemReply {
        id: item.id,
        stock: item.stock,
        price: item.price,
    }))
}

async fn rpc_add_stock(
    State(service): State<Arc<StockService>>,
    Json(request): Json<StockAdjustment>,
) -> Result<Json<StockAdjustmentResponse>, ApiError> {
    Ok(Json(
        service.add_stock(&request.item_id, request.quantity).await?,
    ))
}

async fn rpc_remove_stock(
    State(service): State<Arc<StockService>>,
    Json(request): Json<StockAdjustment>,
) -> Result<Json<StockAdjustmentResponse>, ApiError> {
    Ok(Json(
        service
            .remove_stock(&request.item_id, request.quantity, &request.tid)
            .await?,
    ))
}

async fn rpc_bulk_order(
    State(service): State<Arc<StockService>>,
    Json(request): Json<BulkStockAdjustment>,
) -> Result<Json<BulkStockAdjustmentResponse>, ApiError> {
    Ok(Json(service.bulk_order(&request.items, &request.tid).await?))
}

async fn rpc_bulk_refund(
    State(service): State<Arc<StockService>>,
    Json(request): Json<BulkStockAdjustment>,
) -> Result<Json<OperationResponse>, ApiError> {
    Ok(Json(service.bulk_refund(&request.items).await?))
}

async fn rpc_vibe_check(
    State(service): State<Arc<StockService>>,
    Json(request): Json<VibeCheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reply =
        reconcile::vibe_check_handler(&service.store, &service.txns, &STOCK_LEG, request).await?;
    Ok(Json(reply))
}

async fn rpc_prepare_snapshot(
    State(service): State<Arc<StockService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    let acquired = service.gate.prepare("stock").await?;
    Ok(Json(if acquired {
        OperationResponse::ok()
    } else {
        OperationResponse::err("snapshot already in progress")
    }))
}

async fn rpc_check_snapshot_ready(
    State(service): State<Arc<StockService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    let ready = service.gate.ready().await?;
    Ok(Json(if ready {
        OperationResponse::ok()
    } else {
        OperationResponse::err("consumers not parked yet")
    }))
}

async fn rpc_snapshot(
    State(service): State<Arc<StockService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    service.gate.snapshot().await?;
    Ok(Json(OperationResponse::ok()))
}

async fn rpc_continue_consuming(
    State(service): State<Arc<StockService>>,
) -> Result<Json<OperationResponse>, ApiError> {
    service.gate.resume().await?;
    Ok(Json(OperationResponse::ok()))
}
