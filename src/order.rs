//! Order service: the checkout saga driver.
//!
//! `/checkout` fans the stock and payment legs out in parallel and returns an
//! optimistic acknowledgement; the true commit arrives later through
//! `/commit_checkout/<tid>` once the reconciliation pair agrees. The
//! orchestrator never compensates locally — after fan-out, the transaction
//! stream owns that path.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kv::{KvError, KvStore};
use crate::models::{Order, TransactionStatus};
use crate::rpc::{ApiError, BulkOrderLine, PaymentClient, RpcError, StockClient};
use crate::snapshot::SnapshotGate;
use crate::txn::TxnLog;

/// Bounded retries for the optimistic `addItem` guard.
const ADD_ITEM_ATTEMPTS: u32 = 3;

pub struct OrderService {
    store: KvStore,
    txns: TxnLog,
    gate: SnapshotGate,
    stock: StockClient,
    payment: PaymentClient,
}

impl OrderService {
    pub fn new(
        store: KvStore,
        gate: SnapshotGate,
        stock: StockClient,
        payment: PaymentClient,
    ) -> Self {
        Self {
            txns: TxnLog::new(store.clone()),
            store,
            gate,
            stock,
            payment,
        }
    }

    pub fn gate(&self) -> &SnapshotGate {
        &self.gate
    }

    async fn load_order(&self, order_id: &str) -> Result<Order, ApiError> {
        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| ApiError::bad_request(format!("Order: {order_id} not found!")))
    }

    pub async fn create_order(&self, user_id: &str) -> Result<String, KvError> {
        let order_id = Uuid::new_v4().to_string();
        self.store.save(&Order::new(order_id.clone(), user_id)).await?;
        info!("order created: {} for user {}", order_id, user_id);
        Ok(order_id)
    }

    /// Dispatch the stock leg: a single-line order takes the scalar RPC, a
    /// multi-line order the bulk one. Either way there is exactly one stock
    /// transaction record per saga.
    async fn dispatch_stock(
        &self,
        totals: &BTreeMap<String, i64>,
        tid: &str,
    ) -> Result<bool, RpcError> {
        let mut lines_iter = totals.iter();
        if let (Some((item_id, quantity)), None) = (lines_iter.next(), lines_iter.next()) {
            let reply = self.stock.remove_stock(item_id, *quantity, tid).await?;
            Ok(reply.status.success)
        } else {
            let lines: Vec<BulkOrderLine> = totals
                .iter()
                .map(|(item_id, quantity)| BulkOrderLine {
                    item_id: item_id.clone(),
                    quantity: *quantity,
                })
                .collect();
            let reply = self.stock.bulk_order(lines, tid).await?;
            Ok(reply.status.success)
        }
    }
}

pub fn router(service: Arc<OrderService>) -> Router {
    Router::new()
        .route("/create/{user_id}", post(create))
        .route("/addItem/{order_id}/{item_id}/{quantity}", post(add_item))
        .route("/checkout/{order_id}", post(checkout))
        .route("/commit_checkout/{tid}", post(commit_checkout))
        .route("/find_order/{order_id}", get(find_order))
        .route("/batch_init/{n}/{n_items}/{n_users}/{item_price}", post(batch_init))
        .route("/prepare_rollback", post(prepare_rollback))
        .route("/snapshot", post(snapshot))
        .route("/continue", post(continue_serving))
        .with_state(service)
}

async fn create(
    State(service): State<Arc<OrderService>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = service.create_order(&user_id).await?;
    Ok(Json(json!({ "order_id": order_id })))
}

async fn add_item(
    State(service): State<Arc<OrderService>>,
    Path((order_id, item_id, quantity)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if quantity <= 0 {
        return Err(ApiError::bad_request("Quantity must be positive"));
    }
    let item = match service.stock.find_item(&item_id).await {
        Ok(item) => item,
        Err(RpcError::NotFound(_)) => {
            return Err(ApiError::bad_request(format!("Item {item_id} not found")));
        }
        Err(e) => return Err(e.into()),
    };

    // Optimistic guard: swap the items list only if nobody raced us, then
    // bump the cost. Retries are bounded.
    for _ in 0..ADD_ITEM_ATTEMPTS {
        let order = service.load_order(&order_id).await?;
        let mut new_items = order.items.clone();
        new_items.push(Order::line(&item_id, quantity));
        if service
            .store
            .compare_and_set(&order_id, "items", &order.items, &new_items)
            .await?
        {
            let total = service
                .store
                .increment(&order_id, "total_cost", item.price * quantity)
                .await?;
            return Ok(format!("Item {item_id} added. Total: {total}"));
        }
    }
    Err(ApiError::bad_request("Order updated concurrently, retry"))
}

async fn checkout(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if service.gate.is_halted().await? {
        return Err(ApiError::halted());
    }

    let order = service.load_order(&order_id).await?;
    let totals = order.aggregated_items();
    if totals.is_empty() {
        return Err(ApiError::bad_request("Order has no items"));
    }

    // The order-side record is what `/commit_checkout` later resolves the
    // order id from; it must exist before any leg can succeed.
    let tid = Uuid::new_v4().to_string();
    let mut details = BTreeMap::new();
    details.insert(order_id.clone(), order.total_cost);
    service.txns.create_pending(&tid, details).await?;

    let payment_leg = service
        .payment
        .process_payment(&order.user_id, order.total_cost, &tid);
    let stock_leg = service.dispatch_stock(&totals, &tid);
    let (payment_result, stock_result) = tokio::join!(payment_leg, stock_leg);

    let payment_ok = match payment_result {
        Ok(reply) if reply.success => true,
        Ok(reply) => {
            warn!("payment leg refused for order {}: {}", order_id, reply.error);
            false
        }
        Err(e) => {
            warn!("payment leg failed for order {}: {}", order_id, e);
            false
        }
    };
    let stock_ok = match stock_result {
        Ok(success) => {
            if !success {
                warn!("stock leg refused for order {}", order_id);
            }
            success
        }
        Err(e) => {
            warn!("stock leg failed for order {}: {}", order_id, e);
            false
        }
    };

    if payment_ok && stock_ok {
        info!("checkout accepted for order {} (tid {})", order_id, tid);
        return Ok((StatusCode::OK, "Checkout accepted"));
    }

    // Bookkeeping only; the legs compensate through the stream.
    service
        .store
        .set_attr(&tid, "status", &TransactionStatus::Failure)
        .await?;
    if !payment_ok {
        Err(ApiError::bad_request("Payment failed"))
    } else {
        Err(ApiError::bad_request("Insufficient stock"))
    }
}

/// Idempotent commit hook invoked by the reconciliation resolver. A missing
/// transaction record means the commit already happened.
async fn commit_checkout(
    State(service): State<Arc<OrderService>>,
    Path(tid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(txn) = service.txns.load(&tid).await? else {
        return Ok(Json(crate::rpc::OperationResponse::ok()));
    };
    let Some(order_id) = txn.details.keys().next().cloned() else {
        service.txns.delete(&tid).await?;
        return Err(ApiError::internal(format!(
            "transaction {tid} carries no order id"
        )));
    };

    let paid = service.store.increment(&order_id, "paid", 1).await?;
    service.txns.delete(&tid).await?;
    info!("checkout committed for order {} (paid={}, tid {})", order_id, paid, tid);
    Ok(Json(crate::rpc::OperationResponse::ok()))
}

async fn find_order(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order = service.load_order(&order_id).await?;
    Ok(Json(json!({
        "order_id": order.id,
        "paid": order.paid,
        "items": order.items,
        "user_id": order.user_id,
        "total_cost": order.total_cost,
    })))
}

async fn batch_init(
    State(service): State<Arc<OrderService>>,
    Path((n, n_items, n_users, item_price)): Path<(i64, i64, i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if n < 0 || n_items <= 0 || n_users <= 0 || item_price < 0 {
        return Err(ApiError::bad_request("bad batch parameters"));
    }

    let orders: Vec<Order> = {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|i| {
                let user_id = rng.gen_range(0..n_users).to_string();
                let items = vec![
                    Order::line(&rng.gen_range(0..n_items).to_string(), 1),
                    Order::line(&rng.gen_range(0..n_items).to_string(), 1),
                ];
                Order {
                    id: i.to_string(),
                    paid: 0,
                    items,
                    user_id,
                    total_cost: 2 * item_price,
                }
            })
            .collect()
    };
    service.store.save_all(&orders).await?;
    Ok(Json(json!({ "msg": "Batch init for orders successful" })))
}

async fn prepare_rollback(
    State(service): State<Arc<OrderService>>,
) -> Result<impl IntoResponse, ApiError> {
    let acquired = service.gate.prepare("order").await?;
    Ok(Json(if acquired {
        crate::rpc::OperationResponse::ok()
    } else {
        crate::rpc::OperationResponse::err("snapshot already in progress")
    }))
}

async fn snapshot(
    State(service): State<Arc<OrderService>>,
) -> Result<impl IntoResponse, ApiError> {
    service.gate.snapshot().await?;
    Ok(Json(crate::rpc::OperationResponse::ok()))
}

async fn continue_serving(
    State(service): State<Arc<OrderService>>,
) -> Result<impl IntoResponse, ApiError> {
    service.gate.resume().await?;
    Ok(Json(crate::rpc::OperationResponse::ok()))
}
