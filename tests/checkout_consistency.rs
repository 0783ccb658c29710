//! End-to-end consistency tests for the checkout saga.
//!
//! Each test spins the three services in-process on ephemeral ports against
//! a live Redis (one logical DB per service, 13/14/15) and drives real
//! checkouts through the HTTP surfaces. Seeds use fresh UUIDs so the tests
//! do not step on each other's state.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::sleep;
use uuid::Uuid;

use checkout_fabric::config::{LogConfig, ServiceConfig};
use checkout_fabric::kv::KvStore;
use checkout_fabric::models::{Item, TRANSACTIONS_STREAM, TransactionStatus, User};
use checkout_fabric::snapctl::SnapshotController;
use checkout_fabric::order::{self, OrderService};
use checkout_fabric::payment::{self, PaymentService};
use checkout_fabric::reconcile::{PAYMENT_LEG, STOCK_LEG, VibeChecker};
use checkout_fabric::rpc::{OrderClient, PaymentClient, StockClient};
use checkout_fabric::snapshot::SnapshotGate;
use checkout_fabric::stock::{self, StockService};

fn redis_url(db: u8) -> String {
    let base = std::env::var("TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    format!("{base}/{db}")
}

struct Fabric {
    order_url: String,
    stock_url: String,
    payment_url: String,
    stock_store: KvStore,
    payment_store: KvStore,
    http: reqwest::Client,
}

/// Boot the whole fabric: three HTTP servers plus one reconciliation
/// consumer per leg service.
async fn spawn_fabric() -> Fabric {
    spawn_fabric_on((13, 14, 15)).await
}

/// Same, on an explicit (order, stock, payment) DB triple, for tests that
/// halt the fabric and must not disturb concurrently running scenarios.
async fn spawn_fabric_on(dbs: (u8, u8, u8)) -> Fabric {
    let order_store = KvStore::connect(&redis_url(dbs.0)).await.expect("redis");
    let stock_store = KvStore::connect(&redis_url(dbs.1)).await.expect("redis");
    let payment_store = KvStore::connect(&redis_url(dbs.2)).await.expect("redis");

    let order_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stock_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let payment_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let order_url = format!("http://{}", order_listener.local_addr().unwrap());
    let stock_url = format!("http://{}", stock_listener.local_addr().unwrap());
    let payment_url = format!("http://{}", payment_listener.local_addr().unwrap());

    let stock_gate = SnapshotGate::new(stock_store.clone(), 1);
    let stock_service = Arc::new(StockService::new(stock_store.clone(), stock_gate.clone()));
    let stock_app = stock::router(stock_service);
    tokio::spawn(async move {
        axum::serve(stock_listener, stock_app).await.unwrap();
    });

    let payment_gate = SnapshotGate::new(payment_store.clone(), 1);
    let payment_service = Arc::new(PaymentService::new(
        payment_store.clone(),
        payment_gate.clone(),
    ));
    let payment_app = payment::router(payment_service);
    tokio::spawn(async move {
        axum::serve(payment_listener, payment_app).await.unwrap();
    });

    let order_gate = SnapshotGate::new(order_store.clone(), 0);
    let order_service = Arc::new(OrderService::new(
        order_store.clone(),
        order_gate,
        StockClient::new(&stock_url),
        PaymentClient::new(&payment_url),
    ));
    let order_app = order::router(order_service);
    tokio::spawn(async move {
        axum::serve(order_listener, order_app).await.unwrap();
    });

    let stock_checker = VibeChecker::new(
        stock_store.clone(),
        stock_gate,
        Arc::new(PaymentClient::new(&payment_url)),
        Arc::new(OrderClient::new(&order_url)),
        STOCK_LEG,
        &format!("consumer_{}", Uuid::new_v4()),
    )
    .await
    .expect("stock consumer");
    tokio::spawn(stock_checker.run());

    let payment_checker = VibeChecker::new(
        payment_store.clone(),
        payment_gate,
        Arc::new(StockClient::new(&stock_url)),
        Arc::new(OrderClient::new(&order_url)),
        PAYMENT_LEG,
        &format!("consumer_{}", Uuid::new_v4()),
    )
    .await
    .expect("payment consumer");
    tokio::spawn(payment_checker.run());

    Fabric {
        order_url,
        stock_url,
        payment_url,
        stock_store,
        payment_store,
        http: reqwest::Client::new(),
    }
}

impl Fabric {
    async fn seed_user(&self, credit: i64) -> String {
        let user_id = format!("user-{}", Uuid::new_v4());
        self.payment_store
            .save(&User::new(user_id.clone(), credit))
            .await
            .unwrap();
        user_id
    }

    async fn seed_item(&self, stock: i64, price: i64) -> String {
        let item_id = format!("item-{}", Uuid::new_v4());
        self.stock_store
            .save(&Item::new(item_id.clone(), stock, price))
            .await
            .unwrap();
        item_id
    }

    async fn create_order(&self, user_id: &str) -> String {
        let body: Value = self
            .http
            .post(format!("{}/create/{}", self.order_url, user_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["order_id"].as_str().unwrap().to_string()
    }

    async fn add_item(&self, order_id: &str, item_id: &str, quantity: i64) {
        let status = self
            .http
            .post(format!(
                "{}/addItem/{}/{}/{}",
                self.order_url, order_id, item_id, quantity
            ))
            .send()
            .await
            .unwrap()
            .status();
        assert!(status.is_success(), "addItem failed: {status}");
    }

    async fn checkout(&self, order_id: &str) -> u16 {
        self.http
            .post(format!("{}/checkout/{}", self.order_url, order_id))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    }

    async fn user_credit(&self, user_id: &str) -> i64 {
        let body: Value = self
            .http
            .get(format!("{}/find_user/{}", self.payment_url, user_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["credit"].as_i64().unwrap()
    }

    async fn item_stock(&self, item_id: &str) -> i64 {
        let body: Value = self
            .http
            .get(format!("{}/find/{}", self.stock_url, item_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["stock"].as_i64().unwrap()
    }

    async fn order_paid(&self, order_id: &str) -> i64 {
        let body: Value = self
            .http
            .get(format!("{}/find_order/{}", self.order_url, order_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["paid"].as_i64().unwrap()
    }

    async fn stream_sizes(&self) -> (u64, u64) {
        let stock: Value = self
            .http
            .get(format!("{}/streamsize", self.stock_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let payment: Value = self
            .http
            .get(format!("{}/streamsize", self.payment_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        (
            stock["size"].as_u64().unwrap(),
            payment["size"].as_u64().unwrap(),
        )
    }
}

/// Poll until `check` holds or the deadline passes.
async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

// ========================================================================
// End-to-end scenarios
// ========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_solo_checkout_sufficient_resources() {
    let fabric = spawn_fabric().await;
    let user_id = fabric.seed_user(100).await;
    let item_id = fabric.seed_item(5, 10).await;

    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 2).await;

    assert_eq!(fabric.checkout(&order_id).await, 200);

    let settled = eventually(Duration::from_secs(5), || async {
        fabric.order_paid(&order_id).await == 1
    })
    .await;
    assert!(settled, "order never committed");
    assert_eq!(fabric.user_credit(&user_id).await, 80);
    assert_eq!(fabric.item_stock(&item_id).await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_insufficient_credit_compensates_stock() {
    let fabric = spawn_fabric().await;
    let user_id = fabric.seed_user(10).await;
    let item_id = fabric.seed_item(5, 10).await;

    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 2).await;

    assert_eq!(fabric.checkout(&order_id).await, 400);

    let restored = eventually(Duration::from_secs(10), || async {
        fabric.item_stock(&item_id).await == 5
    })
    .await;
    assert!(restored, "stock never compensated");
    assert_eq!(fabric.user_credit(&user_id).await, 10);
    assert_eq!(fabric.order_paid(&order_id).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_insufficient_stock_compensates_credit() {
    let fabric = spawn_fabric().await;
    let user_id = fabric.seed_user(100).await;
    let item_id = fabric.seed_item(1, 10).await;

    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 2).await;

    assert_eq!(fabric.checkout(&order_id).await, 400);

    let restored = eventually(Duration::from_secs(10), || async {
        fabric.user_credit(&user_id).await == 100
    })
    .await;
    assert!(restored, "credit never compensated");
    assert_eq!(fabric.item_stock(&item_id).await, 1);
    assert_eq!(fabric.order_paid(&order_id).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires Redis"]
async fn test_concurrent_oversell_sells_exactly_once() {
    const CONTENDERS: usize = 100;
    const PRICE: i64 = 10;
    const CREDIT: i64 = 10;

    let fabric = spawn_fabric().await;
    let item_id = fabric.seed_item(1, PRICE).await;

    let mut orders = Vec::with_capacity(CONTENDERS);
    let mut users = Vec::with_capacity(CONTENDERS);
    for _ in 0..CONTENDERS {
        let user_id = fabric.seed_user(CREDIT).await;
        let order_id = fabric.create_order(&user_id).await;
        fabric.add_item(&order_id, &item_id, 1).await;
        orders.push(order_id);
        users.push(user_id);
    }

    let checkouts = orders
        .iter()
        .map(|order_id| fabric.checkout(order_id))
        .collect::<Vec<_>>();
    let statuses = futures::future::join_all(checkouts).await;
    let accepted = statuses.iter().filter(|s| **s == 200).count();
    assert_eq!(accepted, 1, "conditional decrement oversold");

    let drained = eventually(Duration::from_secs(30), || async {
        fabric.stream_sizes().await == (0, 0)
    })
    .await;
    assert!(drained, "transaction streams never drained");

    let mut paid_total = 0;
    for order_id in &orders {
        paid_total += fabric.order_paid(order_id).await;
    }
    assert_eq!(paid_total, 1);
    assert_eq!(fabric.item_stock(&item_id).await, 0);

    let mut credit_total = 0;
    for user_id in &users {
        credit_total += fabric.user_credit(user_id).await;
    }
    assert_eq!(credit_total, CONTENDERS as i64 * CREDIT - PRICE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_duplicate_stream_delivery_is_absorbed() {
    let fabric = spawn_fabric().await;
    let user_id = fabric.seed_user(100).await;
    let item_id = fabric.seed_item(5, 10).await;

    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 1).await;
    assert_eq!(fabric.checkout(&order_id).await, 200);
    let settled = eventually(Duration::from_secs(5), || async {
        fabric.order_paid(&order_id).await == 1
    })
    .await;
    assert!(settled);

    // Replay a tid whose transaction record is long gone; the consumer must
    // ack without touching any resource.
    let producer = fabric.stock_store.stream_producer(TRANSACTIONS_STREAM);
    producer
        .push_tid(&format!("replayed-{}", Uuid::new_v4()))
        .await
        .unwrap();

    let drained = eventually(Duration::from_secs(5), || async {
        fabric.stream_sizes().await.0 == 0
    })
    .await;
    assert!(drained, "replayed event never acked");
    assert_eq!(fabric.item_stock(&item_id).await, 4);
    assert_eq!(fabric.user_credit(&user_id).await, 90);
    assert_eq!(fabric.order_paid(&order_id).await, 1);
}

// ========================================================================
// Snapshot protocol
// ========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_checkout_refused_while_halted() {
    let fabric = spawn_fabric_on((10, 11, 12)).await;
    let user_id = fabric.seed_user(100).await;
    let item_id = fabric.seed_item(5, 10).await;
    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 1).await;

    let prepared: Value = fabric
        .http
        .post(format!("{}/prepare_rollback", fabric.order_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(prepared["success"], Value::Bool(true));

    assert_eq!(fabric.checkout(&order_id).await, 500);

    fabric
        .http
        .post(format!("{}/continue", fabric.order_url))
        .send()
        .await
        .unwrap();

    assert_eq!(fabric.checkout(&order_id).await, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Redis"]
async fn test_snapshot_cycle_quiesces_and_resumes() {
    let fabric = spawn_fabric_on((7, 8, 9)).await;

    let config = ServiceConfig {
        redis_url: redis_url(7),
        bind_addr: "127.0.0.1:0".to_string(),
        stock_rpc_addr: fabric.stock_url.clone(),
        payment_rpc_addr: fabric.payment_url.clone(),
        order_addr: fabric.order_url.clone(),
        stream_consumers: 1,
        snapshot_interval_secs: 1,
        log: LogConfig {
            log_dir: "logs".to_string(),
            log_file: "test.log".to_string(),
            rotation: "never".to_string(),
            log_level: "info".to_string(),
            use_json: false,
        },
    };
    SnapshotController::new(&config)
        .cycle()
        .await
        .expect("snapshot cycle");

    // The fabric must be fully released afterwards.
    let user_id = fabric.seed_user(100).await;
    let item_id = fabric.seed_item(5, 10).await;
    let order_id = fabric.create_order(&user_id).await;
    fabric.add_item(&order_id, &item_id, 1).await;
    assert_eq!(fabric.checkout(&order_id).await, 200);
}

// ========================================================================
// Decrement boundary contracts (store-level)
// ========================================================================

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lte_decrement_boundary_exact_amount() {
    let store = KvStore::connect(&redis_url(14)).await.expect("redis");
    let item_id = format!("item-{}", Uuid::new_v4());
    let tid = format!("tid-{}", Uuid::new_v4());
    store.save(&Item::new(item_id.clone(), 5, 10)).await.unwrap();

    assert!(store.lte_decrement(&item_id, "stock", 5, &tid).await.unwrap());
    let stock: Option<i64> = store.get_attr(&item_id, "stock").await.unwrap();
    assert_eq!(stock, Some(0));
    let status: Option<TransactionStatus> = store.get_attr(&tid, "status").await.unwrap();
    assert_eq!(status, Some(TransactionStatus::Success));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lte_decrement_missing_key_writes_failure() {
    let store = KvStore::connect(&redis_url(14)).await.expect("redis");
    let tid = format!("tid-{}", Uuid::new_v4());

    let missing = format!("item-{}", Uuid::new_v4());
    assert!(!store.lte_decrement(&missing, "stock", 1, &tid).await.unwrap());
    let status: Option<TransactionStatus> = store.get_attr(&tid, "status").await.unwrap();
    assert_eq!(status, Some(TransactionStatus::Failure));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_m_gte_decrement_short_key_modifies_nothing() {
    let store = KvStore::connect(&redis_url(14)).await.expect("redis");
    let rich = format!("item-{}", Uuid::new_v4());
    let poor = format!("item-{}", Uuid::new_v4());
    let tid = format!("tid-{}", Uuid::new_v4());
    store.save(&Item::new(rich.clone(), 10, 1)).await.unwrap();
    store.save(&Item::new(poor.clone(), 1, 1)).await.unwrap();

    let mut changes = BTreeMap::new();
    changes.insert(rich.clone(), 2i64);
    changes.insert(poor.clone(), 2i64);
    assert!(!store.m_gte_decrement(&tid, &changes, "stock").await.unwrap());

    let rich_stock: Option<i64> = store.get_attr(&rich, "stock").await.unwrap();
    let poor_stock: Option<i64> = store.get_attr(&poor, "stock").await.unwrap();
    assert_eq!(rich_stock, Some(10));
    assert_eq!(poor_stock, Some(1));
    let status: Option<TransactionStatus> = store.get_attr(&tid, "status").await.unwrap();
    assert_eq!(status, Some(TransactionStatus::Failure));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_compare_and_set_contends() {
    let store = KvStore::connect(&redis_url(14)).await.expect("redis");
    let id = format!("txn-{}", Uuid::new_v4());
    store.set_attr(&id, "locked", &false).await.unwrap();

    assert!(store.compare_and_set(&id, "locked", &false, &true).await.unwrap());
    // Second taker loses.
    assert!(!store.compare_and_set(&id, "locked", &false, &true).await.unwrap());
}
