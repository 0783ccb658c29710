//! Stock service entry point: RPC + HTTP surface and the stock-side
//! reconciliation consumers.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use checkout_fabric::config::ServiceConfig;
use checkout_fabric::logging::init_logging;
use checkout_fabric::reconcile::{STOCK_LEG, VibeChecker};
use checkout_fabric::rpc::{OrderClient, PaymentClient};
use checkout_fabric::snapshot::SnapshotGate;
use checkout_fabric::stock::{self, StockService};
use checkout_fabric::KvStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env("stock")?;
    let _guard = init_logging(&config.log);

    let store = KvStore::connect(&config.redis_url).await?;
    let gate = SnapshotGate::new(store.clone(), config.stream_consumers);

    let payment: Arc<PaymentClient> = Arc::new(PaymentClient::new(&config.payment_rpc_addr));
    let order: Arc<OrderClient> = Arc::new(OrderClient::new(&config.order_addr));
    for i in 0..config.stream_consumers {
        let checker = VibeChecker::new(
            store.clone(),
            gate.clone(),
            payment.clone(),
            order.clone(),
            STOCK_LEG,
            &format!("consumer_{}", i + 1),
        )
        .await?;
        tokio::spawn(checker.run());
    }

    let service = Arc::new(StockService::new(store, gate));
    let app = stock::router(service);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("stock service listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
