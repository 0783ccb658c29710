//! Order service entry point: checkout orchestrator + order HTTP surface.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use checkout_fabric::config::ServiceConfig;
use checkout_fabric::logging::init_logging;
use checkout_fabric::order::{self, OrderService};
use checkout_fabric::rpc::{PaymentClient, StockClient};
use checkout_fabric::snapshot::SnapshotGate;
use checkout_fabric::KvStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env("order")?;
    let _guard = init_logging(&config.log);

    let store = KvStore::connect(&config.redis_url).await?;
    // The order side runs no stream consumers, so its gate is ready as soon
    // as the HALTED flag is up.
    let gate = SnapshotGate::new(store.clone(), 0);
    let service = Arc::new(OrderService::new(
        store,
        gate,
        StockClient::new(&config.stock_rpc_addr),
        PaymentClient::new(&config.payment_rpc_addr),
    ));

    let app = order::router(service);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("order service listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
