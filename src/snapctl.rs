//! Snapshot controller: the cron-driven quiesce → snapshot → resume cycle.
//!
//! A cycle halts the order surface first (so no new sagas start), then the
//! two leg services; polls every 100 ms until each service reports its
//! consumer replicas parked; snapshots all three stores; and releases the
//! fabric. A cycle that finds another snapshot window already open backs
//! out and tries again next tick.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::rpc::{OrderClient, PaymentClient, RpcError, StockClient};

/// Readiness poll cadence.
const READY_POLL: Duration = Duration::from_millis(100);
/// Give up on a cycle when the replicas never all park.
const READY_POLL_LIMIT: u32 = 100;

pub struct SnapshotController {
    order: OrderClient,
    stock: StockClient,
    payment: PaymentClient,
    interval: Duration,
}

impl SnapshotController {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            order: OrderClient::new(&config.order_addr),
            stock: StockClient::new(&config.stock_rpc_addr),
            payment: PaymentClient::new(&config.payment_rpc_addr),
            interval: Duration::from_secs(config.snapshot_interval_secs),
        }
    }

    /// Drive cycles forever. A failed cycle releases whatever it halted and
    /// waits for the next tick.
    pub async fn run(self) {
        info!("snapshot controller running, interval {:?}", self.interval);
        loop {
            if let Err(e) = self.cycle().await {
                error!("snapshot cycle failed: {}", e);
                if let Err(e) = self.resume_all().await {
                    error!("post-failure resume failed: {}", e);
                }
            }
            sleep(self.interval).await;
        }
    }

    pub async fn cycle(&self) -> Result<(), RpcError> {
        if !self.prepare_all().await? {
            warn!("snapshot already in progress somewhere, releasing and skipping cycle");
            self.resume_all().await?;
            return Ok(());
        }
        self.wait_ready().await?;
        self.snapshot_all().await?;
        self.resume_all().await?;
        info!("snapshot cycle complete");
        Ok(())
    }

    /// Halt the order surface, then both leg services. All three must
    /// acquire their snapshot locks for the cycle to proceed.
    async fn prepare_all(&self) -> Result<bool, RpcError> {
        let order_ready = self.order.prepare_rollback().await?;
        let stock_ready = self.stock.prepare_snapshot().await?;
        let payment_ready = self.payment.prepare_snapshot().await?;
        Ok(order_ready && stock_ready && payment_ready)
    }

    /// Poll until every consumer replica parked at a stream boundary.
    async fn wait_ready(&self) -> Result<(), RpcError> {
        let mut stock_ready = false;
        let mut payment_ready = false;
        for _ in 0..READY_POLL_LIMIT {
            sleep(READY_POLL).await;
            if !stock_ready {
                stock_ready = self.stock.check_snapshot_ready().await?;
            }
            if !payment_ready {
                payment_ready = self.payment.check_snapshot_ready().await?;
            }
            if stock_ready && payment_ready {
                info!("all consumers parked, snapshotting");
                return Ok(());
            }
        }
        Err(RpcError::Internal(
            "consumers never parked for snapshot".to_string(),
        ))
    }

    async fn snapshot_all(&self) -> Result<(), RpcError> {
        self.order.snapshot().await?;
        self.stock.snapshot().await?;
        self.payment.snapshot().await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), RpcError> {
        self.order.continue_serving().await?;
        self.stock.continue_consuming().await?;
        self.payment.continue_consuming().await?;
        Ok(())
    }
}
