//! Service-side snapshot lifecycle.
//!
//! The controller halts the fabric through each service's gate: the HALTED
//! flag refuses new checkouts and parks the stream consumers, the halted
//! consumer counter reports when every replica reached a stream boundary,
//! and the expiring snapshot lock keeps overlapping snapshot rounds out.

use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use crate::kv::{KvError, KvStore};
use crate::models::{Counter, Flag, HALTED_CONSUMERS_COUNTER, HALTED_FLAG};

/// Advisory lock record guarding one service's snapshot window.
pub const SNAPSHOT_LOCK: &str = "snapshot_lock";
/// Lock TTL; a crashed controller cannot wedge the service for longer.
pub const SNAPSHOT_LOCK_TTL_SECS: u64 = 5;

/// Poll cadence for parked consumers and the readiness check.
const HALT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SnapshotGate {
    store: KvStore,
    expected_consumers: i64,
}

impl SnapshotGate {
    pub fn new(store: KvStore, expected_consumers: i64) -> Self {
        Self {
            store,
            expected_consumers,
        }
    }

    /// Enter the snapshot window: take the expiring lock, raise HALTED.
    /// Returns false when a window is already open.
    pub async fn prepare(&self, owner: &str) -> Result<bool, KvError> {
        if !self
            .store
            .acquire_ttl_lock(SNAPSHOT_LOCK, owner, SNAPSHOT_LOCK_TTL_SECS)
            .await?
        {
            return Ok(false);
        }
        self.store
            .save(&Flag {
                id: HALTED_FLAG.to_string(),
                enabled: true,
            })
            .await?;
        info!("snapshot window opened by {}", owner);
        Ok(true)
    }

    /// All consumer replicas have parked at a stream boundary.
    pub async fn ready(&self) -> Result<bool, KvError> {
        let parked = self
            .store
            .get::<Counter>(HALTED_CONSUMERS_COUNTER)
            .await?
            .map(|c| c.count)
            .unwrap_or(0);
        Ok(parked >= self.expected_consumers)
    }

    pub async fn snapshot(&self) -> Result<(), KvError> {
        self.store.snapshot().await
    }

    /// Leave the snapshot window: clear HALTED, reset the counter, release
    /// the lock. Parked consumers wake on their next poll.
    pub async fn resume(&self) -> Result<(), KvError> {
        self.store
            .save(&Flag {
                id: HALTED_FLAG.to_string(),
                enabled: false,
            })
            .await?;
        self.store
            .save(&Counter {
                id: HALTED_CONSUMERS_COUNTER.to_string(),
                count: 0,
            })
            .await?;
        self.store.release_ttl_lock(SNAPSHOT_LOCK).await?;
        info!("snapshot window closed");
        Ok(())
    }

    pub async fn is_halted(&self) -> Result<bool, KvError> {
        let halted = self
            .store
            .get::<Flag>(HALTED_FLAG)
            .await?
            .map(|f| f.enabled)
            .unwrap_or(false);
        Ok(halted)
    }

    /// Consumer hook, called before every stream read. On HALTED the replica
    /// reports itself parked exactly once and then polls until released.
    pub async fn pause_for_snapshot(&self) -> Result<(), KvError> {
        if !self.is_halted().await? {
            return Ok(());
        }
        let parked = self
            .store
            .increment(HALTED_CONSUMERS_COUNTER, "count", 1)
            .await?;
        info!("consumer parked for snapshot ({} parked)", parked);
        while self.is_halted().await? {
            sleep(HALT_POLL).await;
        }
        Ok(())
    }
}
