//! Reconciliation processor — the "vibe checker".
//!
//! One consumer per replica drains the service's transaction stream, pairs
//! each local leg with the peer leg over `VibeCheckTransactionStatus`, and
//! either finalizes the committed bookkeeping or compensates the resource.
//! The record-delete step plus the advisory lock guarantee that exactly one
//! of the two sides resolves each pair; the resolver is also the only caller
//! of the order service's commit hook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::kv::stream::{StreamConsumer, StreamEntry, StreamProducer};
use crate::kv::{KvError, KvStore};
use crate::models::{
    PENDING_COUNTER, TRANSACTION_CONSUMER_GROUP, TRANSACTIONS_STREAM, TransactionStatus,
};
use crate::rpc::{CommitRpc, PeerRpc, RpcError, TransactionStatusReply, VibeCheckRequest};
use crate::snapshot::SnapshotGate;
use crate::txn::TxnLog;

/// Retry budget for the peer-side transaction lookup before it goes STALE.
pub const VIBE_CHECK_ATTEMPTS: u32 = 10;
pub const VIBE_CHECK_DELAY: Duration = Duration::from_millis(500);

/// Jitter window for contested-lock and pending requeues.
const REQUEUE_JITTER_MS: std::ops::Range<u64> = 10..100;

/// Which resource a service's leg mutates.
#[derive(Debug, Clone, Copy)]
pub struct LegProfile {
    pub service: &'static str,
    pub resource_field: &'static str,
    pub committed_field: &'static str,
}

pub const STOCK_LEG: LegProfile = LegProfile {
    service: "stock",
    resource_field: "stock",
    committed_field: "committed_stock",
};

pub const PAYMENT_LEG: LegProfile = LegProfile {
    service: "payment",
    resource_field: "credit",
    committed_field: "committed_credit",
};

/// Outcome of pairing a local leg with the peer's reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Both legs succeeded: retire the committed bookkeeping.
    Finalize,
    /// Local leg succeeded alone: restore the resource.
    Compensate,
    /// Local leg never debited anything.
    Noop,
}

/// The pure core of the reconciliation state machine.
pub fn reconcile_action(local: TransactionStatus, peer_success: bool) -> ReconcileAction {
    match (local, peer_success) {
        (TransactionStatus::Success, true) => ReconcileAction::Finalize,
        (TransactionStatus::Success, false) => ReconcileAction::Compensate,
        _ => ReconcileAction::Noop,
    }
}

/// Apply a reconciliation decision to the resources named in the leg's
/// details map.
pub async fn apply_action(
    store: &KvStore,
    profile: &LegProfile,
    details: &BTreeMap<String, i64>,
    action: ReconcileAction,
) -> Result<(), KvError> {
    match action {
        ReconcileAction::Finalize => {
            for (id, amount) in details {
                store.increment(id, profile.committed_field, -amount).await?;
            }
        }
        ReconcileAction::Compensate => {
            for (id, amount) in details {
                store.increment(id, profile.resource_field, *amount).await?;
                store.increment(id, profile.committed_field, -amount).await?;
            }
        }
        ReconcileAction::Noop => {}
    }
    Ok(())
}

/// Peer-facing half of the pairing, served under
/// `/rpc/vibe_check_transaction_status`.
///
/// The handler resolves its own side from the caller's reported outcome. A
/// record that never shows up within the retry budget is written off as
/// STALE so the missing leg's late write gets rejected. PENDING and locked
/// records push back with FAILED_PRECONDITION; the caller requeues.
pub async fn vibe_check_handler(
    store: &KvStore,
    txns: &TxnLog,
    profile: &LegProfile,
    request: VibeCheckRequest,
) -> Result<TransactionStatusReply, RpcError> {
    let tid = request.tid.as_str();

    let Some(txn) = txns
        .find_with_retry(tid, VIBE_CHECK_ATTEMPTS, VIBE_CHECK_DELAY)
        .await?
    else {
        warn!("{}: transaction {} never arrived, marking stale", profile.service, tid);
        txns.mark_stale(tid).await?;
        return Ok(TransactionStatusReply {
            tid: tid.to_string(),
            success: false,
        });
    };

    if txn.status == TransactionStatus::Stale {
        return Ok(TransactionStatusReply {
            tid: tid.to_string(),
            success: false,
        });
    }
    if txn.status == TransactionStatus::Pending {
        return Err(RpcError::FailedPrecondition(format!(
            "transaction {tid} still pending"
        )));
    }

    if !txns.try_lock(tid).await? {
        return Err(RpcError::FailedPrecondition(format!(
            "transaction {tid} locked"
        )));
    }

    txns.delete(tid).await?;
    let action = reconcile_action(txn.status, request.success);
    apply_action(store, profile, &txn.details, action).await?;
    debug!(
        "{}: vibe check resolved {} as {:?} (local {}, peer success={})",
        profile.service,
        tid,
        action,
        txn.status.as_str(),
        request.success
    );

    Ok(TransactionStatusReply {
        tid: tid.to_string(),
        success: txn.status == TransactionStatus::Success,
    })
}

/// One reconciliation consumer replica.
pub struct VibeChecker {
    store: KvStore,
    txns: TxnLog,
    gate: SnapshotGate,
    peer: Arc<dyn PeerRpc>,
    order: Arc<dyn CommitRpc>,
    profile: LegProfile,
    producer: StreamProducer,
    consumer: StreamConsumer,
}

impl VibeChecker {
    pub async fn new(
        store: KvStore,
        gate: SnapshotGate,
        peer: Arc<dyn PeerRpc>,
        order: Arc<dyn CommitRpc>,
        profile: LegProfile,
        consumer_name: &str,
    ) -> Result<Self, KvError> {
        let producer = store.stream_producer(TRANSACTIONS_STREAM);
        let consumer = store
            .stream_consumer(TRANSACTIONS_STREAM, TRANSACTION_CONSUMER_GROUP, consumer_name)
            .await?;
        Ok(Self {
            txns: TxnLog::new(store.clone()),
            store,
            gate,
            peer,
            order,
            profile,
            producer,
            consumer,
        })
    }

    /// Consume until the task is dropped. Store errors back off and retry;
    /// nothing is acked before its reconciliation step completed.
    pub async fn run(mut self) {
        info!("{}: vibe checker running", self.profile.service);
        loop {
            if let Err(e) = self.step().await {
                error!("{}: reconciliation step failed: {}", self.profile.service, e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn step(&mut self) -> Result<(), KvError> {
        self.gate.pause_for_snapshot().await?;
        let Some(entry) = self.consumer.next().await? else {
            return Ok(());
        };
        self.handle(entry).await
    }

    async fn handle(&mut self, entry: StreamEntry) -> Result<(), KvError> {
        let tid = entry.tid.clone();

        // Absent or stale records mean the pair was already resolved (or
        // written off); duplicate deliveries die here.
        let Some(txn) = self.txns.load(&tid).await? else {
            debug!("{}: {} already reconciled, skipping", self.profile.service, tid);
            return self.consumer.ack(&entry.entry_id).await;
        };
        if txn.status == TransactionStatus::Stale {
            return self.consumer.ack(&entry.entry_id).await;
        }

        if !self.txns.try_lock(&tid).await? {
            return self.requeue(entry).await;
        }

        if txn.status == TransactionStatus::Pending {
            // Common race: the event beat the decrement script. Park the
            // event back on the stream and let the flip win.
            self.store.increment(PENDING_COUNTER, "count", 1).await?;
            self.txns.unlock(&tid).await?;
            return self.requeue(entry).await;
        }

        let local_success = txn.status == TransactionStatus::Success;
        let peer = match self.peer.vibe_check(&tid, local_success).await {
            Ok(reply) => reply,
            Err(RpcError::FailedPrecondition(reason)) => {
                debug!("{}: peer busy on {}: {}", self.profile.service, tid, reason);
                self.txns.unlock(&tid).await?;
                return self.requeue(entry).await;
            }
            Err(e) => {
                warn!("{}: vibe check for {} failed: {}", self.profile.service, tid, e);
                self.txns.unlock(&tid).await?;
                return self.requeue(entry).await;
            }
        };

        self.txns.delete(&tid).await?;
        let action = reconcile_action(txn.status, peer.success);
        apply_action(&self.store, &self.profile, &txn.details, action).await?;
        info!(
            "{}: reconciled {} as {:?} (local {}, peer success={})",
            self.profile.service,
            tid,
            action,
            txn.status.as_str(),
            peer.success
        );

        if action == ReconcileAction::Finalize {
            // The resolver is the single committer. The legs are already
            // finalized here, so a failed commit call only delays the paid
            // counter, never the funds.
            if let Err(e) = self.order.commit_checkout(&tid).await {
                warn!(
                    "{}: commit_checkout for {} failed (legs already finalized): {}",
                    self.profile.service, tid, e
                );
            }
        }

        self.consumer.ack(&entry.entry_id).await
    }

    /// Put the event back with jitter so contending consumers interleave
    /// instead of hot-looping on each other's locks.
    async fn requeue(&mut self, entry: StreamEntry) -> Result<(), KvError> {
        let jitter = rand::thread_rng().gen_range(REQUEUE_JITTER_MS);
        sleep(Duration::from_millis(jitter)).await;
        self.producer.push_tid(&entry.tid).await?;
        self.consumer.ack(&entry.entry_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_decision_table() {
        use TransactionStatus::*;

        assert_eq!(reconcile_action(Success, true), ReconcileAction::Finalize);
        assert_eq!(reconcile_action(Success, false), ReconcileAction::Compensate);
        assert_eq!(reconcile_action(Failure, true), ReconcileAction::Noop);
        assert_eq!(reconcile_action(Failure, false), ReconcileAction::Noop);
        // A stale or still-pending local leg never moves resources.
        assert_eq!(reconcile_action(Stale, true), ReconcileAction::Noop);
        assert_eq!(reconcile_action(Pending, true), ReconcileAction::Noop);
    }

    #[test]
    fn test_leg_profiles() {
        assert_eq!(STOCK_LEG.resource_field, "stock");
        assert_eq!(STOCK_LEG.committed_field, "committed_stock");
        assert_eq!(PAYMENT_LEG.resource_field, "credit");
        assert_eq!(PAYMENT_LEG.committed_field, "committed_credit");
    }
}
