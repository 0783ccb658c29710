//! Transaction record lifecycle and the advisory lock.
//!
//! A leg writes its PENDING record before the conditional decrement runs, so
//! the stream event and the peer's vibe check always find it. The advisory
//! lock rides on the record's `locked` field and transfers via the
//! compare-and-set script; the holder releases by deleting the record, or by
//! swapping the flag back on requeue paths.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::sleep;

use crate::kv::{KvError, KvStore};
use crate::models::{Transaction, TransactionStatus};

#[derive(Clone)]
pub struct TxnLog {
    store: KvStore,
}

impl TxnLog {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Write a fresh PENDING record carrying the per-key deltas of this leg.
    pub async fn create_pending(
        &self,
        tid: &str,
        details: BTreeMap<String, i64>,
    ) -> Result<(), KvError> {
        self.store.save(&Transaction::pending(tid, details)).await
    }

    pub async fn load(&self, tid: &str) -> Result<Option<Transaction>, KvError> {
        self.store.get(tid).await
    }

    pub async fn status(&self, tid: &str) -> Result<Option<TransactionStatus>, KvError> {
        self.store.get_attr(tid, "status").await
    }

    /// Take the advisory lock. Returns false when another holder has it.
    pub async fn try_lock(&self, tid: &str) -> Result<bool, KvError> {
        self.store
            .compare_and_set(tid, "locked", &false, &true)
            .await
    }

    /// Release without deleting, for requeue paths.
    pub async fn unlock(&self, tid: &str) -> Result<(), KvError> {
        self.store.set_attr(tid, "locked", &false).await
    }

    pub async fn delete(&self, tid: &str) -> Result<bool, KvError> {
        self.store.delete::<Transaction>(tid).await
    }

    /// Terminal STALE marker; a later leg write for this tid gets rejected.
    pub async fn mark_stale(&self, tid: &str) -> Result<(), KvError> {
        self.store.save(&Transaction::stale(tid)).await
    }

    /// Poll for a record that may not have landed yet. Used by the vibe
    /// check handler; the caller decides what exhaustion means.
    pub async fn find_with_retry(
        &self,
        tid: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Option<Transaction>, KvError> {
        for attempt in 0..attempts {
            if let Some(txn) = self.load(tid).await? {
                return Ok(Some(txn));
            }
            if attempt + 1 < attempts {
                sleep(delay).await;
            }
        }
        Ok(None)
    }
}
