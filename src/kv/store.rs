//! Typed async facade over the shared KV store.
//!
//! All mutation paths that must be atomic go through the server-side scripts
//! in [`super::scripts`]; nothing here emulates compare-and-set with a
//! client-side read-then-write. `save` is a single MSET and is atomic per
//! command, not per record lifecycle.

use std::collections::BTreeMap;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::record::{CodecError, FieldCodec, FieldMap, Record};
use super::scripts;
use super::stream::{StreamConsumer, StreamProducer};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("attribute is not numeric")]
    NotNumeric,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Connection to one service's logical store.
///
/// Cheap to clone; every clone shares the underlying multiplexed connection.
#[derive(Clone)]
pub struct KvStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("connected to store at {}", url);
        Ok(Self { client, conn })
    }

    fn key(id: &str, field: &str) -> String {
        format!("model:{id}:{field}")
    }

    /// Field-wise multi-get. Returns `None` when the record is absent (or a
    /// required field is), per the record's own `from_fields`.
    pub async fn get<R: Record>(&self, id: &str) -> Result<Option<R>, KvError> {
        let keys: Vec<String> = R::FIELDS.iter().map(|f| Self::key(id, f)).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut fields = FieldMap::new();
        for (field, value) in R::FIELDS.iter().copied().zip(values) {
            if let Some(raw) = value {
                fields.insert(field, raw);
            }
        }
        if fields.is_empty() {
            return Ok(None);
        }

        match R::from_fields(id, &fields) {
            Ok(record) => Ok(Some(record)),
            Err(CodecError::Missing(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Field-wise multi-set of a whole record. Not atomic across records.
    pub async fn save<R: Record>(&self, record: &R) -> Result<(), KvError> {
        let pairs: Vec<(String, String)> = record
            .to_fields()
            .into_iter()
            .map(|(field, raw)| (Self::key(record.id(), field), raw))
            .collect();
        let mut conn = self.conn.clone();
        let _: () = conn.set_multiple(&pairs).await?;
        Ok(())
    }

    /// Batched save, used by the batch initializers.
    pub async fn save_all<R: Record>(&self, records: &[R]) -> Result<(), KvError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut pairs: Vec<(String, String)> = Vec::with_capacity(records.len() * R::FIELDS.len());
        for record in records {
            for (field, raw) in record.to_fields() {
                pairs.push((Self::key(record.id(), field), raw));
            }
        }
        let mut conn = self.conn.clone();
        let _: () = conn.set_multiple(&pairs).await?;
        Ok(())
    }

    /// Delete all fields of a record. Returns whether anything was removed.
    pub async fn delete<R: Record>(&self, id: &str) -> Result<bool, KvError> {
        let keys: Vec<String> = R::FIELDS.iter().map(|f| Self::key(id, f)).collect();
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(&keys).await?;
        Ok(removed > 0)
    }

    /// Single-field typed read. `None` when the key is absent.
    pub async fn get_attr<T: FieldCodec>(
        &self,
        id: &str,
        field: &'static str,
    ) -> Result<Option<T>, KvError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(id, field)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let value = T::decode(&raw).ok_or(CodecError::Invalid {
                    field,
                    kind: T::KIND,
                    raw,
                })?;
                Ok(Some(value))
            }
        }
    }

    /// Single-field typed write.
    pub async fn set_attr<T: FieldCodec>(
        &self,
        id: &str,
        field: &str,
        value: &T,
    ) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::key(id, field), value.encode()).await?;
        Ok(())
    }

    /// Read one field across many ids. `None` when any id is missing the
    /// field, so callers can refuse mixed batches outright.
    pub async fn m_get_attr<T: FieldCodec>(
        &self,
        ids: &[String],
        field: &'static str,
    ) -> Result<Option<BTreeMap<String, T>>, KvError> {
        if ids.is_empty() {
            return Ok(Some(BTreeMap::new()));
        }
        let keys: Vec<String> = ids.iter().map(|id| Self::key(id, field)).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut result = BTreeMap::new();
        for (id, value) in ids.iter().zip(values) {
            let Some(raw) = value else { return Ok(None) };
            let decoded = T::decode(&raw).ok_or(CodecError::Invalid {
                field,
                kind: T::KIND,
                raw,
            })?;
            result.insert(id.clone(), decoded);
        }
        Ok(Some(result))
    }

    /// Atomic integer add. Fails with [`KvError::NotNumeric`] when the field
    /// holds a non-integer value.
    pub async fn increment(&self, id: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = conn.incr(Self::key(id, field), delta).await;
        match result {
            Ok(value) => Ok(value),
            Err(e)
                if matches!(
                    e.kind(),
                    redis::ErrorKind::ResponseError | redis::ErrorKind::TypeError
                ) =>
            {
                Err(KvError::NotNumeric)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Script-side compare-and-set on one field. Returns true iff the swap
    /// occurred.
    pub async fn compare_and_set<T: FieldCodec>(
        &self,
        id: &str,
        field: &str,
        expected: &T,
        new: &T,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = scripts::COMPARE_AND_SET_SCRIPT
            .key(Self::key(id, field))
            .arg(expected.encode())
            .arg(new.encode())
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    /// Conditional decrement: `field -= amount` iff `amount <= field`, and
    /// the transaction's status flips to SUCCESS or FAILURE in the same
    /// script call. Returns whether the decrement applied.
    pub async fn lte_decrement(
        &self,
        id: &str,
        field: &str,
        amount: i64,
        tid: &str,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let result: i64 = scripts::LTE_DECREMENT_SCRIPT
            .key(Self::key(tid, "status"))
            .key(Self::key(id, field))
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        Ok(result != -1)
    }

    /// Bulk conditional decrement; all-or-nothing across `changes`, with the
    /// same status flip contract as [`Self::lte_decrement`].
    pub async fn m_gte_decrement(
        &self,
        tid: &str,
        changes: &BTreeMap<String, i64>,
        field: &str,
    ) -> Result<bool, KvError> {
        if changes.is_empty() {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        let mut invocation = scripts::M_GTE_DECREMENT_SCRIPT.prepare_invoke();
        invocation.key(Self::key(tid, "status"));
        for id in changes.keys() {
            invocation.key(Self::key(id, field));
        }
        for amount in changes.values() {
            invocation.arg(*amount);
        }
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(result != -1)
    }

    /// Request a point-in-time durable image of the store. A save already in
    /// flight counts as success.
    pub async fn snapshot(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> =
            redis::cmd("BGSAVE").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("in progress") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire an expiring advisory lock (`SET NX EX`). Returns whether this
    /// caller now holds it.
    pub async fn acquire_ttl_lock(
        &self,
        id: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(id, "owner"))
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn release_ttl_lock(&self, id: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(Self::key(id, "owner")).await?;
        Ok(())
    }

    pub fn stream_producer(&self, stream_key: &str) -> StreamProducer {
        StreamProducer::new(self.conn.clone(), stream_key)
    }

    /// Stream consumers block on group reads, so each one gets a dedicated
    /// connection instead of sharing the multiplexed one.
    pub async fn stream_consumer(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<StreamConsumer, KvError> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        StreamConsumer::new(conn, stream_key, group, consumer).await
    }
}
