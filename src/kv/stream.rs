//! Durable transaction stream: producer and consumer-group consumer.
//!
//! Delivery is at-least-once. Consumers ack explicitly after the whole
//! reconciliation step completes, then delete the entry so `streamsize`
//! converges to zero on a quiet system.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::info;

use super::store::KvError;

/// How long a group read blocks before yielding control back to the loop.
const BLOCK_MILLIS: usize = 5_000;

#[derive(Clone)]
pub struct StreamProducer {
    conn: ConnectionManager,
    stream_key: String,
}

impl StreamProducer {
    pub(super) fn new(conn: ConnectionManager, stream_key: &str) -> Self {
        Self {
            conn,
            stream_key: stream_key.to_string(),
        }
    }

    /// Append a `{tid}` event; returns the entry id.
    pub async fn push_tid(&self, tid: &str) -> Result<String, KvError> {
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.stream_key, "*", &[("tid", tid)])
            .await?;
        Ok(entry_id)
    }

    /// Number of entries currently in the stream.
    pub async fn len(&self) -> Result<u64, KvError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(&self.stream_key).await?;
        Ok(len)
    }
}

/// One delivered stream event.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub entry_id: String,
    pub tid: String,
}

pub struct StreamConsumer {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub(super) async fn new(
        conn: ConnectionManager,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, KvError> {
        let mut this = Self {
            conn,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        };
        this.ensure_group().await?;
        info!(
            "consumer {} joined group {} on stream {}",
            consumer, group, stream_key
        );
        Ok(this)
    }

    async fn ensure_group(&mut self) -> Result<(), KvError> {
        let result: Result<(), redis::RedisError> = self
            .conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Block for the next undelivered entry. `None` on a quiet stream after
    /// the block window elapses.
    pub async fn next(&mut self) -> Result<Option<StreamEntry>, KvError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(BLOCK_MILLIS);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.stream_key.as_str()], &[">"], &options)
            .await?;

        for stream in reply.keys {
            for entry in stream.ids {
                let Some(tid) = entry.get::<String>("tid") else {
                    // Malformed event; drop it so it cannot wedge the group.
                    self.ack(&entry.id).await?;
                    continue;
                };
                return Ok(Some(StreamEntry {
                    entry_id: entry.id,
                    tid,
                }));
            }
        }
        Ok(None)
    }

    /// Acknowledge and delete a processed entry.
    pub async fn ack(&mut self, entry_id: &str) -> Result<(), KvError> {
        let _: i64 = self
            .conn
            .xack(&self.stream_key, &self.group, &[entry_id])
            .await?;
        let _: i64 = self.conn.xdel(&self.stream_key, &[entry_id]).await?;
        Ok(())
    }
}
