//! KV primitive layer: typed record facade, server-side scripts, and the
//! durable transaction stream.

pub mod record;
pub mod scripts;
pub mod store;
pub mod stream;

pub use record::{CodecError, FieldCodec, FieldMap, Record};
pub use store::{KvError, KvStore};
pub use stream::{StreamConsumer, StreamEntry, StreamProducer};
