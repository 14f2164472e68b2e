//! The sink side of the pipeline: the ClickHouse HTTP client, the batch
//! writer with its flush/dedup/commit cycle, the retry primitive, and
//! schema bootstrap.

mod batcher;
mod client;
mod retries;
mod schema;
pub mod testing;
mod transport;

pub use self::batcher::{
    BatchRecord, BatchWriter, CommittedOffsets, Envelope, FileOrigin, WriterConfig, WriterHandle,
    WriterMsg,
};
pub use self::client::{ClickhouseClient, SinkError};
pub use self::retries::{retry_with_backoff, ExponentialBackoff, MAX_ATTEMPTS};
pub use self::schema::{ensure_schema, schema_statements};
pub use self::transport::SinkTransport;
