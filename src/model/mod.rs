//! Record types shared by the parsers, the batch writer, and the offset
//! store. Records are immutable once emitted by a parser.

mod event_log;
mod progress;
mod tech_log;

pub use self::event_log::{no_transaction_sentinel, EventLogRecord, Severity, TransactionStatus};
pub use self::progress::{FileProgress, ParserMetrics, ReadingProgress, SourceKind};
pub use self::tech_log::TechLogRecord;

/// Two-level identity of the source system a file belongs to, derived from
/// the directory layout (and optionally overridden by the cluster map).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceIdentity {
    pub cluster_guid: String,
    pub cluster_name: String,
    pub infobase_guid: String,
    pub infobase_name: String,
}

/// Format a timestamp the way the sink's `DateTime64(6)` columns expect.
pub fn format_ch_datetime(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// ClickHouse `DateTime64(6)` text form, UTC, for JSONEachRow bodies.
pub(crate) mod ch_datetime {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_ch_datetime(ts))
    }
}
