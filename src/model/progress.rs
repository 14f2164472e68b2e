use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ch_datetime;

/// Which journal family a file belongs to. Doubles as the offset-store
/// bucket name and the `parser_type`/`source_type` sink column.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    EventLog,
    TechLog,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventLog => "event_log",
            Self::TechLog => "tech_log",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable read progress for one file. The tech-log variant additionally
/// carries the line number (archives resume by line, not byte).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub offset: u64,
    pub records: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_record_ts: Option<DateTime<Utc>>,
    pub file_size: u64,
    /// `(dev, inode)` of the file the offset belongs to; a mismatch on
    /// reopen means the path was rotated and the offset is stale.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ident: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub line: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Per-file throughput accounting, written to the sink's replacing-merge
/// `parser_metrics` table after every flush. Repeated writes for the same
/// `(parser_type, cluster, infobase, file_path)` key replace earlier rows.
#[derive(Clone, Debug, Serialize)]
pub struct ParserMetrics {
    pub parser_type: SourceKind,
    pub cluster_guid: String,
    pub infobase_guid: String,
    pub file_path: String,
    pub files_processed: u64,
    pub records: u64,
    pub errors: u64,
    pub read_us: u64,
    pub parse_us: u64,
    pub dedup_us: u64,
    pub write_us: u64,
    pub records_per_sec: f64,
    #[serde(with = "ch_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "ch_datetime")]
    pub finished_at: DateTime<Utc>,
    #[serde(with = "ch_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Dashboard row describing how far into a file the parser has read.
#[derive(Clone, Debug, Serialize)]
pub struct ReadingProgress {
    pub parser_type: SourceKind,
    pub cluster_guid: String,
    pub infobase_guid: String,
    pub file_path: String,
    pub offset: u64,
    pub file_size: u64,
    pub percent: f64,
    #[serde(with = "ch_datetime")]
    pub last_record_ts: DateTime<Utc>,
    #[serde(with = "ch_datetime")]
    pub updated_at: DateTime<Utc>,
}
