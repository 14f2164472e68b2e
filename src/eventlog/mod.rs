//! Event-log ingestion: brace-record scanning, the reference dictionary,
//! localized presentations, and the segment parser.

pub mod bracket;
pub mod dictionary;
pub mod parser;
pub mod presentation;

pub use self::dictionary::{Dictionary, LazyDictionary, ObjectKind};
pub use self::parser::{
    ProgressFn, ProgressUpdate, SegmentError, SegmentStats, SegmentStream, StreamStep,
    PROGRESS_INTERVAL,
};
