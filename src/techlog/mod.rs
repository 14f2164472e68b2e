//! Tech-log ingestion: record framing, key=value parsing, and the
//! filename-derived clock. The rotation-aware tailing itself comes from
//! the `file-tail` crate; the worker loop lives in the service module.

pub mod parser;

pub use self::parser::{
    hour_from_filename, is_record_start, parse_record, LineAssembler, TechParseError,
};
