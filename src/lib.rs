#![deny(clippy::all)]

//! Ingestion pipeline for the journals of the 1C business platform.
//!
//! Two journal families are followed: the binary-framed event log (rotating
//! `.lgp` segments plus the `1Cv8.lgf` reference dictionary) and the
//! plain-text tech log (hierarchical directories of hourly files). Both are
//! parsed into normalized records, deduplicated by content hash, batched,
//! and appended to ClickHouse.

pub mod config;
pub mod discovery;
pub mod eventlog;
pub mod fingerprint;
pub mod model;
pub mod normalize;
pub mod offsets;
pub mod service;
pub mod sink;
pub mod techlog;
