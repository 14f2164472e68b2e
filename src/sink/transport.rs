//! The transport capability the batch writer and aggregator talk through.
//!
//! One production implementation (the HTTP client); tests substitute a
//! recording mock. Keeping the surface narrow is what makes the writer's
//! commit/drop/dedup logic testable without a running sink.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::format_ch_datetime;

use super::client::{ClickhouseClient, SinkError};

#[async_trait]
pub trait SinkTransport: Send + Sync + 'static {
    async fn execute(&self, sql: &str) -> Result<(), SinkError>;

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), SinkError>;

    async fn query_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, SinkError>;

    /// Which of `hashes` already exist in `table` within the time window.
    /// Batched as a single IN-list query to amortize round-trips.
    async fn probe_hashes(
        &self,
        table: &str,
        time_column: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        hashes: &[String],
    ) -> Result<HashSet<String>, SinkError>;

    /// Fully qualified table name in this transport's database.
    fn table(&self, name: &str) -> String;
}

#[async_trait]
impl SinkTransport for ClickhouseClient {
    async fn execute(&self, sql: &str) -> Result<(), SinkError> {
        ClickhouseClient::execute(self, sql).await
    }

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), SinkError> {
        ClickhouseClient::insert_rows(self, table, rows).await
    }

    async fn query_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, SinkError> {
        ClickhouseClient::query_json(self, sql).await
    }

    async fn probe_hashes(
        &self,
        table: &str,
        time_column: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        hashes: &[String],
    ) -> Result<HashSet<String>, SinkError> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let list = hashes
            .iter()
            .map(|h| format!("'{h}'"))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT DISTINCT record_hash FROM {} \
             WHERE {time_column} >= '{}' AND {time_column} <= '{}' \
             AND record_hash IN ({list})",
            self.table(table),
            format_ch_datetime(&from),
            format_ch_datetime(&to),
        );
        let rows = ClickhouseClient::query_json(self, &sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.get("record_hash")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .collect())
    }

    fn table(&self, name: &str) -> String {
        ClickhouseClient::table(self, name)
    }
}
