//! Recording sink transport for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::client::SinkError;
use super::transport::SinkTransport;

/// In-memory stand-in for the sink. Inserted rows are kept per table; the
/// dedup probe consults both preloaded hashes and rows inserted earlier,
/// which is exactly what crash-replay scenarios need.
#[derive(Default)]
pub struct MockSink {
    rows: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    preloaded: Mutex<HashMap<String, HashSet<String>>>,
    failing_tables: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
    fail_execute_containing: Mutex<Option<String>>,
    query_results: Mutex<VecDeque<Vec<serde_json::Value>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, table: &str) -> Vec<serde_json::Value> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Pretend `hash` is already stored in `table`.
    pub fn preload_hash(&self, table: &str, hash: &str) {
        self.preloaded
            .lock()
            .unwrap()
            .entry(table.to_owned())
            .or_default()
            .insert(hash.to_owned());
    }

    /// Make inserts into `table` fail terminally.
    pub fn fail_table(&self, table: &str) {
        self.failing_tables.lock().unwrap().insert(table.to_owned());
    }

    /// Make `execute` fail for statements containing `fragment`.
    pub fn fail_execute_containing(&self, fragment: &str) {
        *self.fail_execute_containing.lock().unwrap() = Some(fragment.to_owned());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Queue a result set for the next `query_json` call.
    pub fn push_query_result(&self, rows: Vec<serde_json::Value>) {
        self.query_results.lock().unwrap().push_back(rows);
    }

    fn terminal(body: &str) -> SinkError {
        SinkError::Server {
            status: 400,
            body: body.to_owned(),
        }
    }
}

#[async_trait]
impl SinkTransport for MockSink {
    async fn execute(&self, sql: &str) -> Result<(), SinkError> {
        if let Some(fragment) = self.fail_execute_containing.lock().unwrap().as_deref() {
            if sql.contains(fragment) {
                return Err(Self::terminal("mock execute failure"));
            }
        }
        self.executed.lock().unwrap().push(sql.to_owned());
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), SinkError> {
        if self.failing_tables.lock().unwrap().contains(table) {
            return Err(Self::terminal("mock insert failure"));
        }
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_owned())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn query_json(&self, _sql: &str) -> Result<Vec<serde_json::Value>, SinkError> {
        Ok(self
            .query_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn probe_hashes(
        &self,
        table: &str,
        _time_column: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        hashes: &[String],
    ) -> Result<HashSet<String>, SinkError> {
        let mut known: HashSet<String> = self
            .preloaded
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default();
        if let Some(rows) = self.rows.lock().unwrap().get(table) {
            known.extend(rows.iter().filter_map(|row| {
                row.get("record_hash")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            }));
        }
        Ok(hashes
            .iter()
            .filter(|hash| known.contains(*hash))
            .cloned()
            .collect())
    }

    fn table(&self, name: &str) -> String {
        format!("logs.{name}")
    }
}
