//! Thin ClickHouse HTTP client.
//!
//! All traffic goes over the HTTP interface: DDL and reads as query bodies,
//! inserts as `INSERT INTO ... FORMAT JSONEachRow` with newline-delimited
//! JSON rows. Errors carry enough context for the retry classifier to
//! separate transient conditions from terminal ones.

use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;
use tracing::trace;

/// Server-side error fragments that indicate a retryable condition. The
/// list is deliberately a plain substring match, like the upstream drivers
/// use: ClickHouse wraps these codes in free-form text.
const TRANSIENT_MARKERS: &[&str] = &[
    "Timeout exceeded",
    "timed out",
    "Too many simultaneous queries",
    "TOO_MANY_SIMULTANEOUS_QUERIES",
    "Memory limit",
    "MEMORY_LIMIT_EXCEEDED",
    "Table is in readonly mode",
    "ZooKeeper session",
    "Connection refused",
    "connection reset",
    "broken pipe",
    "try again later",
];

#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("sink transport error: {source}"))]
    Transport { source: reqwest::Error },
    #[snafu(display("sink returned HTTP {status}: {body}"))]
    Server { status: u16, body: String },
    #[snafu(display("sink response is not the expected JSON: {source}"))]
    BadResponse { source: serde_json::Error },
}

impl SinkError {
    /// Whether a retry may succeed. Network-level failures and throttling
    /// retry; anything else (bad SQL, schema drift) is terminal for the
    /// operation.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Transport { source } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            SinkError::Server { status, body } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
                    || TRANSIENT_MARKERS
                        .iter()
                        .any(|marker| body.contains(marker))
            }
            SinkError::BadResponse { .. } => false,
        }
    }
}

#[derive(Clone)]
pub struct ClickhouseClient {
    http: reqwest::Client,
    endpoint: String,
    database: String,
}

impl ClickhouseClient {
    pub fn new(host: &str, port: u16, database: &str) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|source| SinkError::Transport { source })?;
        Ok(Self {
            http,
            endpoint: format!("http://{host}:{port}/"),
            database: database.to_owned(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Fully qualified table name.
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", self.database, name)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Server {
            status: status.as_u16(),
            body,
        })
    }

    /// Run a statement with no result set (DDL, TRUNCATE, INSERT SELECT).
    pub async fn execute(&self, sql: &str) -> Result<(), SinkError> {
        trace!(message = "Executing sink statement.", sql = %crate::eventlog::bracket::preview(sql));
        let response = self
            .http
            .post(&self.endpoint)
            .body(sql.to_owned())
            .send()
            .await
            .map_err(|source| SinkError::Transport { source })?;
        Self::check(response).await.map(drop)
    }

    /// Append rows to a table as JSONEachRow. `rows` must already be
    /// JSON-serialized objects, one per record.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = String::with_capacity(rows.len() * 256);
        for row in rows {
            body.push_str(&row.to_string());
            body.push('\n');
        }
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table(table));
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("query", query.as_str())])
            .body(body)
            .send()
            .await
            .map_err(|source| SinkError::Transport { source })?;
        Self::check(response).await.map(drop)
    }

    /// Run a SELECT and return its rows as JSON objects.
    pub async fn query_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, SinkError> {
        #[derive(Deserialize)]
        struct JsonResult {
            data: Vec<serde_json::Value>,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .body(format!("{sql} FORMAT JSON"))
            .send()
            .await
            .map_err(|source| SinkError::Transport { source })?;
        let response = Self::check(response).await?;
        let body = response
            .text()
            .await
            .map_err(|source| SinkError::Transport { source })?;
        let parsed: JsonResult =
            serde_json::from_str(&body).map_err(|source| SinkError::BadResponse { source })?;
        Ok(parsed.data)
    }
}
