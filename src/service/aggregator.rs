//! Background normalized-error aggregation.
//!
//! On a fixed cadence, recent errors from both journals are pulled back
//! out of the sink, normalized, grouped by SipHash signature, and written
//! into the `mv_new_errors` summary table (truncate, then insert; the
//! table's replacing-merge collapses whatever survives a failed truncate).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::format_ch_datetime;
use crate::normalize::{error_signature, normalize_error_text, normalize_sql_text};
use crate::sink::{SinkError, SinkTransport};

/// Default cadence of the aggregation pass.
pub const AGGREGATE_EVERY: Duration = Duration::from_secs(600);
/// How far back the pass looks.
pub const WINDOW_HOURS: u32 = 48;
/// Sample lines kept per signature.
const MAX_SAMPLES: usize = 5;

pub(crate) async fn run_error_aggregator(
    transport: Arc<dyn SinkTransport>,
    cancel: CancellationToken,
    every: Duration,
    window_hours: u32,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(error) = aggregate_once(transport.as_ref(), window_hours).await {
            warn!(message = "Error aggregation pass failed.", %error);
        }
    }
}

struct Bucket {
    cluster_guid: String,
    infobase_guid: String,
    source: &'static str,
    name: String,
    normalized: String,
    samples: Vec<String>,
    occurrences: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

fn parse_seen(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    })
    .unwrap_or_else(Utc::now)
}

pub(crate) async fn aggregate_once(
    transport: &dyn SinkTransport,
    window_hours: u32,
) -> Result<(), SinkError> {
    let mut buckets: HashMap<(String, String, u64), Bucket> = HashMap::new();

    let mut fold = |cluster: String,
                    infobase: String,
                    source: &'static str,
                    name: String,
                    text: &str,
                    sample: String,
                    seen: DateTime<Utc>,
                    sql_aware: bool| {
        let normalized = if sql_aware {
            normalize_sql_text(text)
        } else {
            normalize_error_text(text)
        };
        let signature = error_signature(&name, "", &normalized);
        let bucket = buckets
            .entry((cluster.clone(), infobase.clone(), signature))
            .or_insert_with(|| Bucket {
                cluster_guid: cluster,
                infobase_guid: infobase,
                source,
                name,
                normalized,
                samples: Vec::new(),
                occurrences: 0,
                first_seen: seen,
                last_seen: seen,
            });
        bucket.occurrences += 1;
        bucket.first_seen = bucket.first_seen.min(seen);
        bucket.last_seen = bucket.last_seen.max(seen);
        if bucket.samples.len() < MAX_SAMPLES && !bucket.samples.contains(&sample) {
            bucket.samples.push(sample);
        }
    };

    let event_sql = format!(
        "SELECT cluster_guid, infobase_guid, event_presentation AS name, \
         comment AS text, toString(event_time) AS seen \
         FROM {} WHERE level = 'Ошибка' AND comment != '' \
         AND event_time > now64(6) - INTERVAL {window_hours} HOUR",
        transport.table("event_log"),
    );
    for row in transport.query_json(&event_sql).await? {
        let text = row["text"].as_str().unwrap_or("").to_owned();
        fold(
            row["cluster_guid"].as_str().unwrap_or("").to_owned(),
            row["infobase_guid"].as_str().unwrap_or("").to_owned(),
            "event_log",
            row["name"].as_str().unwrap_or("").to_owned(),
            &text,
            text.clone(),
            parse_seen(row["seen"].as_str()),
            false,
        );
    }

    let tech_sql = format!(
        "SELECT cluster_guid, infobase_guid, name, \
         coalesce(descr, '') AS text, raw_line, toString(ts) AS seen \
         FROM {} WHERE name IN ('EXCP', 'EXCPCNTX') \
         AND ts > now64(6) - INTERVAL {window_hours} HOUR",
        transport.table("tech_log"),
    );
    for row in transport.query_json(&tech_sql).await? {
        let text = row["text"].as_str().unwrap_or("").to_owned();
        fold(
            row["cluster_guid"].as_str().unwrap_or("").to_owned(),
            row["infobase_guid"].as_str().unwrap_or("").to_owned(),
            "tech_log",
            row["name"].as_str().unwrap_or("").to_owned(),
            &text,
            row["raw_line"].as_str().unwrap_or(&text).to_owned(),
            parse_seen(row["seen"].as_str()),
            true,
        );
    }
    drop(fold);

    // Truncate-and-repopulate. A failed truncate is only warned about:
    // the insert below replaces rows with matching keys anyway.
    let truncate = format!("TRUNCATE TABLE {}", transport.table("mv_new_errors"));
    if let Err(error) = transport.execute(&truncate).await {
        warn!(message = "Truncating the error summary failed; merging instead.", %error);
    }

    let now = Utc::now();
    let rows: Vec<serde_json::Value> = buckets
        .into_values()
        .map(|bucket| {
            serde_json::json!({
                "cluster_guid": bucket.cluster_guid,
                "infobase_guid": bucket.infobase_guid,
                "source": bucket.source,
                "name": bucket.name,
                "error_signature": bucket.error_signature(),
                "normalized_text": bucket.normalized,
                "sample_lines": bucket.samples,
                "occurrences": bucket.occurrences,
                "first_seen": format_ch_datetime(&bucket.first_seen),
                "last_seen": format_ch_datetime(&bucket.last_seen),
                "updated_at": format_ch_datetime(&now),
            })
        })
        .collect();
    debug!(message = "Aggregated recent errors.", groups = rows.len());
    transport.insert_rows("mv_new_errors", &rows).await
}

impl Bucket {
    fn error_signature(&self) -> u64 {
        error_signature(&self.name, "", &self.normalized)
    }
}
