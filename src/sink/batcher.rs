//! Record batching and exactly-once-effect writes.
//!
//! Records flow in per-sink channels, coalesce into batches, and are
//! appended with a retry wrapper. Offsets advance only after a batch
//! commits; the committed high-water mark is shared with the parsers so
//! their periodic offset callbacks never run ahead of what the sink
//! actually holds. A terminal write failure drops the batch and the
//! worker continues; replay after restart is collapsed by the sink's
//! ordering key and the optional dedup probe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::fingerprint::Fingerprint;
use crate::model::{
    EventLogRecord, FileProgress, ParserMetrics, ReadingProgress, SourceIdentity, SourceKind,
    TechLogRecord,
};
use crate::offsets::OffsetStore;

use super::retries::retry_with_backoff;
use super::transport::SinkTransport;

/// A record the writer can batch: its destination table, time column for
/// the dedup window, timestamp, fingerprint, and row form.
pub trait BatchRecord: Send + 'static {
    const TABLE: &'static str;
    const TIME_COLUMN: &'static str;

    fn kind() -> SourceKind;
    fn timestamp(&self) -> DateTime<Utc>;
    fn fingerprint(&self) -> String;
    fn into_row(self, hash: &str) -> serde_json::Value;
}

fn with_hash(value: serde_json::Value, hash: &str) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut object) => {
            object.insert("record_hash".into(), hash.into());
            serde_json::Value::Object(object)
        }
        other => other,
    }
}

impl BatchRecord for EventLogRecord {
    const TABLE: &'static str = "event_log";
    const TIME_COLUMN: &'static str = "event_time";

    fn kind() -> SourceKind {
        SourceKind::EventLog
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.event_time
    }

    fn fingerprint(&self) -> String {
        self.record_hash()
    }

    fn into_row(self, hash: &str) -> serde_json::Value {
        let value = serde_json::to_value(&self).expect("record serialization is infallible");
        with_hash(value, hash)
    }
}

impl BatchRecord for TechLogRecord {
    const TABLE: &'static str = "tech_log";
    const TIME_COLUMN: &'static str = "ts";

    fn kind() -> SourceKind {
        SourceKind::TechLog
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }

    fn fingerprint(&self) -> String {
        self.record_hash()
    }

    fn into_row(self, hash: &str) -> serde_json::Value {
        let value = serde_json::to_value(&self).expect("record serialization is infallible");
        with_hash(value, hash)
    }
}

/// Mutable per-file accounting shared between the worker (file reads,
/// parsing, errors, size) and the writer (dedup, writes, committed rows).
#[derive(Debug)]
pub struct FileOrigin {
    pub kind: SourceKind,
    pub path: String,
    pub identity: SourceIdentity,
    pub started_at: DateTime<Utc>,
    pub read_us: AtomicU64,
    pub parse_us: AtomicU64,
    pub errors: AtomicU64,
    pub file_size: AtomicU64,
    pub dedup_us: AtomicU64,
    pub write_us: AtomicU64,
    pub records_written: AtomicU64,
    ident: Mutex<Option<(u64, u64)>>,
}

impl FileOrigin {
    pub fn new(kind: SourceKind, path: String, identity: SourceIdentity) -> Self {
        Self {
            kind,
            path,
            identity,
            started_at: Utc::now(),
            read_us: AtomicU64::new(0),
            parse_us: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            file_size: AtomicU64::new(0),
            dedup_us: AtomicU64::new(0),
            write_us: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            ident: Mutex::new(None),
        }
    }

    pub fn set_ident(&self, ident: Option<(u64, u64)>) {
        *self.ident.lock().expect("ident poisoned") = ident;
    }

    pub fn ident(&self) -> Option<(u64, u64)> {
        *self.ident.lock().expect("ident poisoned")
    }
}

/// A record travelling to the writer with its provenance.
pub struct Envelope<R> {
    pub record: R,
    pub origin: Arc<FileOrigin>,
    /// File offset just past this record; persisting it makes the record
    /// part of the durable past.
    pub offset_after: u64,
    /// Line number for sources that resume by line (tech-log archives).
    pub line: Option<u64>,
}

pub enum WriterMsg<R> {
    Record(Envelope<R>),
    Flush(oneshot::Sender<()>),
}

/// High-water marks the sink has actually committed, shared with parsers.
/// Also carries the poisoned flag for a failed offset store, which halts
/// the affected workers.
#[derive(Debug, Default)]
pub struct CommittedOffsets {
    map: DashMap<(SourceKind, String), u64>,
    store_failed: AtomicBool,
}

impl CommittedOffsets {
    pub fn get(&self, kind: SourceKind, path: &str) -> Option<u64> {
        self.map
            .get(&(kind, path.to_owned()))
            .map(|entry| *entry.value())
    }

    fn commit(&self, kind: SourceKind, path: &str, offset: u64) {
        self.map
            .entry((kind, path.to_owned()))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    pub fn mark_store_failed(&self) {
        self.store_failed.store(true, Ordering::SeqCst);
    }

    pub fn store_failed(&self) -> bool {
        self.store_failed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub max_records: usize,
    pub max_age: Duration,
    pub dedup: bool,
    pub read_only: bool,
    pub offset_mirror: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_records: 500,
            max_age: Duration::from_millis(100),
            dedup: false,
            read_only: false,
            offset_mirror: false,
        }
    }
}

/// Cloneable sending side of a writer.
pub struct WriterHandle<R> {
    tx: mpsc::Sender<WriterMsg<R>>,
}

impl<R> Clone for WriterHandle<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: BatchRecord> WriterHandle<R> {
    /// Blocking send for the synchronous parser workers; backpressure from
    /// a slow sink lands here. Returns false when the writer is gone.
    pub fn send_blocking(&self, envelope: Envelope<R>) -> bool {
        self.tx.blocking_send(WriterMsg::Record(envelope)).is_ok()
    }

    pub async fn send(&self, envelope: Envelope<R>) -> bool {
        self.tx.send(WriterMsg::Record(envelope)).await.is_ok()
    }

    /// Synchronously flush whatever the writer is holding.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush from a blocking worker thread; returns once the writer has
    /// committed (or dropped) everything sent before this call.
    pub fn flush_blocking(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.blocking_send(WriterMsg::Flush(tx)).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}

struct PendingRow {
    hash: String,
    timestamp: DateTime<Utc>,
    row: serde_json::Value,
    origin: Arc<FileOrigin>,
    offset_after: u64,
    line: Option<u64>,
}

/// High-water mark of one file within a batch. Computed before the dedup
/// probe: a record dropped as a duplicate still advances the offset, since
/// it already exists in the sink.
struct FileTail {
    path: String,
    origin: Arc<FileOrigin>,
    offset: u64,
    line: Option<u64>,
    last_ts: Option<DateTime<Utc>>,
}

fn collect_tails(pending: &[PendingRow]) -> Vec<FileTail> {
    let mut tails: BTreeMap<String, FileTail> = BTreeMap::new();
    for row in pending {
        let tail = tails
            .entry(row.origin.path.clone())
            .or_insert_with(|| FileTail {
                path: row.origin.path.clone(),
                origin: Arc::clone(&row.origin),
                offset: 0,
                line: None,
                last_ts: None,
            });
        tail.offset = tail.offset.max(row.offset_after);
        tail.line = tail.line.max(row.line);
        tail.last_ts = Some(tail.last_ts.map_or(row.timestamp, |t| t.max(row.timestamp)));
    }
    tails.into_values().collect()
}

/// One writer per sink table. Consumes envelopes, flushes by size or age,
/// probes for duplicates, writes with retries, and advances offsets on
/// commit.
pub struct BatchWriter<R: BatchRecord> {
    rx: mpsc::Receiver<WriterMsg<R>>,
    transport: Arc<dyn SinkTransport>,
    store: Arc<dyn OffsetStore>,
    committed: Arc<CommittedOffsets>,
    config: WriterConfig,
    cancel: CancellationToken,
}

impl<R: BatchRecord> BatchWriter<R> {
    pub fn new(
        config: WriterConfig,
        transport: Arc<dyn SinkTransport>,
        store: Arc<dyn OffsetStore>,
        committed: Arc<CommittedOffsets>,
        cancel: CancellationToken,
    ) -> (WriterHandle<R>, Self) {
        let (tx, rx) = mpsc::channel(config.max_records.max(1) * 4);
        (
            WriterHandle { tx },
            Self {
                rx,
                transport,
                store,
                committed,
                config,
                cancel,
            },
        )
    }

    /// Drive the writer until every sender is gone; the final partial
    /// batch is flushed on the way out. Shutdown is by closing the
    /// channel, not by cancellation, so records already accepted are
    /// never abandoned.
    pub async fn run(mut self) {
        let mut batch: Vec<PendingRow> = Vec::with_capacity(self.config.max_records);
        let mut deadline: Option<Instant> = None;
        loop {
            let wake_at = deadline;
            let age_expired = async move {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(WriterMsg::Record(envelope)) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.config.max_age);
                        }
                        let hash = envelope.record.fingerprint();
                        let timestamp = envelope.record.timestamp();
                        let row = envelope.record.into_row(&hash);
                        batch.push(PendingRow {
                            hash,
                            timestamp,
                            row,
                            origin: envelope.origin,
                            offset_after: envelope.offset_after,
                            line: envelope.line,
                        });
                        if batch.len() >= self.config.max_records {
                            self.flush(&mut batch).await;
                            deadline = None;
                        }
                    }
                    Some(WriterMsg::Flush(done)) => {
                        self.flush(&mut batch).await;
                        deadline = None;
                        let _ = done.send(());
                    }
                    None => {
                        self.flush(&mut batch).await;
                        debug!(message = "Writer channel drained; exiting.", table = R::TABLE);
                        return;
                    }
                },
                _ = age_expired => {
                    self.flush(&mut batch).await;
                    deadline = None;
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<PendingRow>) {
        if batch.is_empty() {
            return;
        }
        let mut pending = std::mem::take(batch);
        let tails = collect_tails(&pending);

        if self.config.dedup {
            let started = Instant::now();
            match self.probe(&pending).await {
                Ok(duplicates) if !duplicates.is_empty() => {
                    let before = pending.len();
                    pending.retain(|row| !duplicates.contains(&row.hash));
                    // Even a fully deduplicated batch advances offsets: the
                    // records exist in the sink already.
                    debug!(
                        message = "Dedup probe dropped duplicate records.",
                        table = R::TABLE,
                        dropped = before - pending.len(),
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        message = "Dedup probe failed; writing without it.",
                        table = R::TABLE,
                        %error,
                    );
                }
            }
            let elapsed = started.elapsed().as_micros() as u64;
            for origin in distinct_origins(&pending) {
                origin.dedup_us.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        let rows: Vec<serde_json::Value> = pending.iter().map(|p| p.row.clone()).collect();
        if self.config.read_only {
            debug!(
                message = "Read-only mode; discarding batch after parse.",
                table = R::TABLE,
                records = rows.len(),
            );
        } else if !rows.is_empty() {
            let started = Instant::now();
            let outcome = retry_with_backoff(&self.cancel, "batch insert", || {
                self.transport.insert_rows(R::TABLE, &rows)
            })
            .await;
            let elapsed = started.elapsed().as_micros() as u64;
            for origin in distinct_origins(&pending) {
                origin.write_us.fetch_add(elapsed, Ordering::Relaxed);
            }
            if let Err(error) = outcome {
                // Terminal failure: the batch is dropped and the offset
                // stays where it was, so a restart replays these records.
                error!(
                    message = "Dropping batch after terminal sink failure.",
                    table = R::TABLE,
                    records = rows.len(),
                    %error,
                );
                for origin in distinct_origins(&pending) {
                    origin.errors.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }

        for row in &pending {
            row.origin.records_written.fetch_add(1, Ordering::Relaxed);
        }
        self.commit_offsets(&tails).await;
        self.report_metrics(&tails).await;
    }

    async fn probe(
        &self,
        pending: &[PendingRow],
    ) -> Result<std::collections::HashSet<String>, super::client::SinkError> {
        let from = pending.iter().map(|p| p.timestamp).min().expect("nonempty");
        let to = pending.iter().map(|p| p.timestamp).max().expect("nonempty");
        let hashes: Vec<String> = pending.iter().map(|p| p.hash.clone()).collect();
        retry_with_backoff(&self.cancel, "dedup probe", || {
            self.transport
                .probe_hashes(R::TABLE, R::TIME_COLUMN, from, to, &hashes)
        })
        .await
    }

    /// Persist the committed high-water mark for every file in the batch.
    async fn commit_offsets(&self, tails: &[FileTail]) {
        for tail in tails {
            let origin = &tail.origin;
            let path = &tail.path;
            self.committed.commit(origin.kind, path, tail.offset);
            // Persist the high-water mark, not the batch tail: offsets
            // only ever move forward.
            let hwm = self
                .committed
                .get(origin.kind, path)
                .unwrap_or(tail.offset);
            let progress = FileProgress {
                offset: hwm,
                records: origin.records_written.load(Ordering::Relaxed),
                last_record_ts: tail.last_ts,
                file_size: origin.file_size.load(Ordering::Relaxed),
                ident: origin.ident(),
                line: tail.line,
                updated_at: Utc::now(),
            };
            if let Err(error) = self.store.set(origin.kind, path, &progress) {
                error!(
                    message = "Offset store write failed; halting affected workers.",
                    path = %path,
                    %error,
                );
                self.committed.mark_store_failed();
                continue;
            }
            if self.config.offset_mirror && !self.config.read_only {
                let row = serde_json::json!({
                    "source_type": origin.kind.as_str(),
                    "file_path": path,
                    "offset": progress.offset,
                    "records": progress.records,
                    "last_record_ts": progress
                        .last_record_ts
                        .map(|t| crate::model::format_ch_datetime(&t)),
                    "file_size": progress.file_size,
                    "updated_at": crate::model::format_ch_datetime(&progress.updated_at),
                });
                if let Err(error) = retry_with_backoff(&self.cancel, "offset mirror", || {
                    self.transport.insert_rows("log_offsets", std::slice::from_ref(&row))
                })
                .await
                {
                    warn!(message = "Offset mirror write failed.", %error);
                }
            }
        }
    }

    /// Replace the per-file metrics and reading-progress rows after a
    /// flush. Best-effort: a failure here never affects the data path.
    async fn report_metrics(&self, tails: &[FileTail]) {
        if self.config.read_only {
            return;
        }
        let now = Utc::now();
        let mut metric_rows = Vec::new();
        let mut progress_rows = Vec::new();
        for tail in tails {
            let origin = &tail.origin;
            let records = origin.records_written.load(Ordering::Relaxed);
            let elapsed = (now - origin.started_at).num_milliseconds().max(1) as f64 / 1000.0;
            let metrics = ParserMetrics {
                parser_type: origin.kind,
                cluster_guid: origin.identity.cluster_guid.clone(),
                infobase_guid: origin.identity.infobase_guid.clone(),
                file_path: origin.path.clone(),
                files_processed: 1,
                records,
                errors: origin.errors.load(Ordering::Relaxed),
                read_us: origin.read_us.load(Ordering::Relaxed),
                parse_us: origin.parse_us.load(Ordering::Relaxed),
                dedup_us: origin.dedup_us.load(Ordering::Relaxed),
                write_us: origin.write_us.load(Ordering::Relaxed),
                records_per_sec: records as f64 / elapsed,
                started_at: origin.started_at,
                finished_at: now,
                updated_at: now,
            };
            metric_rows
                .push(serde_json::to_value(&metrics).expect("metrics serialization is infallible"));

            let offset = self.committed.get(origin.kind, &origin.path).unwrap_or(0);
            let file_size = origin.file_size.load(Ordering::Relaxed);
            let progress = ReadingProgress {
                parser_type: origin.kind,
                cluster_guid: origin.identity.cluster_guid.clone(),
                infobase_guid: origin.identity.infobase_guid.clone(),
                file_path: origin.path.clone(),
                offset,
                file_size,
                percent: if file_size == 0 {
                    0.0
                } else {
                    (offset as f64 / file_size as f64 * 100.0).min(100.0)
                },
                last_record_ts: tail.last_ts.unwrap_or(now),
                updated_at: now,
            };
            progress_rows.push(
                serde_json::to_value(&progress).expect("progress serialization is infallible"),
            );
        }

        for (table, rows) in [
            ("parser_metrics", metric_rows),
            ("file_reading_progress", progress_rows),
        ] {
            if rows.is_empty() {
                continue;
            }
            if let Err(error) = retry_with_backoff(&self.cancel, "metrics write", || {
                self.transport.insert_rows(table, &rows)
            })
            .await
            {
                warn!(message = "Metrics write failed.", table, %error);
            }
        }
    }
}

fn distinct_origins(pending: &[PendingRow]) -> Vec<Arc<FileOrigin>> {
    let mut origins: Vec<Arc<FileOrigin>> = Vec::new();
    for row in pending {
        if !origins.iter().any(|o| Arc::ptr_eq(o, &row.origin)) {
            origins.push(Arc::clone(&row.origin));
        }
    }
    origins
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::super::testing::MockSink;
    use super::*;
    use crate::offsets::MemoryOffsetStore;

    fn sample_record(comment: &str) -> EventLogRecord {
        let mut record = EventLogRecord::new();
        record.event_time = chrono::Utc::now();
        record.cluster_guid = "c".into();
        record.infobase_guid = "i".into();
        record.comment = comment.into();
        record
    }

    fn envelope(
        record: EventLogRecord,
        origin: &Arc<FileOrigin>,
        offset_after: u64,
    ) -> Envelope<EventLogRecord> {
        Envelope {
            record,
            origin: Arc::clone(origin),
            offset_after,
            line: None,
        }
    }

    fn writer(
        config: WriterConfig,
        sink: &Arc<MockSink>,
        store: &Arc<MemoryOffsetStore>,
    ) -> (
        WriterHandle<EventLogRecord>,
        BatchWriter<EventLogRecord>,
        Arc<CommittedOffsets>,
    ) {
        let committed = Arc::new(CommittedOffsets::default());
        let (handle, writer) = BatchWriter::new(
            config,
            Arc::clone(sink) as Arc<dyn SinkTransport>,
            Arc::clone(store) as Arc<dyn OffsetStore>,
            Arc::clone(&committed),
            CancellationToken::new(),
        );
        (handle, writer, committed)
    }

    #[tokio::test]
    async fn size_trigger_flushes_and_commits_offsets() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let config = WriterConfig {
            max_records: 2,
            ..Default::default()
        };
        let (handle, writer, committed) = writer(config, &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("one"), &origin, 100)).await);
        assert!(handle.send(envelope(sample_record("two"), &origin, 200)).await);
        handle.flush().await;

        assert_eq!(sink.rows_for("event_log").len(), 2);
        assert_eq!(committed.get(SourceKind::EventLog, "/logs/a.lgp"), Some(200));
        let progress = store
            .get(SourceKind::EventLog, "/logs/a.lgp")
            .unwrap()
            .unwrap();
        assert_eq!(progress.offset, 200);
        assert_eq!(progress.records, 2);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn age_trigger_flushes_a_partial_batch() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let config = WriterConfig {
            max_records: 100,
            max_age: Duration::from_millis(100),
            ..Default::default()
        };
        let (handle, writer, _committed) = writer(config, &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("aged"), &origin, 10)).await);
        // Nothing reaches the sink until the age deadline passes.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.rows_for("event_log").is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.rows_for("event_log").len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn committed_offsets_never_move_backwards() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let (handle, writer, committed) = writer(WriterConfig::default(), &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("far"), &origin, 500)).await);
        handle.flush().await;
        // A lower offset in a later batch (e.g. out-of-order accounting)
        // must not regress the high-water mark.
        assert!(handle.send(envelope(sample_record("near"), &origin, 200)).await);
        handle.flush().await;

        assert_eq!(committed.get(SourceKind::EventLog, "/logs/a.lgp"), Some(500));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dedup_probe_drops_known_hashes_but_advances_offsets() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let config = WriterConfig {
            max_records: 16,
            dedup: true,
            ..Default::default()
        };
        let (handle, writer, committed) = writer(config, &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let duplicate = sample_record("same");
        sink.preload_hash("event_log", &duplicate.record_hash());

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(duplicate, &origin, 64)).await);
        assert!(handle.send(envelope(sample_record("fresh"), &origin, 128)).await);
        handle.flush().await;

        // Only the fresh record lands, but the offset covers both.
        let rows = sink.rows_for("event_log");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["comment"], "fresh");
        assert_eq!(committed.get(SourceKind::EventLog, "/logs/a.lgp"), Some(128));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn terminal_failure_drops_batch_without_advancing() {
        let sink = Arc::new(MockSink::new());
        sink.fail_table("event_log");
        let store = Arc::new(MemoryOffsetStore::new());
        let (handle, writer, committed) = writer(WriterConfig::default(), &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("lost"), &origin, 64)).await);
        handle.flush().await;

        assert!(sink.rows_for("event_log").is_empty());
        assert_eq!(committed.get(SourceKind::EventLog, "/logs/a.lgp"), None);
        assert!(store.get(SourceKind::EventLog, "/logs/a.lgp").unwrap().is_none());
        assert_eq!(origin.errors.load(Ordering::Relaxed), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn read_only_discards_rows_but_tracks_progress() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let config = WriterConfig {
            read_only: true,
            ..Default::default()
        };
        let (handle, writer, committed) = writer(config, &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("dry"), &origin, 32)).await);
        handle.flush().await;

        assert!(sink.rows_for("event_log").is_empty());
        assert_eq!(committed.get(SourceKind::EventLog, "/logs/a.lgp"), Some(32));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn metrics_rows_replace_per_file() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let (handle, writer, _committed) = writer(WriterConfig::default(), &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity {
                cluster_guid: "cg".into(),
                infobase_guid: "ig".into(),
                ..Default::default()
            },
        ));
        origin.file_size.store(1000, Ordering::Relaxed);

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("m"), &origin, 500)).await);
        handle.flush().await;

        let metrics = sink.rows_for("parser_metrics");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0]["parser_type"], "event_log");
        assert_eq!(metrics[0]["file_path"], "/logs/a.lgp");
        assert_eq!(metrics[0]["records"], 1);

        let progress = sink.rows_for("file_reading_progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["offset"], 500);
        assert_eq!(progress[0]["percent"], 50.0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn offset_mirror_writes_log_offsets_rows() {
        let sink = Arc::new(MockSink::new());
        let store = Arc::new(MemoryOffsetStore::new());
        let config = WriterConfig {
            offset_mirror: true,
            ..Default::default()
        };
        let (handle, writer, _committed) = writer(config, &sink, &store);
        let origin = Arc::new(FileOrigin::new(
            SourceKind::EventLog,
            "/logs/a.lgp".into(),
            SourceIdentity::default(),
        ));

        let task = tokio::spawn(writer.run());
        assert!(handle.send(envelope(sample_record("x"), &origin, 10)).await);
        handle.flush().await;

        let mirrored = sink.rows_for("log_offsets");
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0]["source_type"], "event_log");
        assert_eq!(mirrored[0]["offset"], 10);

        drop(handle);
        task.await.unwrap();
    }
}
