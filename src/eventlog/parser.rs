//! Streaming parser for event-log segments (`*.lgp`).
//!
//! A segment begins with the `1CV8LOG` marker and the infobase UUID,
//! optionally behind a byte-order mark, followed by comma-separated
//! top-level brace records. Records are decoded positionally, with the
//! small-integer identifier fields resolved through the reference
//! dictionary.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use snafu::Snafu;
use tracing::{debug, warn};

use crate::model::{
    no_transaction_sentinel, EventLogRecord, Severity, SourceIdentity, TransactionStatus,
};

use super::bracket::{preview, split_fields, Field, RecordScanner, Scan, ScanError};
use super::dictionary::{LazyDictionary, ObjectKind};
use super::presentation::{application_presentation, event_presentation};

/// Segment reads go through a large buffer: records are small but plentiful,
/// and the scanner touches every byte.
const READER_CAPACITY: usize = 4 * 1024 * 1024;

const HEADER_MAGIC: &str = "1CV8LOG";
const BOM: &[u8] = b"\xef\xbb\xbf";

/// How often the in-flight progress callback fires, in records.
pub const PROGRESS_INTERVAL: u64 = 100_000;

/// Offset between the platform's year-0001 epoch (in its 1/10000 s units,
/// already divided down to seconds) and the Unix epoch, as the source
/// system computes it. The value is idiosyncratic but data already written
/// by the platform depends on it; do not "correct" it.
const TRANSACTION_EPOCH_OFFSET: i64 = 62_451_156_554;

#[derive(Debug, Snafu)]
pub enum SegmentError {
    #[snafu(display("segment {path:?} does not begin with the {HEADER_MAGIC} header"))]
    HeaderMismatch { path: PathBuf },
    #[snafu(display("i/o error on segment {path:?}: {source}"))]
    SegmentIo { path: PathBuf, source: io::Error },
}

#[derive(Debug, Snafu)]
enum DecodeError {
    #[snafu(display("record has only {count} fields"))]
    TooFewFields { count: usize },
    #[snafu(display("unparseable record structure"))]
    Structure,
    #[snafu(display("bad timestamp field {value:?}"))]
    BadTimestamp { value: String },
}

/// In-flight progress of a segment stream, handed to the offset callback.
#[derive(Clone, Copy, Debug)]
pub struct ProgressUpdate {
    pub offset: u64,
    pub records: u64,
    pub last_record_ts: Option<DateTime<Utc>>,
}

/// The progress callback is best-effort: a failure is logged, never
/// propagated into the parse.
pub type ProgressFn =
    Box<dyn FnMut(ProgressUpdate) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// What one pull from the stream produced.
#[derive(Debug)]
pub enum StreamStep {
    Record(EventLogRecord),
    /// No complete record is available right now. The stream keeps its
    /// partial state; pull again after the file grows.
    Eof,
}

/// Accumulated counters for one segment stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentStats {
    pub records: u64,
    pub errors: u64,
    pub read_time: Duration,
    pub parse_time: Duration,
}

/// Push-mode segment reader: pull records one at a time, with the header
/// skipped only when starting from offset zero.
pub struct SegmentStream<'a> {
    path: PathBuf,
    scanner: RecordScanner<BufReader<File>>,
    dictionary: &'a LazyDictionary,
    identity: SourceIdentity,
    infobase_uuid: String,
    stats: SegmentStats,
    last_record_ts: Option<DateTime<Utc>>,
    since_progress: u64,
    progress: Option<ProgressFn>,
}

impl<'a> SegmentStream<'a> {
    pub fn open(
        path: &Path,
        start_offset: u64,
        dictionary: &'a LazyDictionary,
        identity: SourceIdentity,
    ) -> Result<Self, SegmentError> {
        let file = File::open(path).map_err(|source| SegmentError::SegmentIo {
            path: path.to_owned(),
            source,
        })?;
        let mut reader = BufReader::with_capacity(READER_CAPACITY, file);

        let mut offset = start_offset;
        let mut infobase_uuid = String::new();
        if start_offset == 0 {
            let (consumed, uuid) = read_header(&mut reader, path)?;
            offset = consumed;
            infobase_uuid = uuid;
        } else {
            reader
                .seek(SeekFrom::Start(start_offset))
                .map_err(|source| SegmentError::SegmentIo {
                    path: path.to_owned(),
                    source,
                })?;
        }

        Ok(Self {
            path: path.to_owned(),
            scanner: RecordScanner::with_offset(reader, offset),
            dictionary,
            identity,
            infobase_uuid,
            stats: SegmentStats::default(),
            last_record_ts: None,
            since_progress: 0,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// UUID from the segment header; empty when resuming mid-file.
    pub fn infobase_uuid(&self) -> &str {
        &self.infobase_uuid
    }

    pub fn offset(&self) -> u64 {
        self.scanner.offset()
    }

    pub fn stats(&self) -> SegmentStats {
        self.stats
    }

    pub fn last_record_ts(&self) -> Option<DateTime<Utc>> {
        self.last_record_ts
    }

    pub fn next(&mut self) -> Result<StreamStep, SegmentError> {
        loop {
            let read_started = Instant::now();
            let scanned = self.scanner.next_record();
            self.stats.read_time += read_started.elapsed();

            let record = match scanned {
                Ok(Scan::Record(record)) => record,
                Ok(Scan::Eof) => {
                    self.emit_progress();
                    return Ok(StreamStep::Eof);
                }
                Err(ScanError::MalformedRun { offset, what }) => {
                    self.stats.errors += 1;
                    warn!(
                        message = "Skipping malformed segment region.",
                        path = ?self.path,
                        %offset,
                        what,
                    );
                    continue;
                }
                Err(ScanError::Io { source, .. }) => {
                    return Err(SegmentError::SegmentIo {
                        path: self.path.clone(),
                        source,
                    });
                }
            };

            let parse_started = Instant::now();
            let decoded = decode_record(&record.text, self.dictionary, &self.identity);
            self.stats.parse_time += parse_started.elapsed();

            match decoded {
                Ok(event) => {
                    self.stats.records += 1;
                    self.since_progress += 1;
                    self.last_record_ts = Some(event.event_time);
                    if self.since_progress >= PROGRESS_INTERVAL {
                        self.emit_progress();
                    }
                    return Ok(StreamStep::Record(event));
                }
                Err(error) => {
                    self.stats.errors += 1;
                    warn!(
                        message = "Skipping unparseable record.",
                        path = ?self.path,
                        %error,
                        record = %preview(&record.text),
                    );
                    continue;
                }
            }
        }
    }

    /// Report and drop an unterminated record buffered at EOF. Called when
    /// the segment is known to be complete (a newer segment exists).
    pub fn finish(mut self) -> SegmentStats {
        self.emit_progress();
        if self.scanner.has_partial() {
            warn!(
                message = "Dropping incomplete record at end of segment.",
                path = ?self.path,
                record = %self.scanner.partial_preview(),
            );
            self.stats.errors += 1;
        }
        self.stats
    }

    fn emit_progress(&mut self) {
        if self.since_progress == 0 {
            return;
        }
        self.since_progress = 0;
        let update = ProgressUpdate {
            offset: self.scanner.offset(),
            records: self.stats.records,
            last_record_ts: self.last_record_ts,
        };
        if let Some(progress) = self.progress.as_mut() {
            if let Err(error) = progress(update) {
                warn!(
                    message = "Offset progress callback failed; continuing.",
                    path = ?self.path,
                    %error,
                );
            }
        }
    }
}

fn read_header(
    reader: &mut BufReader<File>,
    path: &Path,
) -> Result<(u64, String), SegmentError> {
    let io_err = |source| SegmentError::SegmentIo {
        path: path.to_owned(),
        source,
    };

    let mut line = Vec::new();
    let mut consumed = reader.read_until(b'\n', &mut line).map_err(io_err)? as u64;
    let magic = line.strip_prefix(BOM).unwrap_or(&line);
    let magic = String::from_utf8_lossy(magic);
    if !magic.trim_end().starts_with(HEADER_MAGIC) {
        return Err(SegmentError::HeaderMismatch {
            path: path.to_owned(),
        });
    }

    line.clear();
    consumed += reader.read_until(b'\n', &mut line).map_err(io_err)? as u64;
    let uuid = String::from_utf8_lossy(&line).trim().to_owned();
    debug!(message = "Read segment header.", path = ?path, infobase_uuid = %uuid);
    Ok((consumed, uuid))
}

/// Decode one record into its normalized form.
///
/// The positional layout varies between platform versions: older segments
/// carry 9-17 fields, newer ones insert the data-separation tag before the
/// server field, for 18. Positions 0-12 are stable; the tail is mapped by
/// field count.
fn decode_record(
    text: &str,
    dictionary: &LazyDictionary,
    identity: &SourceIdentity,
) -> Result<EventLogRecord, DecodeError> {
    let fields = split_fields(text).map_err(|_| DecodeError::Structure)?;
    if fields.len() < 9 {
        return Err(DecodeError::TooFewFields {
            count: fields.len(),
        });
    }
    let dict = dictionary.get();
    let text_at = |i: usize| fields.get(i).map(Field::text).unwrap_or("");
    let id_at = |i: usize| text_at(i).parse::<i64>().ok();

    let mut record = EventLogRecord::new();
    record.cluster_guid = identity.cluster_guid.clone();
    record.cluster_name = identity.cluster_name.clone();
    record.infobase_guid = identity.infobase_guid.clone();
    record.infobase_name = identity.infobase_name.clone();

    // 0: 14-digit local timestamp, treated as UTC. The platform writes
    // server-local wall clock time here; parsing it as UTC keeps ordering
    // and matches data already ingested. (Configurable treatment is a
    // future change.)
    let ts = text_at(0);
    record.event_time = NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::BadTimestamp {
            value: ts.to_owned(),
        })?;

    // 1: transaction status letter.
    record.transaction_status =
        TransactionStatus::from_code(text_at(1)).unwrap_or(TransactionStatus::None);

    // 2: {date-hex, number-hex}.
    let (tx_date_raw, tx_number) = match fields.get(2).and_then(Field::as_group) {
        Some(group) => {
            let date = u64::from_str_radix(group.first().map(Field::text).unwrap_or("0"), 16)
                .unwrap_or(0);
            let number = i64::from_str_radix(group.get(1).map(Field::text).unwrap_or("0"), 16)
                .unwrap_or(0);
            (date, number)
        }
        None => (0, 0),
    };
    record.transaction_number = tx_number;
    // The number doubles as the numeric connection id.
    record.connect_id = tx_number;
    if tx_date_raw != 0 {
        let unix_seconds = (tx_date_raw / 10_000) as i64 - TRANSACTION_EPOCH_OFFSET;
        if let Some(dt) = DateTime::<Utc>::from_timestamp(unix_seconds, 0) {
            use chrono::Datelike;
            if !(1900..=2100).contains(&dt.year()) {
                warn!(
                    message = "Transaction start time outside the plausible range; keeping it.",
                    year = dt.year(),
                );
            }
            record.transaction_datetime = dt;
        } else {
            warn!(
                message = "Transaction start time does not fit a timestamp; using the sentinel.",
                raw = tx_date_raw,
            );
            record.transaction_datetime = no_transaction_sentinel();
        }
        record.transaction_id = tx_number.to_string();
    }

    // 3: user, carries a UUID in the dictionary.
    if let Some(id) = id_at(3) {
        let (name, uuid) = dict.referenced(ObjectKind::Users, id);
        if name.is_empty() && uuid.is_empty() {
            record
                .properties
                .insert("user_id".into(), text_at(3).to_owned());
        }
        record.user_name = name.to_owned();
        record.user_uuid = uuid.to_owned();
    }

    // 4: computer.
    if let Some(id) = id_at(4) {
        record.computer = dict.value(ObjectKind::Computers, id).to_owned();
    }

    // 5: application code plus its localized presentation.
    if let Some(id) = id_at(5) {
        let code = dict.value(ObjectKind::Applications, id);
        record.application = code.to_owned();
        if !code.is_empty() {
            record.application_presentation = application_presentation(code).to_owned();
        }
    }

    // 6: connection string form.
    record.connect_string = text_at(6).to_owned();

    // 7: event code plus its localized presentation.
    if let Some(id) = id_at(7) {
        let code = dict.value(ObjectKind::Events, id);
        record.event = code.to_owned();
        if !code.is_empty() {
            record.event_presentation = event_presentation(code).to_owned();
        }
    }

    // 8: severity letter.
    record.level = Severity::from_code(text_at(8)).unwrap_or_default();

    // 9: comment.
    record.comment = text_at(9).to_owned();

    // 10: metadata, carries a UUID in the dictionary.
    if let Some(id) = id_at(10) {
        let (name, uuid) = dict.referenced(ObjectKind::Metadata, id);
        record.metadata = name.to_owned();
        record.metadata_presentation = name.to_owned();
        record.metadata_uuid = uuid.to_owned();
    }

    // 11: tagged data value; 12: its human presentation.
    if let Some(field) = fields.get(11) {
        record.data = render_data(field);
    }
    record.data_presentation = text_at(12).to_owned();

    // Tail: [data-separation,] server, main port, add port, session.
    let server_index = if fields.len() >= 18 {
        record.data_separation = text_at(13).to_owned();
        14
    } else {
        13
    };
    if let Some(id) = id_at(server_index) {
        record.server_name = dict.value(ObjectKind::Servers, id).to_owned();
    }
    record.primary_port = text_at(server_index + 1).parse().unwrap_or(0);
    record.secondary_port = text_at(server_index + 2).parse().unwrap_or(0);

    let session_raw = text_at(server_index + 3);
    match session_raw.parse::<u64>() {
        Ok(session) => record.session_id = session,
        Err(_) if !session_raw.is_empty() => {
            record
                .properties
                .insert("session".into(), session_raw.to_owned());
        }
        Err(_) => {}
    }

    Ok(record)
}

/// Render the tagged `data` field. The tag is one of `R` (reference),
/// `U` (undefined), `S` (string), `B` (boolean) or `P` (composite, which
/// recurses over its members).
fn render_data(field: &Field) -> String {
    let Some(group) = field.as_group() else {
        return field.text().to_owned();
    };
    let Some(tag) = group.first() else {
        return String::new();
    };
    match tag.text() {
        "R" | "S" => group.get(1).map(Field::text).unwrap_or("").to_owned(),
        "B" => match group.get(1).map(Field::text) {
            Some("0") | Some("false") | None => "false".to_owned(),
            _ => "true".to_owned(),
        },
        "U" => String::new(),
        "P" => {
            let rendered: Vec<String> = group[1..]
                .iter()
                .flat_map(|member| match member.as_group() {
                    Some(inner) => inner.iter().map(render_data).collect::<Vec<_>>(),
                    None => vec![member.text().to_owned()],
                })
                .filter(|s| !s.is_empty())
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
        _ => String::new(),
    }
}
