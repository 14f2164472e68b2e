//! Per-location event-log worker.
//!
//! Runs on a blocking thread: picks the earliest unfinished segment,
//! streams its records into the writer channel (which backpressures file
//! reads through the bounded channel), and at EOF polls for growth or a
//! newer segment. Offsets are persisted by the writer on commit; the
//! parser's periodic callback persists the committed high-water mark.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::EventLogLocation;
use crate::eventlog::{LazyDictionary, SegmentError, SegmentStats, SegmentStream, StreamStep};
use crate::model::{EventLogRecord, FileProgress, SourceKind};
use crate::offsets::OffsetStore;
use crate::sink::{CommittedOffsets, Envelope, FileOrigin, WriterHandle};

use super::sleep_with_cancel;

enum SegmentOutcome {
    /// Move on to the next segment (this one is done or skipped).
    Advance,
    /// Stop the worker (cancelled, writer gone, or the store failed).
    Stop,
}

pub(crate) fn run_event_worker(
    location: EventLogLocation,
    store: Arc<dyn OffsetStore>,
    committed: Arc<CommittedOffsets>,
    handle: WriterHandle<EventLogRecord>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let dictionary = LazyDictionary::new(location.dictionary.clone());
    info!(
        message = "Event-log worker started.",
        directory = ?location.directory,
        cluster = %location.identity.cluster_guid,
        infobase = %location.identity.infobase_guid,
    );

    loop {
        if cancel.is_cancelled() || committed.store_failed() {
            break;
        }
        let segments = location.segments();
        if segments.is_empty() {
            if !sleep_with_cancel(&cancel, poll_interval) {
                break;
            }
            continue;
        }

        // The earliest segment with unread bytes; otherwise tail the
        // newest for growth.
        let mut target: Option<(PathBuf, u64)> = None;
        for path in &segments {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            let offset = match stored_offset(&store, path) {
                Ok(offset) => offset,
                Err(()) => return,
            };
            if offset < size {
                target = Some((path.clone(), offset));
                break;
            }
        }
        let (path, offset) = match target {
            Some(target) => target,
            None => {
                let newest = segments.last().expect("nonempty").clone();
                let offset = match stored_offset(&store, &newest) {
                    Ok(offset) => offset,
                    Err(()) => return,
                };
                (newest, offset)
            }
        };

        match process_segment(
            &location,
            &dictionary,
            &path,
            offset,
            &store,
            &committed,
            &handle,
            &cancel,
            poll_interval,
        ) {
            SegmentOutcome::Advance => continue,
            SegmentOutcome::Stop => break,
        }
    }

    handle.flush_blocking();
    info!(message = "Event-log worker stopped.", directory = ?location.directory);
}

fn stored_offset(store: &Arc<dyn OffsetStore>, path: &Path) -> Result<u64, ()> {
    match store.get(SourceKind::EventLog, &path.to_string_lossy()) {
        Ok(progress) => Ok(progress.map(|p| p.offset).unwrap_or(0)),
        Err(error) => {
            // Offset-store failures are fatal for the worker, never for
            // the process.
            error!(message = "Offset store read failed; halting worker.", %error);
            Err(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn process_segment(
    location: &EventLogLocation,
    dictionary: &LazyDictionary,
    path: &Path,
    start_offset: u64,
    store: &Arc<dyn OffsetStore>,
    committed: &Arc<CommittedOffsets>,
    handle: &WriterHandle<EventLogRecord>,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> SegmentOutcome {
    let path_key = path.to_string_lossy().into_owned();
    let origin = Arc::new(FileOrigin::new(
        SourceKind::EventLog,
        path_key.clone(),
        location.identity.clone(),
    ));
    refresh_file_size(&origin, path);

    let stream = match SegmentStream::open(path, start_offset, dictionary, location.identity.clone())
    {
        Ok(stream) => stream,
        Err(SegmentError::HeaderMismatch { .. }) => {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                // A just-created segment; the header will arrive.
                if !sleep_with_cancel(cancel, poll_interval) {
                    return SegmentOutcome::Stop;
                }
                return SegmentOutcome::Advance;
            }
            // Fatal for the segment only: record it as fully consumed so
            // the scan moves on, and continue with the next one.
            error!(message = "Segment header mismatch; skipping segment.", path = ?path);
            let marker = FileProgress {
                offset: size,
                file_size: size,
                updated_at: Utc::now(),
                ..Default::default()
            };
            if store.set(SourceKind::EventLog, &path_key, &marker).is_err() {
                return SegmentOutcome::Stop;
            }
            return SegmentOutcome::Advance;
        }
        Err(error) => {
            warn!(message = "Cannot open segment; will retry.", path = ?path, %error);
            if !sleep_with_cancel(cancel, poll_interval) {
                return SegmentOutcome::Stop;
            }
            return SegmentOutcome::Advance;
        }
    };

    // The periodic offset callback persists only what the writer has
    // acknowledged as committed, so a crash never records unwritten data.
    let mut stream = stream.with_progress({
        let store = Arc::clone(store);
        let committed = Arc::clone(committed);
        let origin = Arc::clone(&origin);
        let path_key = path_key.clone();
        Box::new(move |update| {
            let Some(hwm) = committed.get(SourceKind::EventLog, &path_key) else {
                return Ok(());
            };
            let progress = FileProgress {
                offset: hwm,
                records: update.records,
                last_record_ts: update.last_record_ts,
                file_size: origin.file_size.load(Ordering::Relaxed),
                ident: origin.ident(),
                line: None,
                updated_at: Utc::now(),
            };
            store.set(SourceKind::EventLog, &path_key, &progress)?;
            Ok(())
        })
    });

    let mut reported = SegmentStats::default();
    loop {
        match stream.next() {
            Ok(StreamStep::Record(record)) => {
                let envelope = Envelope {
                    record,
                    origin: Arc::clone(&origin),
                    offset_after: stream.offset(),
                    line: None,
                };
                if !handle.send_blocking(envelope) {
                    return SegmentOutcome::Stop;
                }
            }
            Ok(StreamStep::Eof) => {
                sync_stats(&origin, &mut reported, stream.stats());
                refresh_file_size(&origin, path);
                if cancel.is_cancelled() || committed.store_failed() {
                    return SegmentOutcome::Stop;
                }
                // A newer segment means this one is closed; its trailing
                // partial record (if any) will never complete.
                let newer_exists = location
                    .segments()
                    .last()
                    .map(|newest| newest.as_path() != path)
                    .unwrap_or(false);
                if newer_exists {
                    debug!(message = "Segment complete; moving to the next.", path = ?path);
                    let final_offset = stream.offset();
                    let records = stream.stats().records;
                    let last_ts = stream.last_record_ts();
                    let stats = stream.finish();
                    sync_stats(&origin, &mut reported, stats);
                    handle.flush_blocking();
                    // Mark the whole file consumed (the committed offset
                    // stops at the last record, short of trailing bytes)
                    // so the segment scan does not reopen it.
                    let done = FileProgress {
                        offset: final_offset,
                        records,
                        last_record_ts: last_ts,
                        file_size: origin.file_size.load(Ordering::Relaxed),
                        ident: origin.ident(),
                        line: None,
                        updated_at: Utc::now(),
                    };
                    if store.set(SourceKind::EventLog, &path_key, &done).is_err() {
                        committed.mark_store_failed();
                        return SegmentOutcome::Stop;
                    }
                    return SegmentOutcome::Advance;
                }
                if !sleep_with_cancel(cancel, poll_interval) {
                    return SegmentOutcome::Stop;
                }
            }
            Err(error) => {
                warn!(message = "Segment read failed; retrying shortly.", path = ?path, %error);
                if !sleep_with_cancel(cancel, poll_interval) {
                    return SegmentOutcome::Stop;
                }
                return SegmentOutcome::Advance;
            }
        }
    }
}

fn refresh_file_size(origin: &Arc<FileOrigin>, path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        origin.file_size.store(metadata.len(), Ordering::Relaxed);
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            origin.set_ident(Some((metadata.dev(), metadata.ino())));
        }
    }
}

fn sync_stats(origin: &Arc<FileOrigin>, reported: &mut SegmentStats, current: SegmentStats) {
    origin.read_us.fetch_add(
        current
            .read_time
            .saturating_sub(reported.read_time)
            .as_micros() as u64,
        Ordering::Relaxed,
    );
    origin.parse_us.fetch_add(
        current
            .parse_time
            .saturating_sub(reported.parse_time)
            .as_micros() as u64,
        Ordering::Relaxed,
    );
    origin.errors.fetch_add(
        current.errors.saturating_sub(reported.errors),
        Ordering::Relaxed,
    );
    *reported = current;
}
