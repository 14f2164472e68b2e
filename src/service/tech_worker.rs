//! Per-root tech-log worker.
//!
//! Enumerates the hourly files under its root in order. Files older than
//! the newest are closed by the platform and get drained once; the newest
//! `.log` is tailed live with rotation probes. A `.log` replaced by its
//! `.zip` counterpart switches to the archive reader, resuming by line
//! number.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use file_tail::{archive, FileTailer, ReadFrom, Rotation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{enumerate_tech_files, TechLogLocation};
use crate::model::{FileProgress, SourceKind, TechLogRecord};
use crate::offsets::OffsetStore;
use crate::sink::{CommittedOffsets, Envelope, FileOrigin, WriterHandle};
use crate::techlog::{hour_from_filename, parse_record, LineAssembler};

use super::sleep_with_cancel;

const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

struct WorkerCtx {
    location: TechLogLocation,
    store: Arc<dyn OffsetStore>,
    committed: Arc<CommittedOffsets>,
    handle: WriterHandle<TechLogRecord>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl WorkerCtx {
    fn stopping(&self) -> bool {
        self.cancel.is_cancelled() || self.committed.store_failed()
    }
}

pub(crate) fn run_tech_worker(
    location: TechLogLocation,
    store: Arc<dyn OffsetStore>,
    committed: Arc<CommittedOffsets>,
    handle: WriterHandle<TechLogRecord>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    info!(message = "Tech-log worker started.", root = ?location.root);
    let ctx = WorkerCtx {
        location,
        store,
        committed,
        handle,
        cancel,
        poll_interval,
    };

    loop {
        if ctx.stopping() {
            break;
        }
        let files = enumerate_tech_files(&ctx.location.root);
        let newest_log: Option<PathBuf> = files
            .iter()
            .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
            .last()
            .cloned();

        let mut worked = false;
        for path in &files {
            if ctx.stopping() {
                break;
            }
            let is_zip = path.extension().map(|e| e == "zip").unwrap_or(false);
            let is_live = Some(path) == newest_log.as_ref();
            if is_zip {
                worked |= drain_archive(&ctx, path);
            } else {
                worked |= follow_log(&ctx, path, is_live);
            }
        }

        if !worked && !sleep_with_cancel(&ctx.cancel, ctx.poll_interval) {
            break;
        }
    }

    ctx.handle.flush_blocking();
    info!(message = "Tech-log worker stopped.", root = ?ctx.location.root);
}

fn file_hour(path: &Path) -> Option<NaiveDateTime> {
    path.file_name()
        .and_then(|name| hour_from_filename(&name.to_string_lossy()))
}

fn process_name(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn get_progress(ctx: &WorkerCtx, key: &str) -> Result<Option<FileProgress>, ()> {
    match ctx.store.get(SourceKind::TechLog, key) {
        Ok(progress) => Ok(progress),
        Err(error) => {
            error!(message = "Offset store read failed; halting worker.", %error);
            ctx.committed.mark_store_failed();
            Err(())
        }
    }
}

fn parse_and_send(
    ctx: &WorkerCtx,
    origin: &Arc<FileOrigin>,
    hour: NaiveDateTime,
    process: &str,
    text: &str,
    offset_after: u64,
    line: Option<u64>,
) -> bool {
    let started = Instant::now();
    let parsed = parse_record(hour, text, &ctx.location.identity, process);
    origin
        .parse_us
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    match parsed {
        Ok(record) => ctx.handle.send_blocking(Envelope {
            record,
            origin: Arc::clone(origin),
            offset_after,
            line,
        }),
        Err(error) => {
            origin.errors.fetch_add(1, Ordering::Relaxed);
            let preview: String = text.chars().take(100).collect();
            warn!(message = "Skipping unparseable tech-log record.", %error, record = %preview);
            true
        }
    }
}

/// Drain a compressed archive once, resuming by line number. Returns true
/// if any work was done.
fn drain_archive(ctx: &WorkerCtx, path: &Path) -> bool {
    let key = path.to_string_lossy().into_owned();
    let Some(hour) = file_hour(path) else {
        return false;
    };
    // While the uncompressed file still exists the platform has not
    // finished the swap; keep tailing it instead.
    let live_path = key.trim_end_matches(".zip").to_owned();
    if Path::new(&live_path).exists() {
        return false;
    }
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let own = match get_progress(ctx, &key) {
        Ok(progress) => progress,
        Err(()) => return false,
    };
    // Done marker: the stored offset equals the archive's byte size. (A
    // mid-drain commit stores a line number there instead, which can
    // collide with the byte size only for a pathological archive; a
    // re-drain then skips already-ingested lines anyway.)
    if let Some(own) = &own {
        if own.offset == size && size > 0 {
            return false;
        }
    }
    // Lines ingested while the file was still live count too: the live
    // entry sits under the `.log` path.
    let live_key = live_path;
    let live_lines = match get_progress(ctx, &live_key) {
        Ok(progress) => progress.and_then(|p| p.line).unwrap_or(0),
        Err(()) => return false,
    };
    let skip = own.and_then(|p| p.line).unwrap_or(0).max(live_lines);

    let process = process_name(path);
    let origin = Arc::new(FileOrigin::new(
        SourceKind::TechLog,
        key.clone(),
        ctx.location.identity.clone(),
    ));
    origin.file_size.store(size, Ordering::Relaxed);
    debug!(message = "Draining tech-log archive.", path = ?path, skip_lines = skip);

    let mut assembler = LineAssembler::new();
    let read_started = Instant::now();
    let total = archive::for_each_line(path, skip, |index, bytes| {
        let line = String::from_utf8_lossy(bytes);
        if let Some(completed) = assembler.push(&line) {
            parse_and_send(ctx, &origin, hour, &process, &completed, index, Some(index));
        }
    });
    origin
        .read_us
        .fetch_add(read_started.elapsed().as_micros() as u64, Ordering::Relaxed);

    let total = match total {
        Ok(total) => total,
        Err(error) => {
            warn!(message = "Archive drain failed; will retry.", path = ?path, %error);
            return true;
        }
    };
    if let Some(last) = assembler.finish() {
        parse_and_send(ctx, &origin, hour, &process, &last, total, Some(total));
    }
    ctx.handle.flush_blocking();

    let done = FileProgress {
        offset: size,
        records: origin.records_written.load(Ordering::Relaxed),
        last_record_ts: None,
        file_size: size,
        ident: None,
        line: Some(total),
        updated_at: Utc::now(),
    };
    if ctx.store.set(SourceKind::TechLog, &key, &done).is_err() {
        ctx.committed.mark_store_failed();
    }
    // The live-file entry is superseded by the archive.
    let _ = ctx.store.delete(SourceKind::TechLog, &live_key);
    true
}

/// Follow a plain `.log` file. Closed files (a newer one exists) drain to
/// EOF once; the live file stays in the tail loop until rotation, a newer
/// file, or shutdown. Returns true if any records were emitted.
fn follow_log(ctx: &WorkerCtx, path: &Path, live: bool) -> bool {
    let key = path.to_string_lossy().into_owned();
    let Some(hour) = file_hour(path) else {
        return false;
    };
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let progress = match get_progress(ctx, &key) {
        Ok(progress) => progress,
        Err(()) => return false,
    };
    let (start_offset, mut line_count) = match &progress {
        Some(p) => {
            // A stale identity means the path was rotated while we were
            // away; the stored offset belongs to a dead file. Checked
            // before the done test so a replaced closed file re-drains.
            let current_ident = current_ident(path);
            if p.ident.is_some() && current_ident.is_some() && p.ident != current_ident {
                (0, 0)
            } else if !live && p.offset >= size {
                return false;
            } else {
                (p.offset, p.line.unwrap_or(0))
            }
        }
        None => (0, 0),
    };
    let process = process_name(path);
    let origin = Arc::new(FileOrigin::new(
        SourceKind::TechLog,
        key.clone(),
        ctx.location.identity.clone(),
    ));
    origin.set_ident(current_ident(path));

    let mut tailer = match FileTailer::open(
        path.to_owned(),
        ReadFrom::Checkpoint(start_offset),
        MAX_LINE_BYTES,
    ) {
        Ok(tailer) => tailer,
        Err(error) => {
            warn!(message = "Cannot open tech-log file.", path = ?path, %error);
            return false;
        }
    };

    let mut assembler = LineAssembler::new();
    let mut emitted = false;
    loop {
        refresh_size(&origin, path);
        let read_started = Instant::now();
        loop {
            match tailer.read_line() {
                Ok(Some(tail_line)) => {
                    line_count += 1;
                    let text = String::from_utf8_lossy(&tail_line.bytes).into_owned();
                    if let Some(completed) = assembler.push(&text) {
                        // The completed record ends where the line that
                        // completed it begins.
                        emitted = true;
                        if !parse_and_send(
                            ctx,
                            &origin,
                            hour,
                            &process,
                            &completed,
                            tail_line.offset,
                            Some(line_count.saturating_sub(1)),
                        ) {
                            return emitted;
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(message = "Tech-log read failed.", path = ?path, %error);
                    break;
                }
            }
        }
        origin
            .read_us
            .fetch_add(read_started.elapsed().as_micros() as u64, Ordering::Relaxed);

        if ctx.stopping() {
            finish_pending(ctx, &origin, hour, &process, &mut assembler, &tailer, line_count);
            return emitted;
        }

        // A newer file closes this one.
        let superseded = enumerate_tech_files(&ctx.location.root)
            .iter()
            .filter_map(|p| file_hour(p))
            .any(|h| h > hour);
        if superseded || !live {
            finish_pending(ctx, &origin, hour, &process, &mut assembler, &tailer, line_count);
            ctx.handle.flush_blocking();
            let done = FileProgress {
                offset: tailer.position(),
                records: origin.records_written.load(Ordering::Relaxed),
                last_record_ts: None,
                file_size: tailer.position(),
                ident: origin.ident(),
                line: Some(line_count),
                updated_at: Utc::now(),
            };
            if ctx.store.set(SourceKind::TechLog, &key, &done).is_err() {
                ctx.committed.mark_store_failed();
            }
            return true;
        }

        match tailer.check_rotation() {
            // The file grew since the last read pass; go straight back in.
            Ok(Rotation::Grew) => continue,
            Ok(Rotation::None) => {
                if !sleep_with_cancel(&ctx.cancel, ctx.poll_interval) {
                    finish_pending(
                        ctx, &origin, hour, &process, &mut assembler, &tailer, line_count,
                    );
                    return emitted;
                }
            }
            Ok(Rotation::Replaced) | Ok(Rotation::Shrunk) => {
                // Emit what the old generation completed, then record the
                // switch in the offset store before reading the new file,
                // so a crash between the two replays nothing.
                finish_pending(ctx, &origin, hour, &process, &mut assembler, &tailer, line_count);
                ctx.handle.flush_blocking();
                assembler.reset();
                line_count = 0;
                if tailer.rotate().is_err() {
                    return emitted;
                }
                origin.set_ident(Some((tailer.ident().dev, tailer.ident().ino)));
                let switched = FileProgress {
                    offset: 0,
                    records: origin.records_written.load(Ordering::Relaxed),
                    last_record_ts: None,
                    file_size: 0,
                    ident: origin.ident(),
                    line: Some(0),
                    updated_at: Utc::now(),
                };
                if ctx.store.set(SourceKind::TechLog, &key, &switched).is_err() {
                    ctx.committed.mark_store_failed();
                    return emitted;
                }
                emitted = true;
            }
            Ok(Rotation::Vanished) => {
                finish_pending(ctx, &origin, hour, &process, &mut assembler, &tailer, line_count);
                ctx.handle.flush_blocking();
                // Replaced by its compressed counterpart? The outer loop
                // drains it, resuming from our line count.
                let archived = PathBuf::from(format!("{key}.zip"));
                if archived.exists() {
                    debug!(message = "Live file replaced by archive.", path = ?path);
                } else {
                    debug!(message = "Tech-log file vanished.", path = ?path);
                }
                let parting = FileProgress {
                    offset: tailer.position(),
                    records: origin.records_written.load(Ordering::Relaxed),
                    last_record_ts: None,
                    file_size: tailer.position(),
                    ident: origin.ident(),
                    line: Some(line_count),
                    updated_at: Utc::now(),
                };
                if ctx.store.set(SourceKind::TechLog, &key, &parting).is_err() {
                    ctx.committed.mark_store_failed();
                }
                return true;
            }
            Err(error) => {
                warn!(message = "Rotation probe failed.", path = ?path, %error);
                if !sleep_with_cancel(&ctx.cancel, ctx.poll_interval) {
                    return emitted;
                }
            }
        }
    }
}

/// Emit the record still sitting in the assembler; at a file boundary it
/// is structurally complete even though nothing follows it.
fn finish_pending(
    ctx: &WorkerCtx,
    origin: &Arc<FileOrigin>,
    hour: NaiveDateTime,
    process: &str,
    assembler: &mut LineAssembler,
    tailer: &FileTailer,
    line_count: u64,
) {
    if let Some(last) = assembler.finish() {
        parse_and_send(
            ctx,
            origin,
            hour,
            process,
            &last,
            tailer.position(),
            Some(line_count),
        );
    }
}

fn current_ident(path: &Path) -> Option<(u64, u64)> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

fn refresh_size(origin: &Arc<FileOrigin>, path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        origin.file_size.store(metadata.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::model::SourceIdentity;
    use crate::offsets::MemoryOffsetStore;
    use crate::sink::testing::MockSink;
    use crate::sink::{BatchWriter, SinkTransport, WriterConfig};

    /// A worker context wired to a real writer running on a background
    /// runtime thread, so the blocking send/flush paths are exercised.
    struct Harness {
        ctx: WorkerCtx,
        sink: Arc<MockSink>,
        store: Arc<MemoryOffsetStore>,
        writer_thread: std::thread::JoinHandle<()>,
    }

    impl Harness {
        fn new(root: &Path) -> Self {
            let sink = Arc::new(MockSink::new());
            let store = Arc::new(MemoryOffsetStore::new());
            let committed = Arc::new(CommittedOffsets::default());
            let (handle, writer) = BatchWriter::<TechLogRecord>::new(
                WriterConfig::default(),
                Arc::clone(&sink) as Arc<dyn SinkTransport>,
                Arc::clone(&store) as Arc<dyn crate::offsets::OffsetStore>,
                Arc::clone(&committed),
                CancellationToken::new(),
            );
            let writer_thread = std::thread::spawn(move || {
                tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap()
                    .block_on(writer.run());
            });
            let ctx = WorkerCtx {
                location: TechLogLocation {
                    root: root.to_owned(),
                    identity: SourceIdentity {
                        cluster_guid: "cg".into(),
                        infobase_guid: "ig".into(),
                        ..Default::default()
                    },
                },
                store: Arc::clone(&store) as Arc<dyn crate::offsets::OffsetStore>,
                committed,
                handle,
                cancel: CancellationToken::new(),
                poll_interval: Duration::from_millis(10),
            };
            Self {
                ctx,
                sink,
                store,
                writer_thread,
            }
        }

        fn finish(self) -> (Arc<MockSink>, Arc<MemoryOffsetStore>) {
            let Harness {
                ctx,
                sink,
                store,
                writer_thread,
            } = self;
            ctx.handle.flush_blocking();
            // Dropping the context releases the last sender and lets the
            // writer thread drain out.
            drop(ctx);
            writer_thread.join().unwrap();
            (sink, store)
        }
    }

    fn write_file(path: &Path, contents: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn closed_file_drains_once_and_is_marked_done() {
        let dir = tempdir().unwrap();
        let proc_dir = dir.path().join("rphost_2012");
        std::fs::create_dir_all(&proc_dir).unwrap();
        let closed = proc_dir.join("2025111309.log");
        write_file(
            &closed,
            "05:00.000001-10,CALL,1,CallID=1\n05:01.000001-10,CALL,1,CallID=2\n",
        );
        // A newer file exists, so the older one is closed.
        write_file(&proc_dir.join("2025111310.log"), "");

        let harness = Harness::new(dir.path());
        assert!(follow_log(&harness.ctx, &closed, false));
        // A second pass over the same file is a no-op.
        assert!(!follow_log(&harness.ctx, &closed, false));

        let (sink, store) = harness.finish();
        let rows = sink.rows_for("tech_log");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "CALL");
        assert_eq!(rows[0]["process"], "rphost_2012");
        assert_eq!(rows[0]["cluster_guid"], "cg");

        let progress = store
            .get(SourceKind::TechLog, &closed.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(progress.line, Some(2));
        assert!(progress.offset > 0);
    }

    #[test]
    fn archive_drain_skips_lines_already_ingested_live() {
        let dir = tempdir().unwrap();
        let proc_dir = dir.path().join("rphost_2012");
        std::fs::create_dir_all(&proc_dir).unwrap();
        let zip_path = proc_dir.join("2025111309.log.zip");
        let contents = "05:00.000001-10,CALL,1,CallID=1\n\
                        05:01.000001-10,CALL,1,CallID=2\n\
                        05:02.000001-10,CALL,1,CallID=3\n";
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("2025111309.log", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
        writer.finish().unwrap();

        let harness = Harness::new(dir.path());
        // Two lines were delivered while the plain file was still live.
        let live_key = proc_dir.join("2025111309.log");
        harness
            .ctx
            .store
            .set(
                SourceKind::TechLog,
                &live_key.to_string_lossy(),
                &FileProgress {
                    offset: 60,
                    line: Some(2),
                    updated_at: Utc::now(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(drain_archive(&harness.ctx, &zip_path));
        // Done marker prevents a second decompression pass.
        assert!(!drain_archive(&harness.ctx, &zip_path));

        let (sink, store) = harness.finish();
        let rows = sink.rows_for("tech_log");
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["raw_line"]
            .as_str()
            .unwrap()
            .contains("CallID=3"));
        // The live entry is superseded by the archive's.
        assert!(store
            .get(SourceKind::TechLog, &live_key.to_string_lossy())
            .unwrap()
            .is_none());
    }

    #[test]
    fn replaced_live_file_restarts_from_zero() {
        let dir = tempdir().unwrap();
        let proc_dir = dir.path().join("rphost_2012");
        std::fs::create_dir_all(&proc_dir).unwrap();
        let live = proc_dir.join("2025111310.log");
        write_file(&live, "05:00.000001-10,CALL,1,CallID=1\n");

        let harness = Harness::new(dir.path());
        // Pretend the stored offset belongs to a previous incarnation of
        // the path.
        harness
            .ctx
            .store
            .set(
                SourceKind::TechLog,
                &live.to_string_lossy(),
                &FileProgress {
                    offset: 999,
                    line: Some(9),
                    ident: Some((1, 1)),
                    updated_at: Utc::now(),
                    ..Default::default()
                },
            )
            .unwrap();

        // Treated as closed so the call returns; the stale identity must
        // force a restart from offset zero rather than seeking to 999.
        write_file(&proc_dir.join("2025111311.log"), "");
        assert!(follow_log(&harness.ctx, &live, false));

        let (sink, _store) = harness.finish();
        let rows = sink.rows_for("tech_log");
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["raw_line"].as_str().unwrap().contains("CallID=1"));
    }
}
