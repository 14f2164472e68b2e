//! Durable per-file read progress.
//!
//! One embedded single-file key/value store holds a bucket per source kind,
//! keyed by file path. Commits are synchronous and crash-consistent: once
//! `set` returns, a restarted process observes the new value. The store is
//! exclusive to one process; a contended open fails fast with
//! [`OffsetError::StoreLocked`] rather than waiting or force-unlocking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redb::{Database, ReadableTable, TableDefinition};
use snafu::Snafu;
use tracing::debug;

use crate::model::{FileProgress, SourceKind};

const EVENT_LOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("event_log");
const TECH_LOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tech_log");

/// How long to keep retrying a contended open before reporting the lock.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);
const ACQUIRE_RETRY_EVERY: Duration = Duration::from_millis(100);

#[derive(Debug, Snafu)]
pub enum OffsetError {
    #[snafu(display("offset store is held by another process: {reason}"))]
    StoreLocked { reason: String },
    #[snafu(display("offset store entry {key:?} is unreadable: {reason}"))]
    StoreCorrupt { key: String, reason: String },
    #[snafu(display("offset store failure: {reason}"))]
    Store { reason: String },
}

impl OffsetError {
    fn store<E: std::fmt::Display>(error: E) -> Self {
        OffsetError::Store {
            reason: error.to_string(),
        }
    }
}

/// Capability interface over the progress store. One production
/// implementation ([`RedbOffsetStore`]); tests substitute
/// [`MemoryOffsetStore`].
pub trait OffsetStore: Send + Sync {
    fn get(&self, kind: SourceKind, path: &str) -> Result<Option<FileProgress>, OffsetError>;
    fn set(&self, kind: SourceKind, path: &str, progress: &FileProgress)
        -> Result<(), OffsetError>;
    fn delete(&self, kind: SourceKind, path: &str) -> Result<(), OffsetError>;
    fn list(&self, kind: SourceKind) -> Result<Vec<(String, FileProgress)>, OffsetError>;
}

fn table_for(kind: SourceKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        SourceKind::EventLog => EVENT_LOG_TABLE,
        SourceKind::TechLog => TECH_LOG_TABLE,
    }
}

/// Production store over an embedded ordered KV file.
pub struct RedbOffsetStore {
    db: Database,
}

impl RedbOffsetStore {
    /// Open (creating if needed) the store file. Retries a contended lock
    /// briefly, then fails with `StoreLocked`; there is no force-unlock.
    pub fn open(path: &Path) -> Result<Self, OffsetError> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            match Database::create(path) {
                Ok(db) => {
                    debug!(message = "Opened offset store.", path = ?path);
                    return Ok(Self { db });
                }
                Err(error) => {
                    let locked = matches!(
                        &error,
                        redb::DatabaseError::DatabaseAlreadyOpen
                    ) || error.to_string().contains("lock");
                    if locked && Instant::now() < deadline {
                        std::thread::sleep(ACQUIRE_RETRY_EVERY);
                        continue;
                    }
                    if locked {
                        return Err(OffsetError::StoreLocked {
                            reason: error.to_string(),
                        });
                    }
                    return Err(OffsetError::store(error));
                }
            }
        }
    }
}

impl OffsetStore for RedbOffsetStore {
    fn get(&self, kind: SourceKind, path: &str) -> Result<Option<FileProgress>, OffsetError> {
        let tx = self.db.begin_read().map_err(OffsetError::store)?;
        let table = match tx.open_table(table_for(kind)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(error) => return Err(OffsetError::store(error)),
        };
        let Some(raw) = table.get(path).map_err(OffsetError::store)? else {
            return Ok(None);
        };
        let progress = serde_json::from_slice(raw.value()).map_err(|error| {
            OffsetError::StoreCorrupt {
                key: format!("{kind}/{path}"),
                reason: error.to_string(),
            }
        })?;
        Ok(Some(progress))
    }

    fn set(
        &self,
        kind: SourceKind,
        path: &str,
        progress: &FileProgress,
    ) -> Result<(), OffsetError> {
        let raw = serde_json::to_vec(progress).map_err(OffsetError::store)?;
        let tx = self.db.begin_write().map_err(OffsetError::store)?;
        {
            let mut table = tx.open_table(table_for(kind)).map_err(OffsetError::store)?;
            table
                .insert(path, raw.as_slice())
                .map_err(OffsetError::store)?;
        }
        // Durable commit: the default durability fsyncs before returning.
        tx.commit().map_err(OffsetError::store)?;
        Ok(())
    }

    fn delete(&self, kind: SourceKind, path: &str) -> Result<(), OffsetError> {
        let tx = self.db.begin_write().map_err(OffsetError::store)?;
        {
            let mut table = tx.open_table(table_for(kind)).map_err(OffsetError::store)?;
            table.remove(path).map_err(OffsetError::store)?;
        }
        tx.commit().map_err(OffsetError::store)?;
        Ok(())
    }

    fn list(&self, kind: SourceKind) -> Result<Vec<(String, FileProgress)>, OffsetError> {
        let tx = self.db.begin_read().map_err(OffsetError::store)?;
        let table = match tx.open_table(table_for(kind)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(error) => return Err(OffsetError::store(error)),
        };
        let mut entries = Vec::new();
        for item in table.iter().map_err(OffsetError::store)? {
            let (key, value) = item.map_err(OffsetError::store)?;
            let progress = serde_json::from_slice(value.value()).map_err(|error| {
                OffsetError::StoreCorrupt {
                    key: format!("{kind}/{}", key.value()),
                    reason: error.to_string(),
                }
            })?;
            entries.push((key.value().to_owned(), progress));
        }
        Ok(entries)
    }
}

/// In-memory store for tests and read-only runs.
#[derive(Default)]
pub struct MemoryOffsetStore {
    entries: Mutex<HashMap<(SourceKind, String), FileProgress>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn get(&self, kind: SourceKind, path: &str) -> Result<Option<FileProgress>, OffsetError> {
        Ok(self
            .entries
            .lock()
            .expect("offset map poisoned")
            .get(&(kind, path.to_owned()))
            .cloned())
    }

    fn set(
        &self,
        kind: SourceKind,
        path: &str,
        progress: &FileProgress,
    ) -> Result<(), OffsetError> {
        self.entries
            .lock()
            .expect("offset map poisoned")
            .insert((kind, path.to_owned()), progress.clone());
        Ok(())
    }

    fn delete(&self, kind: SourceKind, path: &str) -> Result<(), OffsetError> {
        self.entries
            .lock()
            .expect("offset map poisoned")
            .remove(&(kind, path.to_owned()));
        Ok(())
    }

    fn list(&self, kind: SourceKind) -> Result<Vec<(String, FileProgress)>, OffsetError> {
        Ok(self
            .entries
            .lock()
            .expect("offset map poisoned")
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, path), progress)| (path.clone(), progress.clone()))
            .collect())
    }
}
