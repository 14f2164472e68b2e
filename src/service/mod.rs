//! The orchestrator: one worker per discovered location, one writer per
//! sink table, the background error aggregator, and coordinated shutdown.

mod aggregator;
mod event_worker;
mod tech_worker;

pub use self::aggregator::{AGGREGATE_EVERY, WINDOW_HOURS};

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ClusterMap, Config, ConfigError};
use crate::discovery::{discover_event_logs, discover_tech_logs};
use crate::model::{EventLogRecord, TechLogRecord};
use crate::offsets::OffsetStore;
use crate::sink::{
    ensure_schema, BatchWriter, CommittedOffsets, SinkError, SinkTransport, WriterConfig,
};

/// How long workers poll for new bytes at EOF.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period for flushes after cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum ServiceError {
    #[snafu(display("configuration: {source}"))]
    Configuration { source: ConfigError },
    #[snafu(display("sink bootstrap failed: {source}"))]
    Bootstrap { source: SinkError },
}

/// Owns the task topology for one process lifetime.
pub struct ParserService {
    config: Config,
    transport: Arc<dyn SinkTransport>,
    store: Arc<dyn OffsetStore>,
}

impl ParserService {
    pub fn new(
        config: Config,
        transport: Arc<dyn SinkTransport>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
        }
    }

    /// Run until `cancel` fires, then flush and join everything within the
    /// grace period.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServiceError> {
        let cluster_map = ClusterMap::load(&self.config.cluster_map_path)
            .map_err(|source| ServiceError::Configuration { source })?;

        if !self.config.read_only {
            ensure_schema(
                self.transport.as_ref(),
                &self.config.clickhouse_db,
                self.config.retention_days,
                &cancel,
            )
            .await
            .map_err(|source| ServiceError::Bootstrap { source })?;
        }

        let committed = Arc::new(CommittedOffsets::default());
        let writer_config = WriterConfig {
            dedup: true,
            read_only: self.config.read_only,
            offset_mirror: self.config.offset_mirror,
            ..Default::default()
        };

        let (event_handle, event_writer) = BatchWriter::<EventLogRecord>::new(
            writer_config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&committed),
            cancel.clone(),
        );
        let (tech_handle, tech_writer) = BatchWriter::<TechLogRecord>::new(
            writer_config,
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&committed),
            cancel.clone(),
        );
        let mut writers: Vec<JoinHandle<()>> = vec![
            tokio::spawn(event_writer.run()),
            tokio::spawn(tech_writer.run()),
        ];

        let event_locations = discover_event_logs(&self.config.log_dirs, &cluster_map);
        let tech_locations = discover_tech_logs(&self.config.techlog_dirs, &cluster_map);
        info!(
            message = "Discovered log locations.",
            event_log = event_locations.len(),
            tech_log = tech_locations.len(),
        );

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for location in event_locations {
            let store = Arc::clone(&self.store);
            let committed = Arc::clone(&committed);
            let handle = event_handle.clone();
            let cancel = cancel.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                event_worker::run_event_worker(
                    location,
                    store,
                    committed,
                    handle,
                    cancel,
                    POLL_INTERVAL,
                );
            }));
        }
        for location in tech_locations {
            let store = Arc::clone(&self.store);
            let committed = Arc::clone(&committed);
            let handle = tech_handle.clone();
            let cancel = cancel.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                tech_worker::run_tech_worker(
                    location,
                    store,
                    committed,
                    handle,
                    cancel,
                    POLL_INTERVAL,
                );
            }));
        }
        // Writers exit when the last handle drops; the workers hold the
        // only remaining clones.
        drop(event_handle);
        drop(tech_handle);

        let aggregator = tokio::spawn(aggregator::run_error_aggregator(
            Arc::clone(&self.transport),
            cancel.clone(),
            AGGREGATE_EVERY,
            WINDOW_HOURS,
        ));

        cancel.cancelled().await;
        info!(message = "Shutting down; flushing in-flight batches.");

        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
            for writer in writers.drain(..) {
                let _ = writer.await;
            }
            let _ = aggregator.await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                message = "Shutdown grace period elapsed; abandoning remaining tasks.",
                grace_secs = SHUTDOWN_GRACE.as_secs(),
            );
        }
        info!(message = "Parser service stopped.");
        Ok(())
    }
}

/// Sleep in small increments so cancellation interrupts the wait.
/// Returns false when cancelled.
pub(crate) fn sleep_with_cancel(cancel: &CancellationToken, total: Duration) -> bool {
    const STEP: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(STEP);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}
