use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onec_ingest::config::Config;
use onec_ingest::offsets::{OffsetStore, RedbOffsetStore};
use onec_ingest::service::ParserService;
use onec_ingest::sink::{ClickhouseClient, SinkTransport};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.tracing_enabled {
        builder
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            // Tracing is not up yet; this has to reach the operator anyway.
            eprintln!("fatal: {error}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);
    info!(
        message = "Starting 1C journal ingestion.",
        sink = %format!("{}:{}/{}", config.clickhouse_host, config.clickhouse_port, config.clickhouse_db),
        event_log_roots = config.log_dirs.len(),
        tech_log_roots = config.techlog_dirs.len(),
        read_only = config.read_only,
    );

    let transport: Arc<dyn SinkTransport> = match ClickhouseClient::new(
        &config.clickhouse_host,
        config.clickhouse_port,
        &config.clickhouse_db,
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(message = "Cannot construct the sink client.", error = %err);
            return ExitCode::FAILURE;
        }
    };

    if let Some(parent) = config.offset_store_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!(message = "Cannot create the offset store directory.", error = %err);
            return ExitCode::FAILURE;
        }
    }
    let store: Arc<dyn OffsetStore> = match RedbOffsetStore::open(&config.offset_store_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(message = "Cannot open the offset store.", error = %err);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let service = ParserService::new(config, transport, store);
    let mut service_task = tokio::spawn(service.run(cancel.clone()));

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(message = "Interrupt received; shutting down.");
            cancel.cancel();
            None
        }
        // An early return is a startup failure; no signal needed.
        result = &mut service_task => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => service_task.await,
    };

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!(message = "Service failed.", error = %err);
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(message = "Service task panicked.", error = %err);
            ExitCode::FAILURE
        }
    }
}
