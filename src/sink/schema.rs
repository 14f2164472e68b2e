//! Sink table bootstrap.
//!
//! Issued once at startup (unless running read-only): the database and
//! every table the pipeline appends to, created if absent. Journal tables
//! collapse replayed duplicates through `ReplacingMergeTree` ordered by
//! `record_hash`; metrics and progress tables replace by version column.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::SinkError;
use super::retries::retry_with_backoff;
use super::transport::SinkTransport;

/// The DDL statements for one deployment, TTLs parameterized by retention.
pub fn schema_statements(database: &str, retention_days: u32) -> Vec<String> {
    let mut ddl = vec![format!("CREATE DATABASE IF NOT EXISTS {database}")];

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.event_log (\
         event_time DateTime64(6, 'UTC'),\
         cluster_guid String, cluster_name String,\
         infobase_guid String, infobase_name String,\
         level LowCardinality(String),\
         event LowCardinality(String), event_presentation LowCardinality(String),\
         user_name String, user_uuid String,\
         computer String,\
         application LowCardinality(String), application_presentation LowCardinality(String),\
         session_id UInt64,\
         connect_id Int64, connect_string String,\
         transaction_status LowCardinality(String),\
         transaction_number Int64, transaction_datetime DateTime64(6, 'UTC'),\
         transaction_id String,\
         data_separation String,\
         metadata String, metadata_presentation String, metadata_uuid String,\
         comment String,\
         data String, data_presentation String,\
         server_name String,\
         primary_port UInt16, secondary_port UInt16,\
         properties Map(String, String) DEFAULT map(),\
         record_hash FixedString(40)\
         ) ENGINE = ReplacingMergeTree\
         PARTITION BY toYYYYMMDD(event_time)\
         ORDER BY (cluster_guid, infobase_guid, event_time, session_id, record_hash)\
         TTL toDateTime(event_time) + INTERVAL {retention_days} DAY"
    ));

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.tech_log (\
         ts DateTime64(6, 'UTC'),\
         duration_us UInt64,\
         name LowCardinality(String),\
         depth UInt32,\
         process LowCardinality(String), os_thread String,\
         cluster_guid String, cluster_name String,\
         infobase_guid String, infobase_name String,\
         usr Nullable(String), app_id Nullable(String),\
         application_name Nullable(String), computer_name Nullable(String),\
         interface Nullable(String), method_name Nullable(String),\
         module Nullable(String), context Nullable(String), ib_name Nullable(String),\
         session_id Nullable(UInt64), client_id Nullable(UInt64),\
         t_client_id Nullable(UInt64), t_connect_id Nullable(UInt64),\
         call_id Nullable(UInt64), in_call_id Nullable(UInt64),\
         sql Nullable(String), sdbl Nullable(String), plan_sql_text Nullable(String),\
         prm Nullable(String), func Nullable(String), dbms Nullable(String),\
         database Nullable(String), db_user Nullable(String), db_copy Nullable(String),\
         trans Nullable(String), db_pid Nullable(UInt64),\
         rows Nullable(UInt64), rows_affected Nullable(UInt64),\
         exception Nullable(String), descr Nullable(String),\
         os_exception Nullable(String), reason Nullable(String),\
         context_info Nullable(String),\
         regions Nullable(String), locks Nullable(String),\
         wait_connections Nullable(String),\
         deadlock_connection_intersections Nullable(String),\
         lock_source Nullable(String), escalating Nullable(String),\
         txt Nullable(String), protected Nullable(String), address Nullable(String),\
         protocol Nullable(String), port Nullable(UInt16),\
         connection_limit Nullable(UInt64),\
         process_kind Nullable(String), service_name Nullable(String),\
         agent_url Nullable(String), cluster_url Nullable(String),\
         run_as Nullable(String), pid Nullable(UInt64),\
         memory Nullable(Int64), memory_peak Nullable(Int64),\
         in_bytes Nullable(UInt64), out_bytes Nullable(UInt64),\
         cpu_time Nullable(UInt64), dst_client_id Nullable(UInt64),\
         ft_component Nullable(String), ft_state Nullable(String),\
         ft_rows Nullable(UInt64), min_data_id Nullable(UInt64),\
         max_data_id Nullable(UInt64),\
         file_name Nullable(String), volume Nullable(String),\
         storage_address Nullable(String), size_bytes Nullable(UInt64),\
         gc_kind Nullable(String), collected Nullable(UInt64),\
         freed_bytes Nullable(UInt64),\
         addin_name Nullable(String), addin_method Nullable(String),\
         license_kind Nullable(String),\
         phrase Nullable(String), speech_model Nullable(String),\
         uri Nullable(String), http_method Nullable(String),\
         headers Nullable(String), body_preview Nullable(String),\
         user_agent Nullable(String), status Nullable(UInt16),\
         properties Map(String, String) DEFAULT map(),\
         raw_line String,\
         record_hash FixedString(40)\
         ) ENGINE = ReplacingMergeTree\
         PARTITION BY toYYYYMMDD(ts)\
         ORDER BY (cluster_guid, infobase_guid, name, ts, record_hash)\
         TTL toDateTime(ts) + INTERVAL {retention_days} DAY"
    ));

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.log_offsets (\
         source_type LowCardinality(String),\
         file_path String,\
         offset UInt64, records UInt64,\
         last_record_ts Nullable(DateTime64(6, 'UTC')),\
         file_size UInt64,\
         updated_at DateTime64(6, 'UTC')\
         ) ENGINE = ReplacingMergeTree(updated_at)\
         ORDER BY (source_type, file_path)"
    ));

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.parser_metrics (\
         parser_type LowCardinality(String),\
         cluster_guid String, infobase_guid String,\
         file_path String,\
         files_processed UInt64, records UInt64, errors UInt64,\
         read_us UInt64, parse_us UInt64, dedup_us UInt64, write_us UInt64,\
         records_per_sec Float64,\
         started_at DateTime64(6, 'UTC'), finished_at DateTime64(6, 'UTC'),\
         updated_at DateTime64(6, 'UTC')\
         ) ENGINE = ReplacingMergeTree(updated_at)\
         ORDER BY (parser_type, cluster_guid, infobase_guid, file_path)"
    ));

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.file_reading_progress (\
         parser_type LowCardinality(String),\
         cluster_guid String, infobase_guid String,\
         file_path String,\
         offset UInt64, file_size UInt64, percent Float64,\
         last_record_ts DateTime64(6, 'UTC'),\
         updated_at DateTime64(6, 'UTC')\
         ) ENGINE = ReplacingMergeTree(updated_at)\
         ORDER BY (parser_type, cluster_guid, infobase_guid, file_path)\
         TTL toDateTime(updated_at) + INTERVAL 7 DAY"
    ));

    ddl.push(format!(
        "CREATE TABLE IF NOT EXISTS {database}.mv_new_errors (\
         cluster_guid String, infobase_guid String,\
         source LowCardinality(String),\
         name LowCardinality(String),\
         error_signature UInt64,\
         normalized_text String,\
         sample_lines Array(String),\
         occurrences UInt64,\
         first_seen DateTime64(6, 'UTC'), last_seen DateTime64(6, 'UTC'),\
         updated_at DateTime64(6, 'UTC')\
         ) ENGINE = ReplacingMergeTree(updated_at)\
         ORDER BY (cluster_guid, infobase_guid, error_signature, last_seen)\
         TTL toDateTime(last_seen) + INTERVAL 7 DAY"
    ));

    // Reference mappings are produced by the enrichment worker; the core
    // only guarantees they exist so dashboards can join against them.
    for map_table in ["user_map", "metadata_map", "data_map"] {
        ddl.push(format!(
            "CREATE TABLE IF NOT EXISTS {database}.{map_table} (\
             infobase_guid String,\
             code String, presentation String,\
             updated_at DateTime64(6, 'UTC')\
             ) ENGINE = ReplacingMergeTree(updated_at)\
             ORDER BY (infobase_guid, code)"
        ));
    }

    ddl
}

/// Create the database and every sink table, retrying transient failures.
pub async fn ensure_schema(
    transport: &dyn SinkTransport,
    database: &str,
    retention_days: u32,
    cancel: &CancellationToken,
) -> Result<(), SinkError> {
    for statement in schema_statements(database, retention_days) {
        let sql = statement.as_str();
        retry_with_backoff(cancel, "schema bootstrap", || transport.execute(sql)).await?;
    }
    info!(
        message = "Sink schema is in place.",
        database,
        retention_days,
    );
    Ok(())
}
