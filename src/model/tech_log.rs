use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ch_datetime;

/// DBMS call details (`DBMSSQL`, `DBPOSTGRS`, `DBORACLE`, `SDBL`, `DBV8DBENG`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct SqlFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdbl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_sql_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_copy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trans: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_pid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// Exception reporting (`EXCP`, `EXCPCNTX`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct ExceptionFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_info: Option<String>,
}

/// Managed lock traffic (`TLOCK`, `TTIMEOUT`, `TDEADLOCK`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct LockFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_connections: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadlock_connection_intersections: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalating: Option<String>,
}

/// Client/server connection lifecycle (`CONN`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectionFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_limit: Option<u64>,
}

/// Session-scoped identifiers shared by most events.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ib_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_client_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_connect_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_call_id: Option<u64>,
}

/// Worker-process lifecycle (`PROC`, `ADMIN`, `CLSTR`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u64>,
}

/// Memory and call accounting (`CALL`, `SCALL`, `MEM`, `LEAKS`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct MemoryFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_peak: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_client_id: Option<u64>,
}

/// Full-text search engine (`FTEXTCheck`, `FTEXTUpd`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct FullTextFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ft_component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ft_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ft_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_data_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_data_id: Option<u64>,
}

/// Configuration-storage traffic (`VRSREQUEST`, `VRSRESPONSE`, `FILE`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct StorageFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Platform garbage collection (`SDGC`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct GcFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freed_bytes: Option<u64>,
}

/// External component hosting (`ADDIN`, `EXTLIC`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct AddinFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addin_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addin_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_kind: Option<String>,
}

/// Speech-recognition subsystem events.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SpeechFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_model: Option<String>,
}

/// Web- and HTTP-service traffic (`HTTP`, `WEB`, `WS`).
#[derive(Clone, Debug, Default, Serialize)]
pub struct WebFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// One tech-log record: framing fields, identity derived from the file's
/// location, the typed field groups recognised for its event name, and a
/// property map catching everything else. `raw_line` keeps the source bytes
/// verbatim for forensics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TechLogRecord {
    #[serde(with = "ch_datetime")]
    pub ts: DateTime<Utc>,
    pub duration_us: u64,
    pub name: String,
    pub depth: u32,
    pub process: String,
    pub os_thread: String,
    pub cluster_guid: String,
    pub cluster_name: String,
    pub infobase_guid: String,
    pub infobase_name: String,
    #[serde(flatten)]
    pub session: SessionFields,
    #[serde(flatten)]
    pub sql: SqlFields,
    #[serde(flatten)]
    pub exception: ExceptionFields,
    #[serde(flatten)]
    pub lock: LockFields,
    #[serde(flatten)]
    pub connection: ConnectionFields,
    #[serde(flatten)]
    pub process_info: ProcessFields,
    #[serde(flatten)]
    pub memory: MemoryFields,
    #[serde(flatten)]
    pub full_text: FullTextFields,
    #[serde(flatten)]
    pub storage: StorageFields,
    #[serde(flatten)]
    pub gc: GcFields,
    #[serde(flatten)]
    pub addin: AddinFields,
    #[serde(flatten)]
    pub speech: SpeechFields,
    #[serde(flatten)]
    pub web: WebFields,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    pub raw_line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_groups_stay_out_of_rows() {
        let record = TechLogRecord {
            name: "EXCP".into(),
            raw_line: "raw".into(),
            ..Default::default()
        };
        let row = serde_json::to_value(&record).unwrap();
        let object = row.as_object().unwrap();
        assert!(object.contains_key("name"));
        assert!(!object.contains_key("sql"));
        assert!(!object.contains_key("descr"));
        assert!(!object.contains_key("properties"));
    }

    #[test]
    fn typed_fields_serialize_flat() {
        let record = TechLogRecord {
            name: "DBMSSQL".into(),
            sql: SqlFields {
                sql: Some("SELECT 1".into()),
                rows: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let row = serde_json::to_value(&record).unwrap();
        assert_eq!(row["sql"], "SELECT 1");
        assert_eq!(row["rows"], 1);
    }
}
