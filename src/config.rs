//! Process configuration, read from the environment.
//!
//! Every knob is an environment variable; the optional cluster-map YAML
//! file overrides the display names derived from directory layout.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid configuration: {reason}"))]
    ConfigInvalid { reason: String },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ConfigInvalid {
        reason: reason.into(),
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub clickhouse_host: String,
    pub clickhouse_port: u16,
    pub clickhouse_db: String,
    /// Event-log roots, from the `;`-separated `LOG_DIRS`.
    pub log_dirs: Vec<PathBuf>,
    /// Tech-log roots, from the `;`-separated `TECHLOG_DIRS`.
    pub techlog_dirs: Vec<PathBuf>,
    pub retention_days: u32,
    pub read_only: bool,
    pub offset_mirror: bool,
    /// Port the query facade binds; carried for the external facade, the
    /// core only validates it.
    pub mcp_port: u16,
    pub log_level: String,
    pub cluster_map_path: PathBuf,
    pub tracing_enabled: bool,
    /// Location of the embedded offset-store file.
    pub offset_store_path: PathBuf,
}

impl Config {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let clickhouse_host = get("CLICKHOUSE_HOST").unwrap_or_else(|| "localhost".into());
        let clickhouse_port = match get("CLICKHOUSE_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| invalid(format!("CLICKHOUSE_PORT {raw:?} is not a valid port")))?,
            None => 9000,
        };
        let clickhouse_db = get("CLICKHOUSE_DB").unwrap_or_else(|| "logs".into());

        let split_dirs = |raw: Option<String>| -> Vec<PathBuf> {
            raw.map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
        };
        let log_dirs = split_dirs(get("LOG_DIRS"));
        let techlog_dirs = split_dirs(get("TECHLOG_DIRS"));
        if log_dirs.is_empty() && techlog_dirs.is_empty() {
            return Err(invalid(
                "at least one of LOG_DIRS or TECHLOG_DIRS must be set",
            ));
        }

        let retention_days = match get("LOG_RETENTION_DAYS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|d| *d >= 1)
                .ok_or_else(|| invalid(format!("LOG_RETENTION_DAYS {raw:?} must be >= 1")))?,
            None => 30,
        };

        let parse_bool = |key: &str| -> Result<bool, ConfigError> {
            match get(key).as_deref() {
                None => Ok(false),
                Some("1") | Some("true") | Some("TRUE") | Some("True") | Some("yes") => Ok(true),
                Some("0") | Some("false") | Some("FALSE") | Some("False") | Some("no") => Ok(false),
                Some(other) => Err(invalid(format!("{key} {other:?} is not a boolean"))),
            }
        };

        let mcp_port = match get("MCP_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| invalid(format!("MCP_PORT {raw:?} is not a valid port")))?,
            None => 8080,
        };

        Ok(Self {
            clickhouse_host,
            clickhouse_port,
            clickhouse_db,
            log_dirs,
            techlog_dirs,
            retention_days,
            read_only: parse_bool("READ_ONLY")?,
            offset_mirror: parse_bool("OFFSET_MIRROR")?,
            mcp_port,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            cluster_map_path: get("CLUSTER_MAP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("configs/cluster_map.yaml")),
            tracing_enabled: parse_bool("TRACING_ENABLED")?,
            offset_store_path: get("OFFSET_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/offsets.redb")),
        })
    }
}

/// Optional YAML file overriding display names and supplying tech-log
/// identities that the directory layout cannot.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterMap {
    #[serde(default)]
    pub clusters: HashMap<String, String>,
    #[serde(default)]
    pub infobases: HashMap<String, String>,
    #[serde(default)]
    pub techlog: HashMap<String, TechLogIdentity>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TechLogIdentity {
    #[serde(default)]
    pub cluster_guid: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub infobase_guid: String,
    #[serde(default)]
    pub infobase_name: String,
}

impl ClusterMap {
    /// Load the map, degrading to empty when the file is absent. A present
    /// but unparseable file is a configuration error.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| invalid(format!("cluster map {path:?}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(invalid(format!("cluster map {path:?}: {e}"))),
        }
    }

    pub fn cluster_name(&self, guid: &str) -> Option<&str> {
        self.clusters.get(guid).map(String::as_str)
    }

    pub fn infobase_name(&self, guid: &str) -> Option<&str> {
        self.infobases.get(guid).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_map_parses_and_defaults() {
        let raw = "clusters:\n  6e18b6c1-1576-4db3-a33c-4b17e73d769b: Prod\ninfobases:\n  d723aefd-7992-420d-b5f9-a273fd4146be: ERP\ntechlog:\n  /var/log/techlog:\n    cluster_name: Prod\n";
        let map: ClusterMap = serde_yaml::from_str(raw).unwrap();
        assert_eq!(
            map.cluster_name("6e18b6c1-1576-4db3-a33c-4b17e73d769b"),
            Some("Prod")
        );
        assert_eq!(map.infobase_name("missing"), None);
        assert_eq!(
            map.techlog.get("/var/log/techlog").unwrap().cluster_name,
            "Prod"
        );
    }

    #[test]
    fn missing_cluster_map_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = ClusterMap::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(map.clusters.is_empty());
    }
}
