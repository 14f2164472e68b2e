//! Source discovery: walking configured roots for event-log directories
//! and deriving cluster/infobase identity from the directory layout and
//! the cluster index file.
//!
//! Layout on disk:
//!
//! ```text
//! <root>/reg_<port>/1CV8Clst.lst             cluster index
//! <root>/reg_<port>/<infobase-uuid>/1Cv8Log/1Cv8.lgf
//! <root>/reg_<port>/<infobase-uuid>/1Cv8Log/*.lgp
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use glob::glob;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ClusterMap;
use crate::model::SourceIdentity;

static GUID_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

// `{uuid,"name",port,...}` tuples inside 1CV8Clst.lst. The first tuple
// describes the cluster, the rest its infobases.
static CLST_TUPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\{([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}),"([^"]*)""#,
    )
    .unwrap()
});

/// One discovered event-log directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLogLocation {
    /// The `1Cv8Log` directory holding segments.
    pub directory: PathBuf,
    /// The reference dictionary file inside it.
    pub dictionary: PathBuf,
    pub identity: SourceIdentity,
}

impl EventLogLocation {
    /// Current `.lgp` segments in name (= chronological) order.
    pub fn segments(&self) -> Vec<PathBuf> {
        let pattern = self.directory.join("*.lgp");
        let mut segments: Vec<PathBuf> = glob(&pattern.to_string_lossy())
            .map(|paths| paths.flatten().collect())
            .unwrap_or_default();
        segments.sort();
        segments
    }
}

/// One configured tech-log root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TechLogLocation {
    pub root: PathBuf,
    pub identity: SourceIdentity,
}

/// Cluster identity plus infobase names parsed from `1CV8Clst.lst`.
#[derive(Clone, Debug, Default)]
pub struct ClusterIndex {
    pub cluster_guid: String,
    pub cluster_name: String,
    /// infobase uuid -> name.
    pub infobases: std::collections::HashMap<String, String>,
}

/// Parse the cluster index text. The first `{uuid,"name",...}` tuple is the
/// cluster itself; every following tuple is an infobase.
pub fn parse_cluster_index(content: &str) -> ClusterIndex {
    let mut index = ClusterIndex::default();
    for captures in CLST_TUPLE.captures_iter(content) {
        let uuid = captures[1].to_lowercase();
        let name = captures[2].to_owned();
        if index.cluster_guid.is_empty() {
            index.cluster_guid = uuid;
            index.cluster_name = name;
        } else {
            index.infobases.insert(uuid, name);
        }
    }
    index
}

/// Walk the configured roots for `1Cv8Log/1Cv8.lgf` and assemble identity
/// for each hit. An unreadable cluster index degrades to the `reg_<port>`
/// folder name as the cluster identifier with empty names.
pub fn discover_event_logs(roots: &[PathBuf], overrides: &ClusterMap) -> Vec<EventLogLocation> {
    let mut locations = Vec::new();
    for root in roots {
        let pattern = root.join("**").join("1Cv8Log").join("1Cv8.lgf");
        let paths = match glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(error) => {
                warn!(message = "Unusable event-log root.", root = ?root, %error);
                continue;
            }
        };
        for dictionary in paths.flatten() {
            let Some(directory) = dictionary.parent().map(Path::to_owned) else {
                continue;
            };
            let Some(infobase_dir) = directory.parent() else {
                continue;
            };
            let infobase_guid = infobase_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !GUID_SHAPE.is_match(&infobase_guid) {
                debug!(
                    message = "Skipping event-log directory without a GUID parent.",
                    directory = ?directory,
                );
                continue;
            }

            let reg_dir = infobase_dir.parent();
            let index = reg_dir
                .map(|reg| reg.join("1CV8Clst.lst"))
                .and_then(|path| std::fs::read_to_string(path).ok())
                .map(|content| parse_cluster_index(&content))
                .unwrap_or_default();

            let (cluster_guid, mut cluster_name) = if index.cluster_guid.is_empty() {
                let fallback = reg_dir
                    .and_then(|reg| reg.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (fallback, String::new())
            } else {
                (index.cluster_guid.clone(), index.cluster_name.clone())
            };
            let mut infobase_name = index
                .infobases
                .get(&infobase_guid)
                .cloned()
                .unwrap_or_default();

            if let Some(name) = overrides.cluster_name(&cluster_guid) {
                cluster_name = name.to_owned();
            }
            if let Some(name) = overrides.infobase_name(&infobase_guid) {
                infobase_name = name.to_owned();
            }

            debug!(
                message = "Discovered event-log location.",
                directory = ?directory,
                cluster = %cluster_guid,
                infobase = %infobase_guid,
            );
            locations.push(EventLogLocation {
                directory,
                dictionary,
                identity: SourceIdentity {
                    cluster_guid,
                    cluster_name,
                    infobase_guid,
                    infobase_name,
                },
            });
        }
    }
    locations
}

/// Assemble tech-log locations from the configured roots; identity comes
/// from the cluster map (or stays empty, with the root's directory name as
/// the cluster name).
pub fn discover_tech_logs(roots: &[PathBuf], overrides: &ClusterMap) -> Vec<TechLogLocation> {
    roots
        .iter()
        .map(|root| {
            let key = root.to_string_lossy();
            let identity = match overrides.techlog.get(key.as_ref()) {
                Some(supplied) => SourceIdentity {
                    cluster_guid: supplied.cluster_guid.clone(),
                    cluster_name: supplied.cluster_name.clone(),
                    infobase_guid: supplied.infobase_guid.clone(),
                    infobase_name: supplied.infobase_name.clone(),
                },
                None => SourceIdentity {
                    cluster_name: root
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    ..Default::default()
                },
            };
            TechLogLocation {
                root: root.clone(),
                identity,
            }
        })
        .collect()
}

/// Tech-log files under a root: `(hour-sortable name, path, process)` for
/// every `*.log` and `*.log.zip` whose name encodes an hour.
pub fn enumerate_tech_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for pattern in ["**/*.log", "**/*.log.zip"] {
        if let Ok(paths) = glob(&root.join(pattern).to_string_lossy()) {
            files.extend(paths.flatten());
        }
    }
    files.retain(|path| {
        path.file_name()
            .map(|n| crate::techlog::hour_from_filename(&n.to_string_lossy()).is_some())
            .unwrap_or(false)
    });
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::*;

    const CLST: &str = "{6e18b6c1-1576-4db3-a33c-4b17e73d769b,\"main-cluster\",1541,\
        {0,0},{d723aefd-7992-420d-b5f9-a273fd4146be,\"erp\",0},\
        {9a3f1b20-0000-4db3-a33c-4b17e73d769b,\"hrm\",0}}";

    #[test]
    fn cluster_index_first_tuple_is_cluster() {
        let index = parse_cluster_index(CLST);
        assert_eq!(index.cluster_guid, "6e18b6c1-1576-4db3-a33c-4b17e73d769b");
        assert_eq!(index.cluster_name, "main-cluster");
        assert_eq!(
            index.infobases["d723aefd-7992-420d-b5f9-a273fd4146be"],
            "erp"
        );
        assert_eq!(index.infobases.len(), 2);
    }

    fn seed_event_log(root: &Path) -> PathBuf {
        let log_dir = root
            .join("reg_1541")
            .join("d723aefd-7992-420d-b5f9-a273fd4146be")
            .join("1Cv8Log");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("1Cv8.lgf"), "1CV8LGF\n").unwrap();
        std::fs::write(log_dir.join("20251113000000.lgp"), "1CV8LOG\n").unwrap();
        std::fs::write(log_dir.join("20251114000000.lgp"), "1CV8LOG\n").unwrap();
        log_dir
    }

    #[test]
    fn discovers_location_with_cluster_index() {
        let dir = tempdir().unwrap();
        let log_dir = seed_event_log(dir.path());
        std::fs::write(dir.path().join("reg_1541").join("1CV8Clst.lst"), CLST).unwrap();

        let found = discover_event_logs(&[dir.path().to_owned()], &ClusterMap::default());
        assert_eq!(found.len(), 1);
        let location = &found[0];
        assert_eq!(location.directory, log_dir);
        assert_eq!(
            location.identity.cluster_guid,
            "6e18b6c1-1576-4db3-a33c-4b17e73d769b"
        );
        assert_eq!(location.identity.cluster_name, "main-cluster");
        assert_eq!(
            location.identity.infobase_guid,
            "d723aefd-7992-420d-b5f9-a273fd4146be"
        );
        assert_eq!(location.identity.infobase_name, "erp");

        let segments = location.segments();
        assert_eq!(segments.len(), 2);
        assert!(segments[0] < segments[1]);
    }

    #[test]
    fn unreadable_index_falls_back_to_reg_folder() {
        let dir = tempdir().unwrap();
        seed_event_log(dir.path());

        let found = discover_event_logs(&[dir.path().to_owned()], &ClusterMap::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity.cluster_guid, "reg_1541");
        assert_eq!(found[0].identity.cluster_name, "");
        assert_eq!(found[0].identity.infobase_name, "");
    }

    #[test]
    fn non_guid_parent_directories_are_skipped() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("reg_1541").join("not-a-guid").join("1Cv8Log");
        std::fs::create_dir_all(&bogus).unwrap();
        std::fs::write(bogus.join("1Cv8.lgf"), "1CV8LGF\n").unwrap();

        let found = discover_event_logs(&[dir.path().to_owned()], &ClusterMap::default());
        assert!(found.is_empty());
    }

    #[test]
    fn tech_files_enumerate_hour_named_only() {
        let dir = tempdir().unwrap();
        let proc_dir = dir.path().join("rphost_2012");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("2025111310.log"), "").unwrap();
        std::fs::write(proc_dir.join("2025111309.log.zip"), "").unwrap();
        std::fs::write(proc_dir.join("notes.log"), "").unwrap();

        let files = enumerate_tech_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].to_string_lossy().ends_with("2025111309.log.zip"));
        assert!(files[1].to_string_lossy().ends_with("2025111310.log"));
    }
}
