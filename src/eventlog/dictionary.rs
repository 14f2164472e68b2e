//! Reader for the `1Cv8.lgf` reference dictionary.
//!
//! The dictionary maps the small integer ids that segment records carry to
//! user/computer/application/event/metadata names. It is tiny (well under a
//! megabyte), read-only for the parser, and loaded lazily exactly once per
//! process; lookups after the load proceed concurrently without locking.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{debug, warn};

use super::bracket::{RecordScanner, Scan, split_fields};

/// Dictionary object kinds, in the file's own numbering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Users = 1,
    Computers = 2,
    Applications = 3,
    Events = 4,
    Metadata = 5,
    Servers = 6,
    MainPorts = 7,
    AddPorts = 8,
}

impl ObjectKind {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Users),
            2 => Some(Self::Computers),
            3 => Some(Self::Applications),
            4 => Some(Self::Events),
            5 => Some(Self::Metadata),
            6 => Some(Self::Servers),
            7 => Some(Self::MainPorts),
            8 => Some(Self::AddPorts),
            _ => None,
        }
    }

    /// Users and Metadata entries carry a UUID alongside the display value.
    fn referenced(&self) -> bool {
        matches!(self, Self::Users | Self::Metadata)
    }
}

#[derive(Clone, Debug, Default)]
struct Entry {
    value: String,
    uuid: String,
}

/// The parsed dictionary. A missing id is not an error: lookups return
/// empty strings and the caller records the raw id instead.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: HashMap<(ObjectKind, i64), Entry>,
}

impl Dictionary {
    /// Display value for simple kinds.
    pub fn value(&self, kind: ObjectKind, id: i64) -> &str {
        self.entries
            .get(&(kind, id))
            .map(|e| e.value.as_str())
            .unwrap_or("")
    }

    /// Display value plus UUID, for Users and Metadata.
    pub fn referenced(&self, kind: ObjectKind, id: i64) -> (&str, &str) {
        self.entries
            .get(&(kind, id))
            .map(|e| (e.value.as_str(), e.uuid.as_str()))
            .unwrap_or(("", ""))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse dictionary text. The version marker and infobase UUID lines
    /// ahead of the first entry are not brace groups and fall out of the
    /// scan as inter-record junk; malformed entries are skipped.
    pub fn parse(content: &[u8]) -> Self {
        let mut entries = HashMap::new();
        let mut scanner = RecordScanner::new(BufReader::new(content));
        loop {
            let record = match scanner.next_record() {
                Ok(Scan::Record(record)) => record,
                Ok(Scan::Eof) => break,
                Err(error @ super::bracket::ScanError::MalformedRun { .. }) => {
                    warn!(message = "Skipping malformed dictionary content.", %error);
                    continue;
                }
                Err(error) => {
                    warn!(message = "Error reading dictionary content.", %error);
                    break;
                }
            };
            let fields = match split_fields(&record.text) {
                Ok(fields) => fields,
                Err(_) => continue,
            };
            let Some(kind) = fields
                .first()
                .and_then(|f| f.text().parse::<i64>().ok())
                .and_then(ObjectKind::from_code)
            else {
                continue;
            };

            // Referenced kinds: {kind, uuid, "name", id}. Others:
            // {kind, value, id}.
            let parsed = if kind.referenced() {
                match (fields.get(1), fields.get(2), fields.get(3)) {
                    (Some(uuid), Some(name), Some(id)) => {
                        id.text().parse::<i64>().ok().map(|id| {
                            (
                                id,
                                Entry {
                                    value: name.text().to_owned(),
                                    uuid: uuid.text().to_owned(),
                                },
                            )
                        })
                    }
                    _ => None,
                }
            } else {
                match (fields.get(1), fields.get(2)) {
                    (Some(value), Some(id)) => id.text().parse::<i64>().ok().map(|id| {
                        (
                            id,
                            Entry {
                                value: value.text().to_owned(),
                                uuid: String::new(),
                            },
                        )
                    }),
                    _ => None,
                }
            };
            if let Some((id, entry)) = parsed {
                entries.insert((kind, id), entry);
            }
        }
        Self { entries }
    }
}

/// Lazily loaded dictionary bound to a path. The first lookup loads the
/// file; concurrent first callers block on the same load and never repeat
/// it. A read failure logs a warning and degrades to the empty dictionary,
/// which resolves everything to empty strings.
pub struct LazyDictionary {
    path: PathBuf,
    cell: OnceLock<Dictionary>,
}

impl LazyDictionary {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cell: OnceLock::new(),
        }
    }

    pub fn get(&self) -> &Dictionary {
        self.cell.get_or_init(|| match std::fs::read(&self.path) {
            Ok(content) => {
                let dictionary = Dictionary::parse(&content);
                debug!(
                    message = "Loaded reference dictionary.",
                    path = ?self.path,
                    entries = dictionary.len(),
                );
                dictionary
            }
            Err(error) => {
                warn!(
                    message = "Reference dictionary unreadable; ids will not resolve.",
                    path = ?self.path,
                    %error,
                );
                Dictionary::default()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const SAMPLE: &str = "1CV8LGF\n\
        d723aefd-7992-420d-b5f9-a273fd4146be\n\
        {1,11111111-2222-3333-4444-555555555555,\"Admin\",1},\n\
        {2,\"PC1\",2},\n\
        {3,\"1CV8C\",1},\n\
        {4,\"_$Session$_.Start\",3},\n\
        {5,e7331329-e979-45b6-9fa9-8b7a2e4418e8,\"Справочник.Номенклатура\",4},\n\
        {6,\"srv-app-01\",1},\n\
        {7,\"1560\",5}\n";

    #[test]
    fn resolves_simple_and_referenced_kinds() {
        let dictionary = Dictionary::parse(SAMPLE.as_bytes());
        assert_eq!(dictionary.value(ObjectKind::Computers, 2), "PC1");
        assert_eq!(dictionary.value(ObjectKind::Applications, 1), "1CV8C");
        assert_eq!(
            dictionary.value(ObjectKind::Events, 3),
            "_$Session$_.Start"
        );
        assert_eq!(
            dictionary.referenced(ObjectKind::Users, 1),
            ("Admin", "11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(
            dictionary.referenced(ObjectKind::Metadata, 4),
            (
                "Справочник.Номенклатура",
                "e7331329-e979-45b6-9fa9-8b7a2e4418e8"
            )
        );
    }

    #[test]
    fn miss_returns_empty_never_errors() {
        let dictionary = Dictionary::parse(SAMPLE.as_bytes());
        assert_eq!(dictionary.value(ObjectKind::Computers, 999), "");
        assert_eq!(dictionary.referenced(ObjectKind::Users, 999), ("", ""));
    }

    #[test]
    fn lazy_load_happens_once_and_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1Cv8.lgf");
        std::fs::write(&path, SAMPLE).unwrap();

        let lazy = LazyDictionary::new(path.clone());
        assert_eq!(lazy.get().value(ObjectKind::Computers, 2), "PC1");

        // Deleting the file after the first lookup changes nothing: the
        // load is one-shot.
        std::fs::remove_file(&path).unwrap();
        assert_eq!(lazy.get().value(ObjectKind::Computers, 2), "PC1");

        let missing = LazyDictionary::new(dir.path().join("absent.lgf"));
        assert!(missing.get().is_empty());
        assert_eq!(missing.get().value(ObjectKind::Users, 1), "");
    }
}
