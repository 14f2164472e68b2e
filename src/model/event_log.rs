use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::ch_datetime;

/// Sentinel stored when a record carries no transaction: 1980-01-01 UTC.
pub fn no_transaction_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).unwrap()
}

/// Event-log severity, one latin letter in the segment encoding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Severity {
    #[default]
    Information,
    Warning,
    Error,
    Note,
}

impl Severity {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Information),
            "W" => Some(Self::Warning),
            "E" => Some(Self::Error),
            "N" => Some(Self::Note),
            _ => None,
        }
    }

    /// The localized presentation the platform shows in its own viewer.
    pub fn presentation(&self) -> &'static str {
        match self {
            Self::Information => "Информация",
            Self::Warning => "Предупреждение",
            Self::Error => "Ошибка",
            Self::Note => "Примечание",
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.presentation())
    }
}

/// Outcome of the transaction a record was written under.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    Committed,
    RolledBack,
    Unfinished,
    #[default]
    None,
}

impl TransactionStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "U" => Some(Self::Committed),
            "C" => Some(Self::RolledBack),
            "R" => Some(Self::Unfinished),
            "N" => Some(Self::None),
            _ => None,
        }
    }

    pub fn presentation(&self) -> &'static str {
        match self {
            Self::Committed => "Зафиксирована",
            Self::RolledBack => "Отменена",
            Self::Unfinished => "Не завершена",
            Self::None => "Нет транзакции",
        }
    }
}

impl Serialize for TransactionStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.presentation())
    }
}

/// One business-journal record, fully resolved against the reference
/// dictionary. Identifier fields that failed to resolve stay empty, with the
/// raw dictionary id preserved in `properties`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EventLogRecord {
    #[serde(with = "ch_datetime")]
    pub event_time: DateTime<Utc>,
    pub cluster_guid: String,
    pub cluster_name: String,
    pub infobase_guid: String,
    pub infobase_name: String,
    pub level: Severity,
    pub event: String,
    pub event_presentation: String,
    pub user_name: String,
    pub user_uuid: String,
    pub computer: String,
    pub application: String,
    pub application_presentation: String,
    pub session_id: u64,
    pub connect_id: i64,
    pub connect_string: String,
    pub transaction_status: TransactionStatus,
    pub transaction_number: i64,
    #[serde(with = "ch_datetime")]
    pub transaction_datetime: DateTime<Utc>,
    pub transaction_id: String,
    pub data_separation: String,
    pub metadata: String,
    pub metadata_presentation: String,
    pub metadata_uuid: String,
    pub comment: String,
    pub data: String,
    pub data_presentation: String,
    pub server_name: String,
    pub primary_port: u16,
    pub secondary_port: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl EventLogRecord {
    /// A record primed with the no-transaction sentinel. The zero
    /// `event_time` of the plain default never leaves the parser.
    pub fn new() -> Self {
        Self {
            transaction_datetime: no_transaction_sentinel(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_codes_round_trip_presentation() {
        assert_eq!(Severity::from_code("I"), Some(Severity::Information));
        assert_eq!(Severity::from_code("E").unwrap().presentation(), "Ошибка");
        assert_eq!(Severity::from_code("X"), None);
    }

    #[test]
    fn transaction_codes() {
        assert_eq!(
            TransactionStatus::from_code("U"),
            Some(TransactionStatus::Committed)
        );
        assert_eq!(
            TransactionStatus::from_code("C"),
            Some(TransactionStatus::RolledBack)
        );
        assert_eq!(
            TransactionStatus::from_code("R"),
            Some(TransactionStatus::Unfinished)
        );
        assert_eq!(
            TransactionStatus::from_code("N"),
            Some(TransactionStatus::None)
        );
    }

    #[test]
    fn sentinel_is_1980() {
        let record = EventLogRecord::new();
        assert_eq!(
            record.transaction_datetime.to_rfc3339(),
            "1980-01-01T00:00:00+00:00"
        );
    }
}
