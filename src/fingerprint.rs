//! Content-addressed record fingerprints.
//!
//! The digest is the deduplication key (`record_hash` in every sink table):
//! two records collide exactly when every identifying field and every
//! property agree. Fields are serialized in a fixed order with a `|`
//! separator; timestamps as RFC 3339 with nanoseconds, integers in decimal,
//! properties in key order.

use std::fmt::Write as _;

use chrono::SecondsFormat;
use sha1::{Digest, Sha1};

use crate::model::{EventLogRecord, TechLogRecord};

const SEP: &[u8] = b"|";

/// A stable 40-character hex SHA-1 digest of the record's identity.
pub trait Fingerprint {
    fn record_hash(&self) -> String;
}

fn hex_digest(hasher: Sha1) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

impl Fingerprint for EventLogRecord {
    fn record_hash(&self) -> String {
        let mut hasher = Sha1::new();
        for field in [
            self.event_time
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_str(),
            &self.cluster_guid,
            &self.infobase_guid,
            self.level.presentation(),
            &self.event,
            &self.user_name,
            &self.user_uuid,
            &self.computer,
            &self.application,
            self.session_id.to_string().as_str(),
            self.connect_id.to_string().as_str(),
            &self.connect_string,
            self.transaction_status.presentation(),
            self.transaction_number.to_string().as_str(),
            self.transaction_datetime
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_str(),
            &self.data_separation,
            &self.metadata,
            &self.metadata_uuid,
            &self.comment,
            &self.data,
            &self.data_presentation,
            &self.server_name,
            self.primary_port.to_string().as_str(),
            self.secondary_port.to_string().as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(SEP);
        }
        for (key, value) in &self.properties {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(SEP);
        }
        hex_digest(hasher)
    }
}

impl Fingerprint for TechLogRecord {
    fn record_hash(&self) -> String {
        let mut hasher = Sha1::new();
        for field in [
            self.ts
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_str(),
            self.duration_us.to_string().as_str(),
            &self.name,
            self.depth.to_string().as_str(),
            &self.process,
            &self.os_thread,
            &self.cluster_guid,
            &self.infobase_guid,
            // The raw line covers every typed field, since they are all
            // projections of it.
            &self.raw_line,
        ] {
            hasher.update(field.as_bytes());
            hasher.update(SEP);
        }
        for (key, value) in &self.properties {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(SEP);
        }
        hex_digest(hasher)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::Severity;

    fn sample() -> EventLogRecord {
        let mut record = EventLogRecord::new();
        record.event_time = Utc.with_ymd_and_hms(2025, 11, 13, 14, 42, 28).unwrap();
        record.cluster_guid = "6e18b6c1-1576-4db3-a33c-4b17e73d769b".into();
        record.infobase_guid = "d723aefd-7992-420d-b5f9-a273fd4146be".into();
        record.level = Severity::Information;
        record.event = "_$Session$_.Start".into();
        record.user_name = "Admin".into();
        record.session_id = 26;
        record
    }

    #[test]
    fn digest_is_40_hex_chars() {
        let hash = sample().record_hash();
        assert_eq!(hash.len(), 40);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_records_collide() {
        assert_eq!(sample().record_hash(), sample().record_hash());
    }

    #[test]
    fn any_identifying_field_separates() {
        let base = sample();
        let mut other = sample();
        other.comment = "something happened".into();
        assert_ne!(base.record_hash(), other.record_hash());
    }

    #[test]
    fn property_insertion_order_is_irrelevant() {
        let mut a = sample();
        a.properties.insert("zeta".into(), "1".into());
        a.properties.insert("alpha".into(), "2".into());

        let mut b = sample();
        b.properties.insert("alpha".into(), "2".into());
        b.properties.insert("zeta".into(), "1".into());

        assert_eq!(a.record_hash(), b.record_hash());
    }

    #[test]
    fn separator_prevents_field_bleed() {
        // "ab" + "c" must not hash like "a" + "bc".
        let mut a = sample();
        a.computer = "ab".into();
        a.application = "c".into();
        let mut b = sample();
        b.computer = "a".into();
        b.application = "bc".into();
        assert_ne!(a.record_hash(), b.record_hash());
    }
}
