//! Parser for tech-log records.
//!
//! A record begins `mm:ss.uuuuuu-<duration>,<EVENT>,<depth>` and continues
//! with `,key=value` pairs. Values may be quoted with `'` or `"`, use a
//! doubled quote as the internal escape, and may run across physical lines;
//! a line that does not start with the timestamp prefix continues the
//! record before it. The hour and date come from the enclosing filename
//! (`YYYYMMDDHH.log`).

use chrono::{Duration, NaiveDate, NaiveDateTime};
use snafu::Snafu;

use crate::model::{SourceIdentity, TechLogRecord};

#[derive(Debug, Snafu, PartialEq)]
pub enum TechParseError {
    #[snafu(display("line does not start with a tech-log timestamp"))]
    NotARecord,
    #[snafu(display("bad {what} in record header"))]
    BadHeader { what: &'static str },
}

/// Does this line open a new record? (`mm:ss.uuuuuu-` prefix.)
pub fn is_record_start(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() > 13
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2] == b':'
        && bytes[3].is_ascii_digit()
        && bytes[4].is_ascii_digit()
        && bytes[5] == b'.'
        && bytes[6..12].iter().all(u8::is_ascii_digit)
        && bytes[12] == b'-'
}

/// Stitches physical lines back into logical records. Feed lines in file
/// order; a completed record pops out when the next one starts.
#[derive(Debug, Default)]
pub struct LineAssembler {
    current: Option<String>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns the record this line completed, if any.
    pub fn push(&mut self, line: &str) -> Option<String> {
        if is_record_start(line) {
            let finished = self.current.take();
            self.current = Some(line.to_owned());
            finished
        } else {
            // Continuation of a multi-line quoted value. A continuation
            // with no open record is rotation debris; drop it.
            if let Some(current) = self.current.as_mut() {
                current.push('\n');
                current.push_str(line);
            }
            None
        }
    }

    /// The record still being assembled, surrendered. Call at end of file.
    pub fn finish(&mut self) -> Option<String> {
        self.current.take()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Drop assembly state without emitting, e.g. across a rotation.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Date and hour encoded in a tech-log filename (`2025111310.log`,
/// optionally `.zip`-suffixed).
pub fn hour_from_filename(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(".zip").unwrap_or(name);
    let stem = stem.strip_suffix(".log")?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = stem[0..4].parse().ok()?;
    let month: u32 = stem[4..6].parse().ok()?;
    let day: u32 = stem[6..8].parse().ok()?;
    let hour: u32 = stem[8..10].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, 0, 0)
}

/// Parse one assembled record. `process` is the worker-process name taken
/// from the directory layout (`rphost_2012` and friends).
pub fn parse_record(
    hour: NaiveDateTime,
    text: &str,
    identity: &SourceIdentity,
    process: &str,
) -> Result<TechLogRecord, TechParseError> {
    if !is_record_start(text) {
        return Err(TechParseError::NotARecord);
    }

    let minutes: i64 = text[0..2].parse().map_err(|_| TechParseError::BadHeader {
        what: "minutes",
    })?;
    let seconds: i64 = text[3..5].parse().map_err(|_| TechParseError::BadHeader {
        what: "seconds",
    })?;
    let micros: i64 = text[6..12].parse().map_err(|_| TechParseError::BadHeader {
        what: "microseconds",
    })?;

    let rest = &text[13..];
    let (duration_raw, rest) = rest.split_once(',').ok_or(TechParseError::BadHeader {
        what: "duration",
    })?;
    let duration_us: u64 = duration_raw.parse().map_err(|_| TechParseError::BadHeader {
        what: "duration",
    })?;
    let (name, rest) = rest
        .split_once(',')
        .map(|(name, rest)| (name, Some(rest)))
        .unwrap_or((rest, None));
    if name.is_empty() {
        return Err(TechParseError::BadHeader { what: "event name" });
    }
    let (depth_raw, rest) = match rest {
        Some(rest) => rest
            .split_once(',')
            .map(|(depth, rest)| (depth, Some(rest)))
            .unwrap_or((rest, None)),
        None => ("0", None),
    };
    let depth: u32 = depth_raw.parse().map_err(|_| TechParseError::BadHeader {
        what: "nesting depth",
    })?;

    let mut record = TechLogRecord {
        ts: (hour + Duration::minutes(minutes) + Duration::seconds(seconds)
            + Duration::microseconds(micros))
        .and_utc(),
        duration_us,
        name: name.to_owned(),
        depth,
        process: process.to_owned(),
        cluster_guid: identity.cluster_guid.clone(),
        cluster_name: identity.cluster_name.clone(),
        infobase_guid: identity.infobase_guid.clone(),
        infobase_name: identity.infobase_name.clone(),
        raw_line: text.to_owned(),
        ..Default::default()
    };

    if let Some(rest) = rest {
        for (key, value) in PairIter::new(rest) {
            assign(&mut record, key, value);
        }
    }

    Ok(record)
}

/// Iterator over `,key=value` pairs with quote handling.
struct PairIter<'a> {
    rest: &'a str,
}

impl<'a> PairIter<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }
}

impl<'a> Iterator for PairIter<'a> {
    type Item = (&'a str, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let (key, after_key) = match self.rest.split_once('=') {
                Some(split) => split,
                None => {
                    // Trailing junk without '='; ignore the remainder.
                    self.rest = "";
                    return None;
                }
            };
            let key = key.trim_start_matches(',').trim();

            let (value, rest) = take_value(after_key);
            self.rest = rest;
            if key.is_empty() {
                continue;
            }
            return Some((key, value));
        }
    }
}

/// Read a value starting at `input`: quoted (with `''` / `""` escapes) or
/// bare up to the next comma. Returns the decoded value and the remainder.
fn take_value(input: &str) -> (String, &str) {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, quote @ ('\'' | '"'))) => {
            let mut value = String::new();
            let mut iter = input[1..].char_indices().peekable();
            while let Some((i, c)) = iter.next() {
                if c == quote {
                    if let Some(&(_, next)) = iter.peek() {
                        if next == quote {
                            // Doubled quote is a literal quote.
                            value.push(quote);
                            iter.next();
                            continue;
                        }
                    }
                    let consumed = 1 + i + c.len_utf8();
                    return (value, &input[consumed..]);
                }
                value.push(c);
            }
            // Unterminated quote: take the remainder verbatim.
            (value, "")
        }
        Some(_) => match input.find(',') {
            Some(comma) => (input[..comma].to_owned(), &input[comma..]),
            None => (input.to_owned(), ""),
        },
        None => (String::new(), ""),
    }
}

fn assign(record: &mut TechLogRecord, key: &str, value: String) {
    use std::collections::BTreeMap;

    // A typed numeric field that fails to parse keeps its raw text in the
    // property map instead of being lost.
    fn set_num<T: std::str::FromStr>(
        slot: &mut Option<T>,
        properties: &mut BTreeMap<String, String>,
        key: &str,
        value: String,
    ) {
        match value.parse() {
            Ok(parsed) => *slot = Some(parsed),
            Err(_) => {
                properties.insert(key.to_owned(), value);
            }
        }
    }

    macro_rules! num {
        ($slot:expr) => {
            set_num(&mut $slot, &mut record.properties, key, value)
        };
    }

    match key {
        "process" => record.process = value,
        "OSThread" => record.os_thread = value,

        "Usr" => record.session.usr = Some(value),
        "AppID" => record.session.app_id = Some(value),
        "t:applicationName" => record.session.application_name = Some(value),
        "t:computerName" => record.session.computer_name = Some(value),
        "Interface" => record.session.interface = Some(value),
        "Method" | "MName" => record.session.method_name = Some(value),
        "Module" => record.session.module = Some(value),
        "Context" => record.session.context = Some(value),
        "IB" | "p:processName" => record.session.ib_name = Some(value),
        "SessionID" => num!(record.session.session_id),
        "ClientID" => num!(record.session.client_id),
        "t:clientID" => num!(record.session.t_client_id),
        "t:connectID" => num!(record.session.t_connect_id),
        "CallID" => num!(record.session.call_id),
        "InCallID" => num!(record.session.in_call_id),

        "Sql" => record.sql.sql = Some(value),
        "Sdbl" => record.sql.sdbl = Some(value),
        "planSQLText" => record.sql.plan_sql_text = Some(value),
        "Prm" => record.sql.prm = Some(value),
        "Func" => record.sql.func = Some(value),
        "DBMS" => record.sql.dbms = Some(value),
        "DataBase" | "database" => record.sql.database = Some(value),
        "DBUsr" => record.sql.db_user = Some(value),
        "dbcopy" => record.sql.db_copy = Some(value),
        "Trans" => record.sql.trans = Some(value),
        "dbpid" => num!(record.sql.db_pid),
        "Rows" => num!(record.sql.rows),
        "RowsAffected" => num!(record.sql.rows_affected),

        "Exception" => record.exception.exception = Some(value),
        "Descr" => record.exception.descr = Some(value),
        "OSException" => record.exception.os_exception = Some(value),
        "Reason" => record.exception.reason = Some(value),
        "ContextInfo" => record.exception.context_info = Some(value),

        "Regions" => record.lock.regions = Some(value),
        "Locks" => record.lock.locks = Some(value),
        "WaitConnections" => record.lock.wait_connections = Some(value),
        "DeadlockConnectionIntersections" => {
            record.lock.deadlock_connection_intersections = Some(value)
        }
        "lksrc" => record.lock.lock_source = Some(value),
        "escalating" => record.lock.escalating = Some(value),

        "Txt" => record.connection.txt = Some(value),
        "Protected" => record.connection.protected = Some(value),
        "Address" => record.connection.address = Some(value),
        "Protocol" => record.connection.protocol = Some(value),
        "Port" => num!(record.connection.port),
        "ConnLimit" => num!(record.connection.connection_limit),

        "ProcessKind" => record.process_info.process_kind = Some(value),
        "ServiceName" => record.process_info.service_name = Some(value),
        "AgentURL" => record.process_info.agent_url = Some(value),
        "ClusterURL" => record.process_info.cluster_url = Some(value),
        "RunAs" => record.process_info.run_as = Some(value),
        "PID" => num!(record.process_info.pid),

        "Memory" => num!(record.memory.memory),
        "MemoryPeak" => num!(record.memory.memory_peak),
        "InBytes" => num!(record.memory.in_bytes),
        "OutBytes" => num!(record.memory.out_bytes),
        "CpuTime" => num!(record.memory.cpu_time),
        "DstClientID" => num!(record.memory.dst_client_id),

        "Component" => record.full_text.ft_component = Some(value),
        "State" => record.full_text.ft_state = Some(value),
        "FtRows" => num!(record.full_text.ft_rows),
        "MinDataId" => num!(record.full_text.min_data_id),
        "MaxDataId" => num!(record.full_text.max_data_id),

        "FileName" => record.storage.file_name = Some(value),
        "Volume" => record.storage.volume = Some(value),
        "StorageAddress" => record.storage.storage_address = Some(value),
        "Size" => num!(record.storage.size_bytes),

        "GCKind" => record.gc.gc_kind = Some(value),
        "Collected" => num!(record.gc.collected),
        "Freed" => num!(record.gc.freed_bytes),

        "AddinName" => record.addin.addin_name = Some(value),
        "AddinMethod" => record.addin.addin_method = Some(value),
        "LicenseKind" => record.addin.license_kind = Some(value),

        "Phrase" => record.speech.phrase = Some(value),
        "Model" => record.speech.speech_model = Some(value),

        "URI" => record.web.uri = Some(value),
        "Headers" => record.web.headers = Some(value),
        "Body" => record.web.body_preview = Some(value),
        "UserAgent" => record.web.user_agent = Some(value),
        "Status" => num!(record.web.status),

        _ => {
            record.properties.insert(key.to_owned(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn hour() -> NaiveDateTime {
        hour_from_filename("2025111310.log").unwrap()
    }

    fn identity() -> SourceIdentity {
        SourceIdentity {
            cluster_guid: "6e18b6c1-1576-4db3-a33c-4b17e73d769b".into(),
            infobase_guid: "d723aefd-7992-420d-b5f9-a273fd4146be".into(),
            ..Default::default()
        }
    }

    #[test]
    fn filename_hour_parses() {
        assert_eq!(
            hour_from_filename("2025111310.log").unwrap().to_string(),
            "2025-11-13 10:00:00"
        );
        assert_eq!(
            hour_from_filename("2025111310.log.zip").unwrap().to_string(),
            "2025-11-13 10:00:00"
        );
        assert_eq!(hour_from_filename("notes.log"), None);
        assert_eq!(hour_from_filename("20251113.log"), None);
    }

    #[test]
    fn simple_dbmssql_record() {
        let line = "41:17.112004-25023,DBMSSQL,2,process=rphost,OSThread=4188,SessionID=117,Usr=Смирнов,DBMS=DBPOSTGRS,DataBase=erp_main,Rows=12,Sql='SELECT 1'";
        let record = parse_record(hour(), line, &identity(), "rphost_2012").unwrap();
        assert_eq!(record.ts.to_rfc3339(), "2025-11-13T10:41:17.112004+00:00");
        assert_eq!(record.duration_us, 25023);
        assert_eq!(record.name, "DBMSSQL");
        assert_eq!(record.depth, 2);
        assert_eq!(record.process, "rphost");
        assert_eq!(record.os_thread, "4188");
        assert_eq!(record.session.session_id, Some(117));
        assert_eq!(record.session.usr.as_deref(), Some("Смирнов"));
        assert_eq!(record.sql.dbms.as_deref(), Some("DBPOSTGRS"));
        assert_eq!(record.sql.database.as_deref(), Some("erp_main"));
        assert_eq!(record.sql.rows, Some(12));
        assert_eq!(record.sql.sql.as_deref(), Some("SELECT 1"));
        assert_eq!(record.cluster_guid, identity().cluster_guid);
        assert!(record.properties.is_empty());
        assert_eq!(record.raw_line, line);
    }

    #[test]
    fn quoted_value_with_doubled_quote_escape() {
        let line = "00:01.000001-5,EXCP,1,Descr='it said ''no'' and quit',Usr=jdoe";
        let record = parse_record(hour(), line, &identity(), "rphost").unwrap();
        assert_eq!(
            record.exception.descr.as_deref(),
            Some("it said 'no' and quit")
        );
        assert_eq!(record.session.usr.as_deref(), Some("jdoe"));
    }

    #[test]
    fn unknown_keys_land_in_properties() {
        let line = "00:01.000001-5,EXCP,1,SomethingNew=42,Descr=boom";
        let record = parse_record(hour(), line, &identity(), "rphost").unwrap();
        assert_eq!(record.properties.get("SomethingNew").unwrap(), "42");
        assert_eq!(record.exception.descr.as_deref(), Some("boom"));
    }

    #[test]
    fn non_numeric_typed_field_degrades_to_property() {
        let line = "00:01.000001-5,CALL,1,SessionID=abc";
        let record = parse_record(hour(), line, &identity(), "rphost").unwrap();
        assert_eq!(record.session.session_id, None);
        assert_eq!(record.properties.get("SessionID").unwrap(), "abc");
    }

    #[test]
    fn assembler_joins_continuation_lines() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push("53:01.000001-10,EXCP,1,Descr='first"), None);
        assert_eq!(assembler.push("second line"), None);
        let completed = assembler
            .push("53:02.000002-20,CALL,1,CallID=9")
            .expect("first record completes when the second starts");
        assert_eq!(completed, "53:01.000001-10,EXCP,1,Descr='first\nsecond line");
        let last = assembler.finish().unwrap();
        assert_eq!(last, "53:02.000002-20,CALL,1,CallID=9");
        assert!(assembler.is_empty());

        let record = parse_record(hour(), &completed, &identity(), "rphost").unwrap();
        assert_eq!(
            record.exception.descr.as_deref(),
            Some("first\nsecond line")
        );
    }

    #[test]
    fn continuation_without_open_record_is_dropped() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push("tail of a record we never saw"), None);
        assert!(assembler.is_empty());
    }

    #[test]
    fn record_without_properties() {
        let line = "00:00.000001-0,SYSTEM,0";
        let record = parse_record(hour(), line, &identity(), "ragent").unwrap();
        assert_eq!(record.name, "SYSTEM");
        assert_eq!(record.depth, 0);
    }
}
