//! Error-text normalization for aggregation.
//!
//! Dynamic fragments (identifiers, timestamps, counters) are replaced with
//! placeholders so that repeated occurrences of the same underlying error
//! collapse to one signature. The SQL-aware variant additionally strips the
//! noise DBMS drivers add around the statement text. Both functions are
//! idempotent: a normalized text passes through unchanged.

use std::hash::Hasher;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use siphasher::sip::SipHasher24;

static GUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});

// Six digits and up: session counters, connection ids, record numbers.
// Shorter runs (ports, error codes) are part of the error identity.
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{6,}").unwrap());

static COMPUTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(computer|компьютер):\s*[^,]+,").unwrap());

static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(user|пользователь):\s*[^,]+,").unwrap());

// MS SQL wraps ad-hoc statements: EXEC sp_executesql N'<query>', N'@p1 ...', @p1=...
// Only the inner query identifies the error.
static EXEC_SQL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)EXEC\s+sp_executesql\s+N'((?:[^']|'')*)'.*").unwrap());

static TEMP_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#tt\d+").unwrap());

static PG_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+").unwrap());

/// Replace dynamic fragments of an error text with stable placeholders.
pub fn normalize_error_text(text: &str) -> String {
    let text = COMPUTER_RE.replace_all(text, "${1}: <COMPUTER>,");
    let text = USER_RE.replace_all(&text, "${1}: <USER>,");
    let text = GUID_RE.replace_all(&text, "<GUID>");
    let text = TIMESTAMP_RE.replace_all(&text, "<TIMESTAMP>");
    let text = NUMBER_RE.replace_all(&text, "<NUMBER>");
    text.into_owned()
}

/// SQL-aware normalization: unwrap `sp_executesql`, collapse temporary table
/// names and positional parameters, then apply the general rules.
pub fn normalize_sql_text(text: &str) -> String {
    let text = match EXEC_SQL_RE.captures(text) {
        Some(caps) => caps[1].replace("''", "'"),
        None => text.to_owned(),
    };
    let text = TEMP_TABLE_RE.replace_all(&text, "#tt");
    let text = PG_PARAM_RE.replace_all(&text, NoExpand("$<NUMBER>"));
    normalize_error_text(&text)
}

/// 64-bit SipHash signature of a normalized error, used as the aggregation
/// key in `mv_new_errors`.
pub fn error_signature(name: &str, descr: &str, normalized_text: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(name.as_bytes());
    hasher.write(b"\x1f");
    hasher.write(descr.as_bytes());
    hasher.write(b"\x1f");
    hasher.write(normalized_text.as_bytes());
    hasher.finish()
}
