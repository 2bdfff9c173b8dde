//! Query fingerprinting and class-id checksums.
//!
//! A fingerprint is the structural shape of a statement: literals become `?`,
//! comments and redundant whitespace disappear, value lists collapse. Every
//! statement with the same fingerprint belongs to the same query class.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure of a single fingerprint attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("empty query")]
    Empty,
    #[error("fingerprint task crashed")]
    Crashed,
}

#[allow(clippy::expect_used)]
fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid fingerprint regex")
}

static MYSQLDUMP: Lazy<Regex> = Lazy::new(|| re(r"\ASELECT /\*!40001 SQL_NO_CACHE \*/ \* FROM `"));
static ADMIN: Lazy<Regex> = Lazy::new(|| re(r"\Aadministrator command: "));
static CALL: Lazy<Regex> = Lazy::new(|| re(r"(?i)\A\s*(call\s+\S+)\("));
static MULTI_INSERT: Lazy<Regex> = Lazy::new(|| {
    re(r"(?is)\A((?:INSERT|REPLACE)(?:\s+IGNORE)?\s+INTO.+?VALUES\s*\(.*?\))\s*,\s*\(")
});
static MULTI_LINE_COMMENT: Lazy<Regex> = Lazy::new(|| re(r"(?s)/\*[^!].*?\*/"));
static ONE_LINE_COMMENT: Lazy<Regex> = Lazy::new(|| re(r#"(?m)(?:--|#)[^'"\r\n]*$"#));
static USE_DB: Lazy<Regex> = Lazy::new(|| re(r"(?i)\A\s*use\s+\S+\s*\z"));
static ESCAPED_QUOTE: Lazy<Regex> = Lazy::new(|| re(r#"\\["']"#));
static DOUBLE_QUOTED: Lazy<Regex> = Lazy::new(|| re(r#"(?s)".*?""#));
static SINGLE_QUOTED: Lazy<Regex> = Lazy::new(|| re(r"(?s)'.*?'"));
static BOOLEAN: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:false|true)\b"));
static NUMBER: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b[0-9+-][0-9a-f.xb+-]*"));
static NUMBER_PREFIX: Lazy<Regex> = Lazy::new(|| re(r"(?i)[xb.+-]\?"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| re(r"[ \n\t\r\x0C]+"));
static NULL: Lazy<Regex> = Lazy::new(|| re(r"\bnull\b"));
static VALUE_LIST: Lazy<Regex> = Lazy::new(|| re(r"\b(in|values?)(?:[\s,]*\([\s?,]*\))+"));
static LIMIT: Lazy<Regex> = Lazy::new(|| re(r"\blimit \?(?:, ?\?| offset \?)?"));
static ASC: Lazy<Regex> = Lazy::new(|| re(r"\s+asc\b"));

/// Fingerprint a statement.
///
/// # Errors
///
/// Returns `FingerprintError::Empty` if nothing but whitespace or comments remains.
pub fn fingerprint(query: &str) -> Result<String, FingerprintError> {
    if MYSQLDUMP.is_match(query) {
        return Ok("mysqldump".to_string());
    }
    if ADMIN.is_match(query) {
        return Ok(query.to_string());
    }
    if let Some(caps) = CALL.captures(query)
        && let Some(call) = caps.get(1)
    {
        return Ok(call.as_str().to_lowercase());
    }

    let mut q = query.to_string();
    if let Some(first_row) = MULTI_INSERT
        .captures(&q)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
    {
        q = first_row;
    }

    q = MULTI_LINE_COMMENT.replace_all(&q, "").into_owned();
    q = ONE_LINE_COMMENT.replace_all(&q, "").into_owned();

    if USE_DB.is_match(&q) {
        return Ok("use ?".to_string());
    }

    q = ESCAPED_QUOTE.replace_all(&q, "").into_owned();
    q = DOUBLE_QUOTED.replace_all(&q, "?").into_owned();
    q = SINGLE_QUOTED.replace_all(&q, "?").into_owned();
    q = BOOLEAN.replace_all(&q, "?").into_owned();
    q = NUMBER.replace_all(&q, "?").into_owned();
    q = NUMBER_PREFIX.replace_all(&q, "?").into_owned();
    q = WHITESPACE.replace_all(q.trim(), " ").to_lowercase();

    if q.is_empty() {
        return Err(FingerprintError::Empty);
    }

    q = NULL.replace_all(&q, "?").into_owned();
    q = VALUE_LIST.replace_all(&q, "${1}(?+)").into_owned();
    q = LIMIT.replace(&q, "limit ?").into_owned();

    if let Some(pos) = q.find("order by ") {
        let (head, tail) = q.split_at(pos);
        q = format!("{head}{}", ASC.replace_all(tail, ""));
    }

    Ok(q)
}

/// Class id of a fingerprint: 16 upper-case hex characters of its SHA-256.
#[must_use]
pub fn id(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    digest
        .as_slice()
        .get(8..16)
        .map(hex::encode_upper)
        .unwrap_or_default()
}
