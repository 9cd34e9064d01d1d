//! Readers for the files Easy-RSA (through `openssl ca`) leaves in the PKI
//! directory: the `index.txt` database and the text dump that precedes the
//! PEM block of every issued certificate.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use super::model::{CertificateStatus, CertificateType, RevocationReason};
use super::state::StateError;

/// One line of `index.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub status: CertificateStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub serial: String,
    pub subject: String,
    pub common_name: String,
}

/// Parse `status \t expiry \t revocation[,reason] \t serial \t filename \t DN`.
pub fn parse_index_line(line: &str) -> Option<IndexEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }

    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 5 {
        return None;
    }

    let status = match parts[0] {
        "V" => CertificateStatus::Valid,
        "R" => CertificateStatus::Revoked,
        "E" => CertificateStatus::Expired,
        _ => return None,
    };

    let expires_at = parse_asn1_time(parts[1]);
    let (revoked_at, revocation_reason) = match parts[2].split_once(',') {
        Some((time, reason)) => (parse_asn1_time(time), reason.parse().ok()),
        None => (parse_asn1_time(parts[2]), None),
    };

    let serial = parts[3].trim().to_uppercase();
    if serial.is_empty() {
        return None;
    }

    let subject = parts.get(5).map(|s| s.trim().to_string()).unwrap_or_default();
    let common_name = extract_common_name(&subject)?;

    Some(IndexEntry {
        status,
        expires_at,
        revoked_at,
        revocation_reason,
        serial,
        subject,
        common_name,
    })
}

/// Parse a whole index, skipping (and logging) lines that do not parse.
pub fn parse_index(content: &str) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_index_line(line) {
            Some(entry) => entries.push(entry),
            None => warn!("skipping unreadable index.txt line {}: {:?}", number + 1, line),
        }
    }
    entries
}

/// Read `index.txt`; a missing file is an empty database.
pub fn read_index(path: &Path) -> Result<Vec<IndexEntry>, StateError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_index(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StateError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn slash_cn() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/CN=([^/]+)").expect("valid regex"))
}

fn comma_cn() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[,\s])CN\s*=\s*([^,/]+)").expect("valid regex"))
}

/// Common name from either `/CN=x/O=y` or `CN = x, O = y` notation.
pub fn extract_common_name(dn: &str) -> Option<String> {
    let captured = slash_cn()
        .captures(dn)
        .or_else(|| comma_cn().captures(dn))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())?;
    if captured.is_empty() {
        None
    } else {
        Some(captured)
    }
}

/// UTCTime (`YYMMDDHHMMSSZ`) or GeneralizedTime (`YYYYMMDDHHMMSSZ`).
pub fn parse_asn1_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let format = match value.len() {
        13 => "%y%m%d%H%M%SZ",
        15 => "%Y%m%d%H%M%SZ",
        _ => return None,
    };
    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Facts read from the human-readable dump `openssl ca` writes above the PEM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateText {
    pub cert_type: Option<CertificateType>,
    pub not_before: Option<DateTime<Utc>>,
}

fn not_before_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Not Before\s*:\s*([^\n]+)").expect("valid regex"))
}

pub fn inspect_certificate_text(text: &str) -> CertificateText {
    let cert_type = if text.contains("TLS Web Server Authentication") {
        Some(CertificateType::Server)
    } else if text.contains("TLS Web Client Authentication") {
        Some(CertificateType::Client)
    } else {
        None
    };

    let not_before = not_before_line()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| {
            let normalized = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT").ok()
        })
        .map(|naive| Utc.from_utc_datetime(&naive));

    CertificateText { cert_type, not_before }
}

/// Inspect a certificate file; unreadable files yield no facts.
pub fn inspect_certificate_file(path: &Path) -> CertificateText {
    match fs::read(path) {
        Ok(bytes) => inspect_certificate_text(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            debug!("cannot read {}: {}", path.display(), e);
            CertificateText::default()
        }
    }
}
