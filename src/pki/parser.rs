//! Classification of Easy-RSA output.
//!
//! Success is judged by exit code first, then confirmed by a per-operation
//! marker. Non-zero exits are refined into a `FailureKind` by matching
//! well-known phrases. The phrases are best effort: Easy-RSA reworded most
//! of them between 3.0 and 3.1, so the orchestrator always checks the disk
//! afterwards and treats that check as the final word.

use log::debug;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::backends::{RunOutcome, RunStatus};
use crate::core::status::FailureKind;

use super::model::CertificateType;

/// Easy-RSA subcommands driven by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOperation {
    InitPki,
    BuildCa,
    BuildFull(CertificateType),
    ImportReq,
    SignReq,
    Revoke,
    GenCrl,
}

impl ToolOperation {
    pub fn subcommand(&self) -> &'static str {
        match self {
            ToolOperation::InitPki => "init-pki",
            ToolOperation::BuildCa => "build-ca",
            ToolOperation::BuildFull(cert_type) => cert_type.build_full_command(),
            ToolOperation::ImportReq => "import-req",
            ToolOperation::SignReq => "sign-req",
            ToolOperation::Revoke => "revoke",
            ToolOperation::GenCrl => "gen-crl",
        }
    }

    /// Lower-case phrase present in every successful run of the subcommand.
    pub fn success_marker(&self) -> &'static str {
        match self {
            ToolOperation::InitPki => "init-pki complete",
            ToolOperation::BuildCa => "ca creation complete",
            ToolOperation::BuildFull(_) | ToolOperation::SignReq => "certificate created at",
            ToolOperation::ImportReq => "successfully imported",
            ToolOperation::Revoke => "revocation was successful",
            ToolOperation::GenCrl => "updated crl has been created",
        }
    }
}

/// Structured data pulled out of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub paths: Vec<PathBuf>,
    pub serial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Confirmed(Extracted),
    Failed { kind: FailureKind, detail: String },
}

impl Verdict {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Verdict::Confirmed(_) => None,
            Verdict::Failed { kind, .. } => Some(*kind),
        }
    }
}

const MISSING_PKI: &[&str] = &["init-pki", "pki does not exist", "no pki", "missing pki"];
const MISSING_CA: &[&str] = &[
    "unable to find ca",
    "missing ca",
    "ca certificate",
    "ca.crt",
    "run build-ca",
];
const VARS_PROBLEMS: &[&str] = &["vars file", "vars-file", "easyrsa_vars_file", "cannot find vars"];
const BAD_REQUEST: &[&str] = &[
    "does not appear to be",
    "not a valid",
    "not in a valid",
    "unable to load",
    "no such file",
    "no request found",
];

pub fn parse(op: ToolOperation, outcome: &RunOutcome) -> Verdict {
    let verdict = match &outcome.status {
        RunStatus::ToolNotFound => Verdict::Failed {
            kind: FailureKind::ToolNotFound,
            detail: outcome.stderr.clone(),
        },
        RunStatus::SpawnFailed { permission_denied, message } => Verdict::Failed {
            kind: if *permission_denied {
                FailureKind::PermissionDenied
            } else {
                FailureKind::ToolError
            },
            detail: message.clone(),
        },
        RunStatus::TimedOut => Verdict::Failed {
            kind: FailureKind::Timeout,
            detail: format!("{} timed out after {}ms", op.subcommand(), outcome.duration_ms),
        },
        RunStatus::Cancelled => Verdict::Failed {
            kind: FailureKind::Cancelled,
            detail: format!("{} cancelled", op.subcommand()),
        },
        RunStatus::Signaled => Verdict::Failed {
            kind: FailureKind::ToolError,
            detail: format!("{} terminated by a signal", op.subcommand()),
        },
        RunStatus::Exited(0) => {
            let output = outcome.combined_output();
            if output.to_lowercase().contains(op.success_marker()) {
                Verdict::Confirmed(extract(&output))
            } else {
                Verdict::Failed {
                    kind: FailureKind::UnexpectedOutput,
                    detail: format!(
                        "{} exited 0 without confirming: {}",
                        op.subcommand(),
                        summarize_error(&output)
                    ),
                }
            }
        }
        RunStatus::Exited(code) => {
            let output = outcome.combined_output();
            let detail_source = if outcome.stderr.trim().is_empty() {
                output.as_str()
            } else {
                outcome.stderr.as_str()
            };
            Verdict::Failed {
                kind: classify_failure(op, &output),
                detail: format!("exit {}: {}", code, summarize_error(detail_source)),
            }
        }
    };
    debug!("{} -> {:?}", op.subcommand(), verdict.failure_kind());
    verdict
}

/// Map the text of a failed run to a failure kind.
pub fn classify_failure(op: ToolOperation, output: &str) -> FailureKind {
    let text = output.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["permission denied", "operation not permitted"]) {
        return FailureKind::PermissionDenied;
    }

    match op {
        ToolOperation::InitPki => {
            if has(&["already exists", "already initialised", "already initialized"]) {
                FailureKind::AlreadyInitialized
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::BuildCa => {
            if has(&["already seem to have", "already exists"]) {
                FailureKind::CaAlreadyExists
            } else if has(VARS_PROBLEMS) {
                FailureKind::InvalidTemplate
            } else if has(MISSING_PKI) {
                FailureKind::NotInitialized
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::BuildFull(_) => {
            if has(&["already exists"]) {
                FailureKind::DuplicateName
            } else if has(VARS_PROBLEMS) {
                FailureKind::InvalidTemplate
            } else if has(MISSING_CA) || has(MISSING_PKI) {
                FailureKind::CaNotBuilt
            } else if has(&["invalid", "illegal"]) {
                FailureKind::InvalidInput
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::ImportReq => {
            if has(&["already exists"]) {
                FailureKind::DuplicateName
            } else if has(BAD_REQUEST) {
                FailureKind::InvalidRequestFile
            } else if has(MISSING_PKI) {
                FailureKind::NotInitialized
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::SignReq => {
            if has(&["already exists", "already signed"]) {
                FailureKind::RequestAlreadyConsumed
            } else if has(BAD_REQUEST) {
                FailureKind::InvalidRequestFile
            } else if has(MISSING_CA) {
                FailureKind::CaNotBuilt
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::Revoke => {
            if has(&["already revoked"]) {
                FailureKind::AlreadyRevoked
            } else if has(&["no certificate was found", "unable to revoke as no", "not found"]) {
                FailureKind::NotFound
            } else if has(MISSING_CA) {
                FailureKind::CaNotBuilt
            } else {
                FailureKind::ToolError
            }
        }
        ToolOperation::GenCrl => {
            if has(MISSING_CA) {
                FailureKind::CaNotBuilt
            } else {
                FailureKind::ToolError
            }
        }
    }
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(/[^\s'"*:]+\.(?:crt|key|req|pem))"#).expect("valid regex"))
}

fn serial_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:revoking certificate|serial[- ]number)\s*:?\s*([0-9a-f]{2,})").expect("valid regex")
    })
}

/// File paths and serial numbers mentioned in tool output.
pub fn extract(output: &str) -> Extracted {
    let mut paths: Vec<PathBuf> = Vec::new();
    for capture in path_pattern().captures_iter(output) {
        let path = PathBuf::from(&capture[1]);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    let serial = serial_pattern()
        .captures(output)
        .map(|c| c[1].to_uppercase());

    Extracted { paths, serial }
}

/// First few error-looking lines of tool output, for logs and details.
pub fn summarize_error(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return "Unknown error occurred".to_string();
    }

    let errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| !l.starts_with('[') && !l.starts_with('*'))
        .filter(|l| {
            let lower = l.to_lowercase();
            lower.contains("error") || lower.contains("failed")
        })
        .take(3)
        .collect();

    if errors.is_empty() {
        lines.into_iter().take(3).collect::<Vec<_>>().join("\n")
    } else {
        errors.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32, stdout: &str, stderr: &str) -> RunOutcome {
        RunOutcome {
            status: RunStatus::Exited(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            command: vec!["easyrsa".to_string()],
            duration_ms: 5,
        }
    }

    fn with_status(status: RunStatus) -> RunOutcome {
        RunOutcome {
            status,
            stdout: String::new(),
            stderr: String::new(),
            command: vec!["easyrsa".to_string()],
            duration_ms: 30000,
        }
    }

    #[test]
    fn test_build_full_success_extracts_paths() {
        let stdout = "Using SSL: openssl OpenSSL 3.0.2\n\
Certificate created at: /home/pi/easy-rsa-pki/issued/server01.crt\n";
        match parse(ToolOperation::BuildFull(CertificateType::Server), &exited(0, stdout, "")) {
            Verdict::Confirmed(extracted) => {
                assert_eq!(extracted.paths, vec![PathBuf::from("/home/pi/easy-rsa-pki/issued/server01.crt")]);
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_easyrsa_31_wording_is_confirmed() {
        let stdout = "Notice\n------\nCA creation complete. Your new CA certificate is at:\n* /srv/pki/ca.crt\n";
        let verdict = parse(ToolOperation::BuildCa, &exited(0, stdout, ""));
        assert_eq!(
            verdict,
            Verdict::Confirmed(Extracted {
                paths: vec![PathBuf::from("/srv/pki/ca.crt")],
                serial: None
            })
        );
    }

    #[test]
    fn test_exit_zero_without_marker_is_unexpected() {
        let verdict = parse(ToolOperation::GenCrl, &exited(0, "Using SSL: openssl\n", ""));
        assert_eq!(verdict.failure_kind(), Some(FailureKind::UnexpectedOutput));
    }

    #[test]
    fn test_revoke_serial_extraction() {
        let stdout = "Revoking Certificate 5E3A0C1B.\nData Base Updated\n\nIMPORTANT!!!\n\nRevocation was successful. You must run gen-crl";
        match parse(ToolOperation::Revoke, &exited(0, stdout, "")) {
            Verdict::Confirmed(extracted) => assert_eq!(extracted.serial.as_deref(), Some("5E3A0C1B")),
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_failure_classification() {
        let cases = [
            (ToolOperation::BuildCa, "Easy-RSA error:\n\nUnable to create a CA as you already seem to have one set up.", FailureKind::CaAlreadyExists),
            (ToolOperation::BuildCa, "EASYRSA_PKI does not exist (perhaps you need to run init-pki)?", FailureKind::NotInitialized),
            (ToolOperation::BuildFull(CertificateType::Client), "Request file already exists. Aborting build to avoid overwriting this file.", FailureKind::DuplicateName),
            (ToolOperation::BuildFull(CertificateType::Server), "Easy-RSA error:\nMissing CA: run build-ca first", FailureKind::CaNotBuilt),
            (ToolOperation::ImportReq, "The input file does not appear to be a certificate request.", FailureKind::InvalidRequestFile),
            (ToolOperation::SignReq, "No request found for the input: 'laptop'", FailureKind::InvalidRequestFile),
            (ToolOperation::Revoke, "ERROR:Already revoked, serial number 0A", FailureKind::AlreadyRevoked),
            (ToolOperation::Revoke, "Unable to revoke as no certificate was found.", FailureKind::NotFound),
            (ToolOperation::InitPki, "mkdir: cannot create directory '/srv/pki': Permission denied", FailureKind::PermissionDenied),
            (ToolOperation::GenCrl, "openssl: something odd", FailureKind::ToolError),
        ];

        for (op, stderr, expected) in cases {
            let verdict = parse(op, &exited(1, "", stderr));
            assert_eq!(verdict.failure_kind(), Some(expected), "{:?}: {}", op, stderr);
        }
    }

    #[test]
    fn test_run_statuses_map_to_kinds() {
        assert_eq!(
            parse(ToolOperation::BuildCa, &with_status(RunStatus::TimedOut)).failure_kind(),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            parse(ToolOperation::BuildCa, &with_status(RunStatus::Cancelled)).failure_kind(),
            Some(FailureKind::Cancelled)
        );
        assert_eq!(
            parse(ToolOperation::InitPki, &with_status(RunStatus::ToolNotFound)).failure_kind(),
            Some(FailureKind::ToolNotFound)
        );
        let denied = RunStatus::SpawnFailed {
            permission_denied: true,
            message: "EACCES".to_string(),
        };
        assert_eq!(
            parse(ToolOperation::InitPki, &with_status(denied)).failure_kind(),
            Some(FailureKind::PermissionDenied)
        );
    }

    #[test]
    fn test_summarize_error() {
        let stderr = "[debug] loading vars\n\nEasy-RSA error:\n\nsomething failed badly\nextra\nmore\n";
        assert_eq!(summarize_error(stderr), "Easy-RSA error:\nsomething failed badly");
        assert_eq!(summarize_error("a\nb\nc\nd"), "a\nb\nc");
        assert_eq!(summarize_error("  \n"), "Unknown error occurred");
    }
}
