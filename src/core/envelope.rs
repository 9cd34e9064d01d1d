use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use super::status::{FailureKind, OperationResult};

const REDACTED: &str = "***REDACTED***";

/// JSON envelope printed by every command line verb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    pub verb: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub ts: String,
    pub duration_ms: u64,
    pub backend: BackendInfo,
    /// Short message for the device display.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

/// Which runner produced the result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub simulated: bool,
}

impl BackendInfo {
    pub fn new(id: &str, simulated: bool) -> Self {
        Self {
            id: id.to_string(),
            simulated,
        }
    }
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub kind: FailureKind,
    pub message: String,
    pub detail: String,
}

impl Envelope {
    /// Wrap the result of a mutating operation.
    pub fn from_operation(result: &OperationResult, target: Option<&str>, backend: BackendInfo) -> Result<Self> {
        let error = result.kind.map(|kind| EnvelopeError {
            kind,
            message: kind.user_message().to_string(),
            detail: result.detail.clone(),
        });
        Ok(Self {
            ok: result.is_success(),
            verb: result.operation.verb().to_string(),
            target: target.map(str::to_string),
            ts: Utc::now().to_rfc3339(),
            duration_ms: result.duration_ms,
            backend,
            message: result.user_message(),
            result: Some(serde_json::to_value(result)?),
            warnings: result.warnings.clone(),
            error,
        })
    }

    /// Wrap the answer to a read-only query.
    pub fn query(verb: &str, value: serde_json::Value, backend: BackendInfo, duration_ms: u64) -> Self {
        Self {
            ok: true,
            verb: verb.to_string(),
            target: None,
            ts: Utc::now().to_rfc3339(),
            duration_ms,
            backend,
            message: String::new(),
            result: Some(value),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Envelope for a request that never reached an operation.
    pub fn rejected(verb: &str, kind: FailureKind, detail: &str, backend: BackendInfo) -> Self {
        Self {
            ok: false,
            verb: verb.to_string(),
            target: None,
            ts: Utc::now().to_rfc3339(),
            duration_ms: 0,
            backend,
            message: kind.user_message().to_string(),
            result: None,
            warnings: Vec::new(),
            error: Some(EnvelopeError {
                kind,
                message: kind.user_message().to_string(),
                detail: detail.to_string(),
            }),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map(|e| e.kind.exit_code()).unwrap_or(0)
    }

    /// Serialize to JSON (pretty or compact)
    pub fn to_json(&self, pretty: bool) -> Result<String> {
        if pretty {
            serde_json::to_string_pretty(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        } else {
            serde_json::to_string(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        }
    }
}

/// Redact passphrase arguments (`--passin=pass:x`, `--passout pass:x`).
pub fn redact_command_args(command: &[String]) -> Vec<String> {
    let sensitive_flags = ["--passin", "--passout", "--password", "--passphrase"];

    let mut redacted = Vec::with_capacity(command.len());
    let mut redact_next = false;
    for arg in command {
        if redact_next {
            redacted.push(REDACTED.to_string());
            redact_next = false;
        } else if let Some(flag) = sensitive_flags.iter().find(|&&flag| arg.starts_with(flag)) {
            if arg.contains('=') {
                redacted.push(format!("{}={}", flag, REDACTED));
            } else {
                redacted.push(arg.clone());
                redact_next = true;
            }
        } else {
            redacted.push(arg.clone());
        }
    }
    redacted
}

/// Redact environment values that may carry passphrases.
pub fn redact_env_vars(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let sensitive_keys = ["PASSIN", "PASSOUT", "PASSWORD", "PASSPHRASE", "SECRET", "TOKEN"];

    env.iter()
        .map(|(key, value)| {
            let upper = key.to_uppercase();
            if sensitive_keys.iter().any(|s| upper.contains(s)) {
                (key.clone(), REDACTED.to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
