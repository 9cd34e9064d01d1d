use serde::{Deserialize, Serialize};

use crate::pki::model::{CertificateRecord, CrlState, PkiDirectory, SigningRequest};

/// Machine-readable reason attached to every failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolNotFound,
    PermissionDenied,
    AlreadyInitialized,
    NotInitialized,
    CaAlreadyExists,
    CaNotBuilt,
    InvalidTemplate,
    DuplicateName,
    InvalidInput,
    RequestAlreadyConsumed,
    InvalidRequestFile,
    NotFound,
    AlreadyRevoked,
    UnexpectedOutput,
    Cancelled,
    Timeout,
    Busy,
    ToolError,
}

impl FailureKind {
    /// Short text for the in-content status area of a small display.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::ToolNotFound => "Easy-RSA is not installed",
            FailureKind::PermissionDenied => "Permission denied on PKI directory",
            FailureKind::AlreadyInitialized => "PKI is already initialized",
            FailureKind::NotInitialized => "PKI is not initialized yet",
            FailureKind::CaAlreadyExists => "A CA already exists",
            FailureKind::CaNotBuilt => "Build the CA first",
            FailureKind::InvalidTemplate => "Template is missing or invalid",
            FailureKind::DuplicateName => "That name is already in use",
            FailureKind::InvalidInput => "Invalid name or input",
            FailureKind::RequestAlreadyConsumed => "Request was already signed",
            FailureKind::InvalidRequestFile => "Request file is not valid",
            FailureKind::NotFound => "Certificate not found",
            FailureKind::AlreadyRevoked => "Certificate is already revoked",
            FailureKind::UnexpectedOutput => "Easy-RSA gave an unexpected result",
            FailureKind::Cancelled => "Operation cancelled",
            FailureKind::Timeout => "Operation timed out",
            FailureKind::Busy => "Another operation is running",
            FailureKind::ToolError => "Easy-RSA reported an error",
        }
    }

    /// Process exit code used by the command line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::InvalidInput | FailureKind::InvalidTemplate | FailureKind::InvalidRequestFile => 2,
            FailureKind::NotFound => 5,
            FailureKind::Timeout => 124,
            FailureKind::PermissionDenied => 126,
            FailureKind::ToolNotFound => 127,
            FailureKind::Cancelled => 130,
            _ => 1,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // snake_case name, same as the serialized form
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Which orchestrator operation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InitPki,
    BuildCa,
    IssueCertificate,
    ImportRequest,
    SignRequest,
    RevokeCertificate,
    GenerateCrl,
}

impl OperationKind {
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::InitPki => "init",
            OperationKind::BuildCa => "build-ca",
            OperationKind::IssueCertificate => "issue",
            OperationKind::ImportRequest => "import",
            OperationKind::SignRequest => "sign",
            OperationKind::RevokeCertificate => "revoke",
            OperationKind::GenerateCrl => "gen-crl",
        }
    }
}

/// Entities touched by an operation, as they look after the closing reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum AffectedEntity {
    Directory(PkiDirectory),
    Certificate(CertificateRecord),
    Request(SigningRequest),
    Crl(CrlState),
}

/// Summary of the external tool call behind an operation, secrets redacted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub command: Vec<String>,
    pub env: std::collections::BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub timeout_ms: u64,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Uniform return value of every orchestrator operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: OperationKind,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    pub detail: String,
    pub affected: Vec<AffectedEntity>,
    pub invocations: Vec<Invocation>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl OperationResult {
    pub fn success(operation: OperationKind, detail: impl Into<String>) -> Self {
        Self {
            operation,
            outcome: Outcome::Success,
            kind: None,
            detail: detail.into(),
            affected: Vec::new(),
            invocations: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failure(operation: OperationKind, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            operation,
            outcome: Outcome::Failure,
            kind: Some(kind),
            detail: detail.into(),
            affected: Vec::new(),
            invocations: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Message safe to show on the device. Raw tool detail stays in the log.
    pub fn user_message(&self) -> String {
        match self.kind {
            Some(kind) => kind.user_message().to_string(),
            None => match self.operation {
                OperationKind::InitPki => "PKI initialized".to_string(),
                OperationKind::BuildCa => "CA created".to_string(),
                OperationKind::IssueCertificate => "Certificate created".to_string(),
                OperationKind::ImportRequest => "Request imported".to_string(),
                OperationKind::SignRequest => "Request signed".to_string(),
                OperationKind::RevokeCertificate => "Certificate revoked".to_string(),
                OperationKind::GenerateCrl => "CRL updated".to_string(),
            },
        }
    }

    /// Newly created or updated certificate, if the operation produced one.
    pub fn certificate(&self) -> Option<&CertificateRecord> {
        self.affected.iter().find_map(|e| match e {
            AffectedEntity::Certificate(record) => Some(record),
            _ => None,
        })
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.map(|k| k.exit_code()).unwrap_or(0)
    }
}
