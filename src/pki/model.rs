use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root of one certificate authority's on-disk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiDirectory {
    pub path: PathBuf,
    pub initialized: bool,
    pub ca_present: bool,
}

/// Derived from directory contents, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaStatus {
    Absent,
    Initialized,
    Built,
}

impl CaStatus {
    pub fn of(directory: &PkiDirectory) -> Self {
        match (directory.initialized, directory.ca_present) {
            (false, _) => CaStatus::Absent,
            (true, false) => CaStatus::Initialized,
            (true, true) => CaStatus::Built,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    Server,
    Client,
}

impl CertificateType {
    /// Name Easy-RSA uses for the x509 type.
    pub fn as_easyrsa(&self) -> &'static str {
        match self {
            CertificateType::Server => "server",
            CertificateType::Client => "client",
        }
    }

    /// `build-*-full` subcommand for this type.
    pub fn build_full_command(&self) -> &'static str {
        match self {
            CertificateType::Server => "build-server-full",
            CertificateType::Client => "build-client-full",
        }
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_easyrsa())
    }
}

impl FromStr for CertificateType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(CertificateType::Server),
            "client" => Ok(CertificateType::Client),
            other => Err(anyhow!("unknown certificate type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Valid,
    Revoked,
    Expired,
}

/// One certificate issued by the CA, as recorded in `index.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub common_name: String,
    pub cert_type: CertificateType,
    pub status: CertificateStatus,
    pub serial: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub cert_path: Option<PathBuf>,
}

impl CertificateRecord {
    pub fn is_valid(&self) -> bool {
        self.status == CertificateStatus::Valid
    }
}

/// A certificate request waiting in `reqs/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub name: String,
    pub path: PathBuf,
    pub consumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlState {
    pub path: PathBuf,
    pub generated_at: Option<DateTime<Utc>>,
    pub revoked_serials: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateCounts {
    pub total: usize,
    pub valid: usize,
    pub revoked: usize,
    pub expired: usize,
}

/// CRL reason codes accepted by `easyrsa revoke`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "keyCompromise")]
    KeyCompromise,
    #[serde(rename = "CACompromise")]
    CaCompromise,
    #[serde(rename = "affiliationChanged")]
    AffiliationChanged,
    #[serde(rename = "superseded")]
    Superseded,
    #[serde(rename = "cessationOfOperation")]
    CessationOfOperation,
    #[serde(rename = "certificateHold")]
    CertificateHold,
}

impl RevocationReason {
    pub fn as_arg(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CaCompromise => "CACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
        }
    }
}

impl FromStr for RevocationReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace(['-', '_'], "");
        [
            RevocationReason::Unspecified,
            RevocationReason::KeyCompromise,
            RevocationReason::CaCompromise,
            RevocationReason::AffiliationChanged,
            RevocationReason::Superseded,
            RevocationReason::CessationOfOperation,
            RevocationReason::CertificateHold,
        ]
        .into_iter()
        .find(|r| r.as_arg().to_lowercase() == wanted)
        .ok_or_else(|| anyhow!("unknown revocation reason: {}", s))
    }
}

/// Standard Easy-RSA 3 file layout under a PKI directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiLayout {
    root: PathBuf,
}

impl PkiLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.root.join("ca.crt")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.private_dir().join("ca.key")
    }

    pub fn index(&self) -> PathBuf {
        self.root.join("index.txt")
    }

    pub fn crl(&self) -> PathBuf {
        self.root.join("crl.pem")
    }

    pub fn issued_dir(&self) -> PathBuf {
        self.root.join("issued")
    }

    pub fn private_dir(&self) -> PathBuf {
        self.root.join("private")
    }

    pub fn reqs_dir(&self) -> PathBuf {
        self.root.join("reqs")
    }

    pub fn revoked_certs_dir(&self) -> PathBuf {
        self.root.join("revoked").join("certs_by_serial")
    }

    pub fn issued_cert(&self, name: &str) -> PathBuf {
        self.issued_dir().join(format!("{}.crt", name))
    }

    pub fn private_key(&self, name: &str) -> PathBuf {
        self.private_dir().join(format!("{}.key", name))
    }

    pub fn request(&self, name: &str) -> PathBuf {
        self.reqs_dir().join(format!("{}.req", name))
    }

    pub fn revoked_cert(&self, serial: &str) -> PathBuf {
        self.revoked_certs_dir().join(format!("{}.crt", serial))
    }

    /// `init-pki` has run: the directory and its private/reqs subdirectories exist.
    pub fn is_initialized(&self) -> bool {
        self.root.is_dir() && self.private_dir().is_dir() && self.reqs_dir().is_dir()
    }

    /// Both halves of the CA exist; a lone `ca.crt` is a half-built CA.
    pub fn has_ca(&self) -> bool {
        self.ca_cert().is_file() && self.ca_key().is_file()
    }

    pub fn directory(&self) -> PkiDirectory {
        PkiDirectory {
            path: self.root.clone(),
            initialized: self.is_initialized(),
            ca_present: self.has_ca(),
        }
    }
}
