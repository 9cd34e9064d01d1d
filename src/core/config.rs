//! Runtime settings.
//!
//! Settings come from a JSON file; every key is optional and falls back to
//! the defaults below. The default location is
//! `$XDG_CONFIG_HOME/pocketca/settings.json`.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::status::OperationKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Per-operation timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub init_pki_ms: u64,
    pub build_ca_ms: u64,
    pub issue_ms: u64,
    pub import_req_ms: u64,
    pub sign_req_ms: u64,
    pub revoke_ms: u64,
    pub gen_crl_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_pki_ms: 30_000,
            build_ca_ms: 120_000,
            issue_ms: 120_000,
            import_req_ms: 30_000,
            sign_req_ms: 60_000,
            revoke_ms: 30_000,
            gen_crl_ms: 30_000,
        }
    }
}

impl Timeouts {
    pub fn for_operation(&self, operation: OperationKind) -> Duration {
        let ms = match operation {
            OperationKind::InitPki => self.init_pki_ms,
            OperationKind::BuildCa => self.build_ca_ms,
            OperationKind::IssueCertificate => self.issue_ms,
            OperationKind::ImportRequest => self.import_req_ms,
            OperationKind::SignRequest => self.sign_req_ms,
            OperationKind::RevokeCertificate => self.revoke_ms,
            OperationKind::GenerateCrl => self.gen_crl_ms,
        };
        Duration::from_millis(ms)
    }

    fn entries(&self) -> [(&'static str, u64); 7] {
        [
            ("timeouts.init_pki_ms", self.init_pki_ms),
            ("timeouts.build_ca_ms", self.build_ca_ms),
            ("timeouts.issue_ms", self.issue_ms),
            ("timeouts.import_req_ms", self.import_req_ms),
            ("timeouts.sign_req_ms", self.sign_req_ms),
            ("timeouts.revoke_ms", self.revoke_ms),
            ("timeouts.gen_crl_ms", self.gen_crl_ms),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pki_dir: PathBuf,
    pub easyrsa_bin: PathBuf,
    pub template_dir: PathBuf,
    /// Working directory for Easy-RSA; defaults to the binary's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub log_level: String,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pki_dir: PathBuf::from("/home/pi/easy-rsa-pki"),
            easyrsa_bin: PathBuf::from("/usr/share/easy-rsa/easyrsa"),
            template_dir: PathBuf::from("templates/vars"),
            working_dir: None,
            log_level: "info".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Settings {
    /// `$XDG_CONFIG_HOME/pocketca/settings.json`, or `./pocketca/settings.json`
    /// where there is no config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pocketca")
            .join("settings.json")
    }

    /// Load from `path`, which must exist, or from the default location,
    /// which may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Self::default_path();
                if default.is_file() {
                    Self::from_file(&default)?
                } else {
                    debug!("no settings at {}, using defaults", default.display());
                    Self::default()
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in self.timeouts.entries() {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.pki_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "pki_dir".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.easyrsa_bin.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "easyrsa_bin".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Directory Easy-RSA runs in.
    pub fn effective_working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        match self.easyrsa_bin.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}
