use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::index::{inspect_certificate_file, read_index, IndexEntry};
use super::model::{
    CaStatus, CertificateCounts, CertificateRecord, CertificateStatus, CertificateType, CrlState, PkiDirectory,
    PkiLayout, SigningRequest,
};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// In-memory picture of one PKI directory.
///
/// Rebuilt from disk by [`PkiState::reload`]; the only other mutation is
/// [`PkiState::note_type`], a cache hint for certificate types the
/// directory cannot tell us, which the next reload confirms or overrides.
#[derive(Debug, Clone)]
pub struct PkiState {
    layout: PkiLayout,
    directory: PkiDirectory,
    certificates: Vec<CertificateRecord>,
    requests: Vec<SigningRequest>,
    crl: CrlState,
    type_hints: HashMap<String, CertificateType>,
}

// Type hints are not part of the observable state.
impl PartialEq for PkiState {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout
            && self.directory == other.directory
            && self.certificates == other.certificates
            && self.requests == other.requests
            && self.crl == other.crl
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

impl PkiState {
    /// Empty model; call [`PkiState::reload`] to populate it.
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        let layout = PkiLayout::new(pki_dir);
        Self {
            directory: PkiDirectory {
                path: layout.root().to_path_buf(),
                initialized: false,
                ca_present: false,
            },
            crl: CrlState {
                path: layout.crl(),
                generated_at: None,
                revoked_serials: Vec::new(),
            },
            layout,
            certificates: Vec::new(),
            requests: Vec::new(),
            type_hints: HashMap::new(),
        }
    }

    /// Build and load in one step.
    pub fn load(pki_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let mut state = Self::new(pki_dir);
        state.reload()?;
        Ok(state)
    }

    /// Rescan the directory and rebuild every collection from ground truth.
    ///
    /// On error the model is left describing the directory flags only, with
    /// empty collections, so it never reports entities it could not read.
    pub fn reload(&mut self) -> Result<(), StateError> {
        self.directory = self.layout.directory();

        let result = self.scan();
        if result.is_err() {
            self.certificates.clear();
            self.requests.clear();
            self.crl.revoked_serials.clear();
            self.crl.generated_at = None;
        }
        result
    }

    fn scan(&mut self) -> Result<(), StateError> {
        let entries = if self.directory.initialized {
            read_index(&self.layout.index())?
        } else {
            Vec::new()
        };

        let mut revoked_serials: Vec<String> = entries
            .iter()
            .filter(|e| e.status == CertificateStatus::Revoked)
            .map(|e| e.serial.clone())
            .collect();
        revoked_serials.sort();
        revoked_serials.dedup();

        self.certificates = self.build_records(&entries);
        self.requests = self.scan_requests()?;
        self.crl = CrlState {
            path: self.layout.crl(),
            generated_at: modified_at(&self.layout.crl()),
            revoked_serials,
        };

        debug!(
            "reloaded {}: {:?}, {} certificates, {} requests",
            self.layout.root().display(),
            self.ca_status(),
            self.certificates.len(),
            self.requests.len()
        );
        Ok(())
    }

    fn build_records(&self, entries: &[IndexEntry]) -> Vec<CertificateRecord> {
        // Keep index order, then collapse to the latest entry per common name.
        let mut latest: Vec<(usize, CertificateRecord)> = Vec::new();
        for (position, entry) in entries.iter().enumerate() {
            let record = self.record_for(entry);
            if let Some(slot) = latest.iter_mut().find(|(_, r)| r.common_name == record.common_name) {
                debug!(
                    "index holds several entries for {}; keeping serial {}",
                    record.common_name, record.serial
                );
                *slot = (position, record);
            } else {
                latest.push((position, record));
            }
        }

        // Undated records first, then by issue time; index position breaks ties.
        latest.sort_by_key(|(position, record)| (record.issued_at, *position));
        latest.into_iter().map(|(_, record)| record).collect()
    }

    fn record_for(&self, entry: &IndexEntry) -> CertificateRecord {
        let issued = self.layout.issued_cert(&entry.common_name);
        let revoked = self.layout.revoked_cert(&entry.serial);
        let cert_path = match entry.status {
            CertificateStatus::Revoked if revoked.is_file() => Some(revoked),
            _ if issued.is_file() => Some(issued),
            _ => None,
        };

        let facts = cert_path.as_deref().map(inspect_certificate_file).unwrap_or_default();
        let cert_type = facts
            .cert_type
            .or_else(|| self.type_hints.get(&entry.common_name).copied())
            .unwrap_or(CertificateType::Client);
        let issued_at = facts
            .not_before
            .or_else(|| cert_path.as_deref().and_then(modified_at));

        CertificateRecord {
            common_name: entry.common_name.clone(),
            cert_type,
            status: entry.status,
            serial: entry.serial.clone(),
            issued_at,
            expires_at: entry.expires_at,
            revoked_at: entry.revoked_at,
            revocation_reason: entry.revocation_reason,
            cert_path,
        }
    }

    fn scan_requests(&self) -> Result<Vec<SigningRequest>, StateError> {
        let reqs_dir = self.layout.reqs_dir();
        let listing = match fs::read_dir(&reqs_dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::List {
                    path: reqs_dir,
                    source: e,
                })
            }
        };

        let mut requests = Vec::new();
        for item in listing {
            let item = item.map_err(|e| StateError::List {
                path: reqs_dir.clone(),
                source: e,
            })?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("req") || !path.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                warn!("ignoring request with non UTF-8 name: {}", path.display());
                continue;
            };
            let consumed = self.layout.issued_cert(&name).is_file()
                || self.certificates.iter().any(|c| c.common_name == name);
            requests.push(SigningRequest { name, path, consumed });
        }
        requests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(requests)
    }

    /// Remember the type an operation asked for until the next reload
    /// can read it from the certificate itself.
    pub fn note_type(&mut self, common_name: &str, cert_type: CertificateType) {
        self.type_hints.insert(common_name.to_string(), cert_type);
    }

    pub fn layout(&self) -> &PkiLayout {
        &self.layout
    }

    pub fn directory(&self) -> &PkiDirectory {
        &self.directory
    }

    pub fn ca_status(&self) -> CaStatus {
        CaStatus::of(&self.directory)
    }

    pub fn find(&self, common_name: &str) -> Option<&CertificateRecord> {
        self.certificates.iter().find(|c| c.common_name == common_name)
    }

    /// Ordered by issue time, most recent last.
    pub fn certificates(&self) -> &[CertificateRecord] {
        &self.certificates
    }

    pub fn requests(&self) -> &[SigningRequest] {
        &self.requests
    }

    pub fn request(&self, name: &str) -> Option<&SigningRequest> {
        self.requests.iter().find(|r| r.name == name)
    }

    pub fn pending_requests(&self) -> Vec<SigningRequest> {
        self.requests.iter().filter(|r| !r.consumed).cloned().collect()
    }

    pub fn crl(&self) -> &CrlState {
        &self.crl
    }

    pub fn counts(&self) -> CertificateCounts {
        let mut counts = CertificateCounts {
            total: self.certificates.len(),
            ..Default::default()
        };
        for record in &self.certificates {
            match record.status {
                CertificateStatus::Valid => counts.valid += 1,
                CertificateStatus::Revoked => counts.revoked += 1,
                CertificateStatus::Expired => counts.expired += 1,
            }
        }
        counts
    }

    /// True when any file Easy-RSA would create for `name` already exists.
    pub fn name_taken_on_disk(&self, name: &str) -> bool {
        self.layout.issued_cert(name).exists()
            || self.layout.private_key(name).exists()
            || self.layout.request(name).exists()
    }
}
