//! Atomic PKI operations over Easy-RSA.
//!
//! Every mutating call follows the same path: claim the directory, reload
//! and check preconditions, run the tool, classify its output, verify the
//! result on disk, reload again and report. Nothing is spawned when a
//! precondition fails, and no call returns `Err` or panics on tool failure.

use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::backends::{CancelToken, ProcessRunner, RunOutcome, RunRequest, RunStatus, StubRunner, SystemRunner};
use crate::core::config::{Settings, Timeouts};
use crate::core::envelope::{redact_command_args, redact_env_vars, Timer};
use crate::core::status::{AffectedEntity, FailureKind, Invocation, OperationKind, OperationResult};

use super::index::{read_index, IndexEntry};
use super::lock::DirectoryLock;
use super::model::{
    CaStatus, CertificateCounts, CertificateRecord, CertificateStatus, CertificateType, CrlState, PkiLayout,
    RevocationReason, SigningRequest,
};
use super::parser::{self, Extracted, ToolOperation, Verdict};
use super::state::{PkiState, StateError};
use super::templates::{TemplateProvider, VarsDirectory};
use super::validation::validate_certificate_name;

/// A mutating operation, as queued on a [`super::worker::PkiWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkiCommand {
    InitPki,
    BuildCa {
        template: Option<String>,
    },
    Issue {
        name: String,
        cert_type: CertificateType,
        template: Option<String>,
    },
    Import {
        source: PathBuf,
        name: String,
    },
    Sign {
        name: String,
        cert_type: CertificateType,
    },
    Revoke {
        name: String,
        reason: RevocationReason,
    },
    GenerateCrl,
}

impl PkiCommand {
    pub fn operation(&self) -> OperationKind {
        match self {
            PkiCommand::InitPki => OperationKind::InitPki,
            PkiCommand::BuildCa { .. } => OperationKind::BuildCa,
            PkiCommand::Issue { .. } => OperationKind::IssueCertificate,
            PkiCommand::Import { .. } => OperationKind::ImportRequest,
            PkiCommand::Sign { .. } => OperationKind::SignRequest,
            PkiCommand::Revoke { .. } => OperationKind::RevokeCertificate,
            PkiCommand::GenerateCrl => OperationKind::GenerateCrl,
        }
    }

    /// Name the command acts on, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            PkiCommand::Issue { name, .. }
            | PkiCommand::Import { name, .. }
            | PkiCommand::Sign { name, .. }
            | PkiCommand::Revoke { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn timeout_for(tool: ToolOperation) -> OperationKind {
    match tool {
        ToolOperation::InitPki => OperationKind::InitPki,
        ToolOperation::BuildCa => OperationKind::BuildCa,
        ToolOperation::BuildFull(_) => OperationKind::IssueCertificate,
        ToolOperation::ImportReq => OperationKind::ImportRequest,
        ToolOperation::SignReq => OperationKind::SignRequest,
        ToolOperation::Revoke => OperationKind::RevokeCertificate,
        ToolOperation::GenCrl => OperationKind::GenerateCrl,
    }
}

/// Facade over one PKI directory.
///
/// Safe to share between threads; operations on the same directory are
/// serialized by [`DirectoryLock`] and a second caller gets `Busy`.
pub struct PkiOrchestrator {
    runner: Arc<dyn ProcessRunner>,
    templates: Arc<dyn TemplateProvider>,
    layout: PkiLayout,
    easyrsa_bin: PathBuf,
    working_dir: PathBuf,
    timeouts: Timeouts,
    state: Mutex<PkiState>,
    in_flight: Mutex<Option<CancelToken>>,
}

impl PkiOrchestrator {
    pub fn new(settings: &Settings, runner: Arc<dyn ProcessRunner>, templates: Arc<dyn TemplateProvider>) -> Self {
        let mut state = PkiState::new(&settings.pki_dir);
        if let Err(e) = state.reload() {
            warn!("initial scan of {} failed: {}", settings.pki_dir.display(), e);
        }
        Self {
            runner,
            templates,
            layout: PkiLayout::new(&settings.pki_dir),
            easyrsa_bin: settings.easyrsa_bin.clone(),
            working_dir: settings.effective_working_dir(),
            timeouts: settings.timeouts.clone(),
            state: Mutex::new(state),
            in_flight: Mutex::new(None),
        }
    }

    /// Real Easy-RSA, or the simulator when `POCKETCA_TEST_BACKEND=stub`.
    pub fn from_settings(settings: &Settings) -> Self {
        let runner: Arc<dyn ProcessRunner> = if StubRunner::should_use_stub() {
            Arc::new(StubRunner::new())
        } else {
            Arc::new(SystemRunner::new())
        };
        Self::new(settings, runner, Arc::new(VarsDirectory::new(&settings.template_dir)))
    }

    pub fn runner(&self) -> &dyn ProcessRunner {
        self.runner.as_ref()
    }

    pub fn layout(&self) -> &PkiLayout {
        &self.layout
    }

    fn lock_state(&self) -> MutexGuard<'_, PkiState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop the in-flight tool invocation, if any. The operation then
    /// reports `Cancelled` after reloading whatever the tool left behind.
    pub fn cancel(&self) -> bool {
        match self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(token) => {
                info!("cancelling operation on {}", self.layout.root().display());
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn execute(&self, command: &PkiCommand) -> OperationResult {
        match command {
            PkiCommand::InitPki => self.init_pki(),
            PkiCommand::BuildCa { template } => self.build_ca(template.as_deref()),
            PkiCommand::Issue {
                name,
                cert_type,
                template,
            } => self.issue_certificate(name, *cert_type, template.as_deref()),
            PkiCommand::Import { source, name } => self.import_request(source, name),
            PkiCommand::Sign { name, cert_type } => self.sign_request(name, *cert_type),
            PkiCommand::Revoke { name, reason } => self.revoke_certificate(name, *reason),
            PkiCommand::GenerateCrl => self.generate_crl(),
        }
    }

    /// Rescan the directory.
    pub fn reload(&self) -> Result<(), StateError> {
        self.lock_state().reload()
    }

    /// Ordered by issue time, most recent last.
    pub fn list_certificates(&self) -> Vec<CertificateRecord> {
        self.lock_state().certificates().to_vec()
    }

    pub fn find_certificate(&self, common_name: &str) -> Option<CertificateRecord> {
        self.lock_state().find(common_name).cloned()
    }

    pub fn ca_status(&self) -> CaStatus {
        self.lock_state().ca_status()
    }

    pub fn list_pending_signing_requests(&self) -> Vec<SigningRequest> {
        self.lock_state().pending_requests()
    }

    pub fn crl_state(&self) -> CrlState {
        self.lock_state().crl().clone()
    }

    pub fn counts(&self) -> CertificateCounts {
        self.lock_state().counts()
    }

    /// Certificate file of a known record, for export.
    pub fn certificate_path(&self, common_name: &str) -> Option<PathBuf> {
        self.lock_state().find(common_name).and_then(|r| r.cert_path.clone())
    }

    /// Private key of a valid record, when Easy-RSA generated it here.
    pub fn private_key_path(&self, common_name: &str) -> Option<PathBuf> {
        let state = self.lock_state();
        let record = state.find(common_name)?;
        let path = self.layout.private_key(&record.common_name);
        (record.is_valid() && path.is_file()).then_some(path)
    }

    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        let path = self.layout.ca_cert();
        path.is_file().then_some(path)
    }

    pub fn init_pki(&self) -> OperationResult {
        let mut session = match self.begin(OperationKind::InitPki) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        // Batch-mode init-pki wipes whatever is at the path without asking.
        if session.ca_status() != CaStatus::Absent {
            return session.fail(
                FailureKind::AlreadyInitialized,
                format!("{} already holds a PKI", self.layout.root().display()),
            );
        }
        if self.root_occupied() {
            return session.fail(
                FailureKind::AlreadyInitialized,
                format!("{} exists and is not empty", self.layout.root().display()),
            );
        }

        let tool = ToolOperation::InitPki;
        let (outcome, verdict) = session.run(tool, &["init-pki"], None);
        match session.confirm(tool, &outcome, verdict, || self.layout.is_initialized()) {
            Ok(_) => {
                session.reload();
                let directory = session.state().directory().clone();
                session.succeed(
                    format!("initialized {}", self.layout.root().display()),
                    vec![AffectedEntity::Directory(directory)],
                )
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    pub fn build_ca(&self, template: Option<&str>) -> OperationResult {
        let mut session = match self.begin(OperationKind::BuildCa) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        match session.ca_status() {
            CaStatus::Absent => {
                return session.fail(
                    FailureKind::NotInitialized,
                    format!("{} is not initialized", self.layout.root().display()),
                )
            }
            CaStatus::Built => {
                return session.fail(
                    FailureKind::CaAlreadyExists,
                    format!("{} already has a CA", self.layout.root().display()),
                )
            }
            CaStatus::Initialized => {}
        }

        let vars = match self.resolve_template(template) {
            Ok(vars) => vars,
            Err(detail) => return session.fail(FailureKind::InvalidTemplate, detail),
        };

        let tool = ToolOperation::BuildCa;
        let (outcome, verdict) = session.run(tool, &["build-ca", "nopass"], vars.as_deref());
        match session.confirm(tool, &outcome, verdict, || self.layout.has_ca()) {
            Ok(extracted) => {
                session.check_reported_path(&extracted, &self.layout.ca_cert());
                session.reload();
                let directory = session.state().directory().clone();
                session.succeed("CA built", vec![AffectedEntity::Directory(directory)])
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    pub fn issue_certificate(
        &self,
        name: &str,
        cert_type: CertificateType,
        template: Option<&str>,
    ) -> OperationResult {
        let mut session = match self.begin(OperationKind::IssueCertificate) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        if let Err(e) = validate_certificate_name(name) {
            return session.fail(FailureKind::InvalidInput, format!("{:?}: {}", name, e));
        }
        if session.ca_status() != CaStatus::Built {
            return session.fail(FailureKind::CaNotBuilt, "no CA in this PKI");
        }
        let taken = {
            let state = session.state();
            state.find(name).is_some() || state.name_taken_on_disk(name)
        };
        if taken {
            return session.fail(FailureKind::DuplicateName, format!("{} already exists", name));
        }
        let vars = match self.resolve_template(template) {
            Ok(vars) => vars,
            Err(detail) => return session.fail(FailureKind::InvalidTemplate, detail),
        };

        let tool = ToolOperation::BuildFull(cert_type);
        let (outcome, verdict) = session.run(tool, &[cert_type.build_full_command(), name, "nopass"], vars.as_deref());
        session.state().note_type(name, cert_type);

        let verified = || {
            self.layout.issued_cert(name).is_file()
                && self.layout.private_key(name).is_file()
                && self.index_has(|e| e.common_name == name && e.status == CertificateStatus::Valid)
        };
        match session.confirm(tool, &outcome, verdict, verified) {
            Ok(extracted) => {
                session.check_reported_path(&extracted, &self.layout.issued_cert(name));
                session.reload();
                let record = session.state().find(name).cloned();
                match record {
                    Some(record) => session.succeed(
                        format!("issued {} certificate {} (serial {})", cert_type, name, record.serial),
                        vec![AffectedEntity::Certificate(record)],
                    ),
                    None => session.fail(
                        FailureKind::UnexpectedOutput,
                        format!("{} was created but is missing after reload", name),
                    ),
                }
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    pub fn import_request(&self, source: &Path, name: &str) -> OperationResult {
        let mut session = match self.begin(OperationKind::ImportRequest) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        if session.ca_status() == CaStatus::Absent {
            return session.fail(FailureKind::NotInitialized, "PKI is not initialized");
        }
        if let Err(e) = validate_certificate_name(name) {
            return session.fail(FailureKind::InvalidInput, format!("{:?}: {}", name, e));
        }
        if !source.is_file() || source.extension().and_then(|e| e.to_str()) != Some("req") {
            return session.fail(
                FailureKind::InvalidRequestFile,
                format!("{} is not a readable .req file", source.display()),
            );
        }
        let taken = {
            let state = session.state();
            state.find(name).is_some() || state.name_taken_on_disk(name)
        };
        if taken {
            return session.fail(FailureKind::DuplicateName, format!("{} already exists", name));
        }

        let tool = ToolOperation::ImportReq;
        let source_arg = source.to_string_lossy().to_string();
        let (outcome, verdict) = session.run(tool, &["import-req", source_arg.as_str(), name], None);
        match session.confirm(tool, &outcome, verdict, || self.layout.request(name).is_file()) {
            Ok(_) => {
                session.reload();
                let request = session.state().request(name).cloned();
                let entities = request.into_iter().map(AffectedEntity::Request).collect();
                session.succeed(format!("imported request {}", name), entities)
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    pub fn sign_request(&self, name: &str, cert_type: CertificateType) -> OperationResult {
        let mut session = match self.begin(OperationKind::SignRequest) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        if let Err(e) = validate_certificate_name(name) {
            return session.fail(FailureKind::InvalidInput, format!("{:?}: {}", name, e));
        }
        if session.ca_status() != CaStatus::Built {
            return session.fail(FailureKind::CaNotBuilt, "no CA in this PKI");
        }
        let (request, signed) = {
            let state = session.state();
            let signed = state.find(name).is_some() || self.layout.issued_cert(name).exists();
            (state.request(name).cloned(), signed)
        };
        match request {
            Some(request) if request.consumed || signed => {
                return session.fail(
                    FailureKind::RequestAlreadyConsumed,
                    format!("request {} was already signed", name),
                )
            }
            Some(_) => {}
            None if signed => {
                return session.fail(
                    FailureKind::RequestAlreadyConsumed,
                    format!("a certificate named {} already exists", name),
                )
            }
            None => {
                return session.fail(
                    FailureKind::InvalidRequestFile,
                    format!("no pending request named {}", name),
                )
            }
        }

        let tool = ToolOperation::SignReq;
        let (outcome, verdict) = session.run(tool, &["sign-req", cert_type.as_easyrsa(), name], None);
        session.state().note_type(name, cert_type);

        let verified = || {
            self.layout.issued_cert(name).is_file()
                && self.index_has(|e| e.common_name == name && e.status == CertificateStatus::Valid)
        };
        match session.confirm(tool, &outcome, verdict, verified) {
            Ok(extracted) => {
                session.check_reported_path(&extracted, &self.layout.issued_cert(name));
                session.reload();
                let (record, request) = {
                    let state = session.state();
                    (state.find(name).cloned(), state.request(name).cloned())
                };
                let Some(record) = record else {
                    return session.fail(
                        FailureKind::UnexpectedOutput,
                        format!("{} was signed but is missing after reload", name),
                    );
                };
                let mut entities = vec![AffectedEntity::Certificate(record)];
                entities.extend(request.map(AffectedEntity::Request));
                session.succeed(format!("signed {} request {}", cert_type, name), entities)
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    /// Revoke, then regenerate the CRL so the revocation is published.
    pub fn revoke_certificate(&self, name: &str, reason: RevocationReason) -> OperationResult {
        let mut session = match self.begin(OperationKind::RevokeCertificate) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        if let Err(e) = validate_certificate_name(name) {
            return session.fail(FailureKind::InvalidInput, format!("{:?}: {}", name, e));
        }
        if session.ca_status() != CaStatus::Built {
            return session.fail(FailureKind::CaNotBuilt, "no CA in this PKI");
        }
        let record = session.state().find(name).cloned();
        let serial = match record {
            None => return session.fail(FailureKind::NotFound, format!("no certificate named {}", name)),
            Some(record) => match record.status {
                CertificateStatus::Revoked => {
                    return session.fail(
                        FailureKind::AlreadyRevoked,
                        format!("{} (serial {}) is already revoked", name, record.serial),
                    )
                }
                CertificateStatus::Expired => {
                    return session.fail(
                        FailureKind::InvalidInput,
                        format!("{} has expired and cannot be revoked", name),
                    )
                }
                CertificateStatus::Valid => record.serial,
            },
        };

        let tool = ToolOperation::Revoke;
        let (outcome, verdict) = session.run(tool, &["revoke", name, reason.as_arg()], None);
        let revoked = || self.index_has(|e| e.serial == serial && e.status == CertificateStatus::Revoked);
        match session.confirm(tool, &outcome, verdict, revoked) {
            Ok(extracted) => session.check_reported_serial(&extracted, &serial),
            Err((kind, detail)) => return session.fail(kind, detail),
        }

        let crl_result = self.run_gen_crl(&mut session);
        session.reload();
        let record = session.state().find(name).cloned();
        let mut entities: Vec<AffectedEntity> = record.into_iter().map(AffectedEntity::Certificate).collect();

        match crl_result {
            Ok(()) => {
                entities.push(AffectedEntity::Crl(session.state().crl().clone()));
                session.succeed(format!("revoked {} (serial {}, {})", name, serial, reason.as_arg()), entities)
            }
            Err((kind, detail)) => session.fail_with(
                kind,
                format!("{} was revoked but the CRL was not regenerated: {}", name, detail),
                entities,
            ),
        }
    }

    pub fn generate_crl(&self) -> OperationResult {
        let mut session = match self.begin(OperationKind::GenerateCrl) {
            Ok(session) => session,
            Err(busy) => return busy,
        };

        if session.ca_status() != CaStatus::Built {
            return session.fail(FailureKind::CaNotBuilt, "no CA in this PKI");
        }

        match self.run_gen_crl(&mut session) {
            Ok(()) => {
                session.reload();
                let crl = session.state().crl().clone();
                let detail = format!("CRL lists {} revoked serials", crl.revoked_serials.len());
                session.succeed(detail, vec![AffectedEntity::Crl(crl)])
            }
            Err((kind, detail)) => session.fail(kind, detail),
        }
    }

    fn begin(&self, operation: OperationKind) -> Result<Session<'_>, OperationResult> {
        let Some(lock) = DirectoryLock::try_acquire(self.layout.root()) else {
            warn!("{} rejected: {} is busy", operation.verb(), self.layout.root().display());
            return Err(OperationResult::failure(
                operation,
                FailureKind::Busy,
                format!("another operation is running on {}", self.layout.root().display()),
            ));
        };

        let token = CancelToken::new();
        *self.in_flight.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        debug!("{} on {}", operation.verb(), self.layout.root().display());

        let mut session = Session {
            orchestrator: self,
            operation,
            timer: Timer::new(),
            token,
            invocations: Vec::new(),
            warnings: Vec::new(),
            _lock: lock,
        };
        session.reload();
        Ok(session)
    }

    fn resolve_template(&self, template: Option<&str>) -> Result<Option<PathBuf>, String> {
        match template {
            None => Ok(None),
            Some(name) => self
                .templates
                .resolve(name)
                .map(Some)
                .ok_or_else(|| format!("template {:?} not found", name)),
        }
    }

    /// True when the PKI path is a file or a directory with any entries.
    fn root_occupied(&self) -> bool {
        let root = self.layout.root();
        match fs::read_dir(root) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => root.exists(),
        }
    }

    fn index_has(&self, predicate: impl Fn(&IndexEntry) -> bool) -> bool {
        match read_index(&self.layout.index()) {
            Ok(entries) => entries.iter().any(predicate),
            Err(e) => {
                warn!("cannot verify against index: {}", e);
                false
            }
        }
    }

    /// True when `crl.pem` was written at or after `since`.
    fn crl_written_since(&self, since: SystemTime) -> bool {
        // One second of slack for filesystems with coarse timestamps.
        let since = since.checked_sub(Duration::from_secs(1)).unwrap_or(since);
        fs::metadata(self.layout.crl())
            .and_then(|m| m.modified())
            .map(|modified| modified >= since)
            .unwrap_or(false)
    }

    fn run_gen_crl(&self, session: &mut Session<'_>) -> Result<(), (FailureKind, String)> {
        let started = SystemTime::now();
        let tool = ToolOperation::GenCrl;
        let (outcome, verdict) = session.run(tool, &["gen-crl"], None);
        let extracted = session.confirm(tool, &outcome, verdict, || self.crl_written_since(started))?;
        session.check_reported_path(&extracted, &self.layout.crl());
        Ok(())
    }
}

/// Bookkeeping for one mutating operation. Holds the directory lock and
/// publishes its cancel token until dropped.
struct Session<'a> {
    orchestrator: &'a PkiOrchestrator,
    operation: OperationKind,
    timer: Timer,
    token: CancelToken,
    invocations: Vec<Invocation>,
    warnings: Vec<String>,
    _lock: DirectoryLock,
}

impl<'a> Session<'a> {
    fn state(&self) -> MutexGuard<'a, PkiState> {
        let orchestrator = self.orchestrator;
        orchestrator.lock_state()
    }

    fn ca_status(&self) -> CaStatus {
        self.state().ca_status()
    }

    fn reload(&mut self) {
        let orchestrator = self.orchestrator;
        let mut state = orchestrator.lock_state();
        if let Err(e) = state.reload() {
            warn!("reload of {} failed: {}", orchestrator.layout.root().display(), e);
            self.warnings.push(format!("state reload failed: {}", e));
        }
    }

    fn run(&mut self, tool: ToolOperation, args: &[&str], vars: Option<&Path>) -> (RunOutcome, Verdict) {
        let orchestrator = self.orchestrator;
        let mut request = RunRequest::new(
            &orchestrator.easyrsa_bin,
            &orchestrator.working_dir,
            orchestrator.timeouts.for_operation(timeout_for(tool)),
        )
        .env("EASYRSA_PKI", orchestrator.layout.root().to_string_lossy())
        .env("EASYRSA_BATCH", "1");
        if let Some(vars) = vars {
            request = request.env("EASYRSA_VARS_FILE", vars.to_string_lossy());
        }
        for arg in args {
            request = request.arg(*arg);
        }

        debug!("running {:?}", redact_command_args(&request.command_line()));
        let outcome = if self.token.is_cancelled() {
            RunOutcome::not_started(&request, RunStatus::Cancelled, "cancelled before start")
        } else {
            orchestrator.runner.run(&request, &self.token)
        };

        self.invocations.push(Invocation {
            command: redact_command_args(&outcome.command),
            env: redact_env_vars(&request.env),
            cwd: Some(request.cwd.to_string_lossy().to_string()),
            timeout_ms: request.timeout.as_millis() as u64,
            exit_code: outcome.exit_code(),
            duration_ms: outcome.duration_ms,
        });

        let verdict = parser::parse(tool, &outcome);
        (outcome, verdict)
    }

    /// Combine the parser's verdict with the on-disk check. The disk has
    /// the final word whenever the tool exited 0.
    fn confirm(
        &mut self,
        tool: ToolOperation,
        outcome: &RunOutcome,
        verdict: Verdict,
        verified: impl FnOnce() -> bool,
    ) -> Result<Extracted, (FailureKind, String)> {
        match verdict {
            Verdict::Confirmed(extracted) => {
                if verified() {
                    Ok(extracted)
                } else {
                    Err((
                        FailureKind::UnexpectedOutput,
                        format!("{} reported success but its result is not on disk", tool.subcommand()),
                    ))
                }
            }
            Verdict::Failed {
                kind: FailureKind::UnexpectedOutput,
                detail,
            } if outcome.succeeded() => {
                if verified() {
                    self.warn(format!("{} printed no confirmation; result verified on disk", tool.subcommand()));
                    Ok(parser::extract(&outcome.combined_output()))
                } else {
                    Err((FailureKind::UnexpectedOutput, detail))
                }
            }
            Verdict::Failed { kind, detail } => Err((kind, detail)),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Files of `expected`'s kind that the tool printed should include the
    /// one verified on disk.
    fn check_reported_path(&mut self, extracted: &Extracted, expected: &Path) {
        let orchestrator = self.orchestrator;
        let tail = expected.strip_prefix(orchestrator.layout.root()).unwrap_or(expected);
        let reported: Vec<&PathBuf> = extracted
            .paths
            .iter()
            .filter(|p| p.extension() == expected.extension())
            .collect();
        if reported.is_empty() || reported.iter().any(|p| p.ends_with(tail)) {
            return;
        }
        let listed: Vec<String> = reported.iter().map(|p| p.display().to_string()).collect();
        self.warn(format!("tool reported {} instead of {}", listed.join(", "), expected.display()));
    }

    /// The serial the tool says it revoked should match the index entry.
    fn check_reported_serial(&mut self, extracted: &Extracted, serial: &str) {
        match extracted.serial.as_deref() {
            Some(reported) if !reported.eq_ignore_ascii_case(serial) => {
                self.warn(format!("tool reported revoking serial {} but the index has {}", reported, serial))
            }
            _ => {}
        }
    }

    fn succeed(self, detail: impl Into<String>, affected: Vec<AffectedEntity>) -> OperationResult {
        let mut result = OperationResult::success(self.operation, detail);
        result.affected = affected;
        self.complete(result)
    }

    fn fail(self, kind: FailureKind, detail: impl Into<String>) -> OperationResult {
        self.fail_with(kind, detail, Vec::new())
    }

    fn fail_with(mut self, kind: FailureKind, detail: impl Into<String>, affected: Vec<AffectedEntity>) -> OperationResult {
        // Whatever the tool did or did not do, report from ground truth.
        if !self.invocations.is_empty() {
            self.reload();
        }
        let mut result = OperationResult::failure(self.operation, kind, detail);
        result.affected = affected;
        self.complete(result)
    }

    fn complete(mut self, mut result: OperationResult) -> OperationResult {
        result.invocations = std::mem::take(&mut self.invocations);
        result.warnings = std::mem::take(&mut self.warnings);
        result.duration_ms = self.timer.elapsed_ms();

        match result.kind {
            None => info!("{}: {}", self.operation.verb(), result.detail),
            Some(kind @ (FailureKind::ToolError | FailureKind::UnexpectedOutput)) => {
                error!("{} failed ({}): {}", self.operation.verb(), kind, result.detail)
            }
            Some(kind) => warn!("{} failed ({}): {}", self.operation.verb(), kind, result.detail),
        }
        result
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        *self.orchestrator.in_flight.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StubFault;
    use std::collections::HashSet;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        runner: Arc<StubRunner>,
        pki: PkiOrchestrator,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let templates = temp_dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("ca.vars"), "set_var EASYRSA_REQ_CN \"Pocket CA\"\n").unwrap();
        fs::write(templates.join("server.vars"), "set_var EASYRSA_CERT_EXPIRE 365\n").unwrap();

        let settings = Settings {
            pki_dir: temp_dir.path().join("pki"),
            easyrsa_bin: PathBuf::from("easyrsa"),
            template_dir: templates.clone(),
            working_dir: Some(temp_dir.path().to_path_buf()),
            ..Settings::default()
        };
        let runner = Arc::new(StubRunner::new());
        let pki = PkiOrchestrator::new(&settings, runner.clone(), Arc::new(VarsDirectory::new(&templates)));
        Fixture { temp_dir, runner, pki }
    }

    fn with_ca() -> Fixture {
        let f = fixture();
        assert!(f.pki.init_pki().is_success());
        assert!(f.pki.build_ca(Some("ca")).is_success());
        f
    }

    fn assert_unique(pki: &PkiOrchestrator) {
        let certificates = pki.list_certificates();
        let names: HashSet<&str> = certificates.iter().map(|c| c.common_name.as_str()).collect();
        assert_eq!(names.len(), certificates.len());
    }

    fn write_request(dir: &Path, file: &str) -> PathBuf {
        let path = dir.join(file);
        fs::write(
            &path,
            "-----BEGIN CERTIFICATE REQUEST-----\nMIIC\n-----END CERTIFICATE REQUEST-----\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_init_on_empty_directory() {
        let f = fixture();
        let result = f.pki.init_pki();
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(f.pki.ca_status(), CaStatus::Initialized);
        assert_eq!(result.invocations.len(), 1);
        assert_eq!(result.invocations[0].env["EASYRSA_BATCH"], "1");
    }

    #[test]
    fn test_init_refuses_to_wipe_existing_files() {
        let f = fixture();
        let layout = f.pki.layout().clone();
        fs::create_dir_all(layout.private_dir()).unwrap();
        fs::write(layout.ca_cert(), "ca").unwrap();
        fs::write(layout.ca_key(), "key").unwrap();
        fs::write(layout.index(), "").unwrap();
        f.pki.reload().unwrap();
        assert_eq!(f.pki.ca_status(), CaStatus::Absent);

        let result = f.pki.init_pki();
        assert_eq!(result.kind, Some(FailureKind::AlreadyInitialized));
        assert_eq!(f.runner.call_count(), 0);
        assert!(layout.ca_cert().is_file());
        assert!(layout.ca_key().is_file());
    }

    #[test]
    fn test_init_accepts_existing_empty_directory() {
        let f = fixture();
        fs::create_dir_all(f.pki.layout().root()).unwrap();
        let result = f.pki.init_pki();
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(f.pki.ca_status(), CaStatus::Initialized);
    }

    #[test]
    fn test_init_twice_is_rejected_without_spawning() {
        let f = fixture();
        assert!(f.pki.init_pki().is_success());
        let result = f.pki.init_pki();
        assert_eq!(result.kind, Some(FailureKind::AlreadyInitialized));
        assert_eq!(f.runner.call_count(), 1);
    }

    #[test]
    fn test_build_ca_before_init() {
        let f = fixture();
        let result = f.pki.build_ca(Some("ca"));
        assert_eq!(result.kind, Some(FailureKind::NotInitialized));
        assert_eq!(f.runner.call_count(), 0);
        assert!(result.invocations.is_empty());
    }

    #[test]
    fn test_build_ca_with_template() {
        let f = fixture();
        f.pki.init_pki();
        let result = f.pki.build_ca(Some("ca"));
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(f.pki.ca_status(), CaStatus::Built);

        let env = &result.invocations[0].env;
        assert!(env["EASYRSA_VARS_FILE"].ends_with("ca.vars"));
        assert_eq!(result.invocations[0].command, vec!["easyrsa", "build-ca", "nopass"]);

        let again = f.pki.build_ca(None);
        assert_eq!(again.kind, Some(FailureKind::CaAlreadyExists));
        assert_eq!(f.runner.call_count(), 2);
    }

    #[test]
    fn test_unknown_template_is_rejected() {
        let f = fixture();
        f.pki.init_pki();
        let result = f.pki.build_ca(Some("nonexistent"));
        assert_eq!(result.kind, Some(FailureKind::InvalidTemplate));
        assert_eq!(f.runner.call_count(), 1);
        assert_eq!(f.pki.ca_status(), CaStatus::Initialized);
    }

    #[test]
    fn test_issue_server_certificate() {
        let f = with_ca();
        let result = f.pki.issue_certificate("server01", CertificateType::Server, Some("server"));
        assert!(result.is_success(), "{:?}", result);

        let certificates = f.pki.list_certificates();
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].common_name, "server01");
        assert_eq!(certificates[0].cert_type, CertificateType::Server);
        assert_eq!(certificates[0].status, CertificateStatus::Valid);
        assert_eq!(result.certificate(), Some(&certificates[0]));
        assert!(f.pki.private_key_path("server01").is_some());
        assert!(f.pki.certificate_path("server01").is_some());
    }

    #[test]
    fn test_duplicate_name_short_circuits() {
        let f = with_ca();
        assert!(f.pki.issue_certificate("web", CertificateType::Server, None).is_success());
        let calls = f.runner.call_count();

        for _ in 0..2 {
            let result = f.pki.issue_certificate("web", CertificateType::Client, None);
            assert_eq!(result.kind, Some(FailureKind::DuplicateName));
        }
        assert_eq!(f.runner.call_count(), calls);
        assert_unique(&f.pki);
    }

    #[test]
    fn test_issue_rejects_unsafe_names() {
        let f = with_ca();
        for name in ["", "../ca", "web; rm -rf /", "-nopass"] {
            let result = f.pki.issue_certificate(name, CertificateType::Client, None);
            assert_eq!(result.kind, Some(FailureKind::InvalidInput), "{:?}", name);
        }
        assert_eq!(f.runner.call_count(), 2);
    }

    #[test]
    fn test_issue_without_ca() {
        let f = fixture();
        f.pki.init_pki();
        let result = f.pki.issue_certificate("web", CertificateType::Server, None);
        assert_eq!(result.kind, Some(FailureKind::CaNotBuilt));
        assert_eq!(f.runner.call_count(), 1);
    }

    #[test]
    fn test_list_is_ordered_and_stable() {
        let f = with_ca();
        for name in ["alpha", "bravo", "charlie"] {
            assert!(f.pki.issue_certificate(name, CertificateType::Client, None).is_success());
        }
        let first = f.pki.list_certificates();
        let names: Vec<&str> = first.iter().map(|c| c.common_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);

        f.pki.reload().unwrap();
        assert_eq!(f.pki.list_certificates(), first);
        f.pki.reload().unwrap();
        assert_eq!(f.pki.list_certificates(), first);
        assert_eq!(f.pki.counts().valid, 3);
    }

    #[test]
    fn test_revoke_updates_record_and_crl() {
        let f = with_ca();
        f.pki.issue_certificate("server01", CertificateType::Server, Some("server"));
        let serial = f.pki.find_certificate("server01").unwrap().serial;

        let result = f.pki.revoke_certificate("server01", RevocationReason::KeyCompromise);
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(
            f.pki.find_certificate("server01").unwrap().status,
            CertificateStatus::Revoked
        );
        assert!(f.pki.crl_state().revoked_serials.contains(&serial));
        assert!(f.pki.crl_state().generated_at.is_some());

        let subcommands: Vec<String> = result.invocations.iter().map(|i| i.command[1].clone()).collect();
        assert_eq!(subcommands, vec!["revoke", "gen-crl"]);
        assert_eq!(result.invocations[0].command[3], "keyCompromise");
        assert!(result.affected.iter().any(|e| matches!(e, AffectedEntity::Crl(_))));
        assert_unique(&f.pki);
    }

    #[test]
    fn test_revoke_failures_do_not_touch_crl() {
        let f = with_ca();
        f.pki.issue_certificate("web", CertificateType::Server, None);
        assert!(f.pki.revoke_certificate("web", RevocationReason::Superseded).is_success());
        let crl_before = f.pki.crl_state();
        let calls = f.runner.call_count();

        let again = f.pki.revoke_certificate("web", RevocationReason::Superseded);
        assert_eq!(again.kind, Some(FailureKind::AlreadyRevoked));
        let missing = f.pki.revoke_certificate("ghost", RevocationReason::Unspecified);
        assert_eq!(missing.kind, Some(FailureKind::NotFound));

        assert_eq!(f.runner.call_count(), calls);
        assert_eq!(f.pki.crl_state(), crl_before);
    }

    #[test]
    fn test_revoke_with_failed_crl_reports_partial_effect() {
        let f = with_ca();
        f.pki.issue_certificate("web", CertificateType::Server, None);
        f.runner.set_fault(
            "gen-crl",
            StubFault::Exit {
                code: 1,
                stderr: "openssl: something odd".to_string(),
            },
        );

        let result = f.pki.revoke_certificate("web", RevocationReason::Unspecified);
        assert_eq!(result.kind, Some(FailureKind::ToolError));
        assert!(result.detail.contains("was revoked"));
        assert_eq!(result.certificate().unwrap().status, CertificateStatus::Revoked);
        assert_eq!(f.pki.find_certificate("web").unwrap().status, CertificateStatus::Revoked);
        assert!(f.pki.crl_state().generated_at.is_none());
    }

    #[test]
    fn test_timeout_during_build_ca() {
        let f = fixture();
        f.pki.init_pki();
        f.runner.set_fault("build-ca", StubFault::Timeout { after_effects: false });

        let result = f.pki.build_ca(Some("ca"));
        assert_eq!(result.kind, Some(FailureKind::Timeout));
        f.pki.reload().unwrap();
        assert_eq!(f.pki.ca_status(), CaStatus::Initialized);
    }

    #[test]
    fn test_interrupted_issue_is_reflected_and_not_retried() {
        let f = with_ca();
        f.runner.set_fault("build-client-full", StubFault::Timeout { after_effects: true });

        let result = f.pki.issue_certificate("laptop", CertificateType::Client, None);
        assert_eq!(result.kind, Some(FailureKind::Timeout));
        assert!(f.pki.find_certificate("laptop").is_some());

        f.runner.clear_faults();
        let calls = f.runner.call_count();
        let retry = f.pki.issue_certificate("laptop", CertificateType::Client, None);
        assert_eq!(retry.kind, Some(FailureKind::DuplicateName));
        assert_eq!(f.runner.call_count(), calls);
    }

    #[test]
    fn test_missing_marker_verified_on_disk_is_success() {
        let f = with_ca();
        f.runner.set_fault("build-server-full", StubFault::SilentSuccess);
        let result = f.pki.issue_certificate("web", CertificateType::Server, None);
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_reported_certificate_path_is_cross_checked() {
        let f = with_ca();
        let result = f.pki.issue_certificate("web", CertificateType::Server, None);
        assert!(result.is_success(), "{:?}", result);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);

        f.runner.set_fault(
            "build-client-full",
            StubFault::Output("Certificate created at: /srv/elsewhere/issued/other.crt\n".to_string()),
        );
        let result = f.pki.issue_certificate("laptop", CertificateType::Client, None);
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("/srv/elsewhere/issued/other.crt"));
        assert!(result.warnings[0].contains("laptop.crt"));
    }

    #[test]
    fn test_reported_revoked_serial_is_cross_checked() {
        let f = with_ca();
        f.pki.issue_certificate("web", CertificateType::Server, None);
        let serial = f.pki.find_certificate("web").unwrap().serial;
        f.runner.set_fault(
            "revoke",
            StubFault::Output("Revoking Certificate FF.\nRevocation was successful.\n".to_string()),
        );

        let result = f.pki.revoke_certificate("web", RevocationReason::Superseded);
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("FF"));
        assert!(result.warnings[0].contains(&serial));
        let record = f.pki.find_certificate("web").unwrap();
        assert_eq!(record.status, CertificateStatus::Revoked);
        assert_eq!(record.revocation_reason, Some(RevocationReason::Superseded));

        let subcommands: Vec<String> = f.runner.calls().iter().map(|args| args[0].clone()).collect();
        assert_eq!(subcommands, vec!["init-pki", "build-ca", "build-server-full", "revoke", "gen-crl"]);
    }

    #[test]
    fn test_exit_zero_without_disk_effect_is_unexpected() {
        let f = with_ca();
        f.runner.set_fault("gen-crl", StubFault::NoEffects);
        let result = f.pki.generate_crl();
        assert_eq!(result.kind, Some(FailureKind::UnexpectedOutput));
        assert!(f.pki.crl_state().generated_at.is_none());
    }

    #[test]
    fn test_generate_crl() {
        let f = fixture();
        assert_eq!(f.pki.generate_crl().kind, Some(FailureKind::CaNotBuilt));
        assert_eq!(f.runner.call_count(), 0);

        f.pki.init_pki();
        f.pki.build_ca(None);
        let result = f.pki.generate_crl();
        assert!(result.is_success(), "{:?}", result);
        assert!(f.pki.crl_state().generated_at.is_some());
    }

    #[test]
    fn test_import_then_sign() {
        let f = with_ca();
        let source = write_request(f.temp_dir.path(), "laptop.req");

        let imported = f.pki.import_request(&source, "laptop");
        assert!(imported.is_success(), "{:?}", imported);
        let pending = f.pki.list_pending_signing_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "laptop");

        let signed = f.pki.sign_request("laptop", CertificateType::Client);
        assert!(signed.is_success(), "{:?}", signed);
        assert_eq!(signed.certificate().unwrap().cert_type, CertificateType::Client);
        assert!(f.pki.list_pending_signing_requests().is_empty());

        let calls = f.runner.call_count();
        let again = f.pki.sign_request("laptop", CertificateType::Client);
        assert_eq!(again.kind, Some(FailureKind::RequestAlreadyConsumed));
        assert_eq!(f.runner.call_count(), calls);
    }

    #[test]
    fn test_sign_unknown_request() {
        let f = with_ca();
        let result = f.pki.sign_request("nobody", CertificateType::Client);
        assert_eq!(result.kind, Some(FailureKind::InvalidRequestFile));
        assert_eq!(f.runner.call_count(), 2);
    }

    #[test]
    fn test_import_rejects_bad_sources() {
        let f = with_ca();
        let not_req = f.temp_dir.path().join("notes.txt");
        fs::write(&not_req, "hello").unwrap();

        let result = f.pki.import_request(&not_req, "notes");
        assert_eq!(result.kind, Some(FailureKind::InvalidRequestFile));
        let result = f.pki.import_request(&f.temp_dir.path().join("absent.req"), "absent");
        assert_eq!(result.kind, Some(FailureKind::InvalidRequestFile));

        f.pki.issue_certificate("web", CertificateType::Server, None);
        let source = write_request(f.temp_dir.path(), "web.req");
        let result = f.pki.import_request(&source, "web");
        assert_eq!(result.kind, Some(FailureKind::DuplicateName));
        assert_eq!(f.runner.call_count(), 3);
    }

    #[test]
    fn test_tool_missing() {
        let f = fixture();
        f.runner.set_fault("init-pki", StubFault::ToolMissing);
        let result = f.pki.init_pki();
        assert_eq!(result.kind, Some(FailureKind::ToolNotFound));
        assert_eq!(f.pki.ca_status(), CaStatus::Absent);
    }

    #[test]
    fn test_second_operation_is_busy() {
        let f = fixture();
        let _held = DirectoryLock::try_acquire(f.pki.layout().root()).unwrap();
        let result = f.pki.init_pki();
        assert_eq!(result.kind, Some(FailureKind::Busy));
        assert_eq!(f.runner.call_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_pki_path_is_busy_while_held() {
        let f = fixture();
        let link = f.temp_dir.path().join("link");
        std::os::unix::fs::symlink(f.temp_dir.path(), &link).unwrap();

        let _held = DirectoryLock::try_acquire(&link.join("pki")).unwrap();
        fs::create_dir_all(f.pki.layout().root()).unwrap();
        assert_eq!(f.pki.generate_crl().kind, Some(FailureKind::Busy));
        assert_eq!(f.runner.call_count(), 0);
    }

    #[test]
    fn test_cancel_in_flight_build_ca() {
        let f = fixture();
        f.pki.init_pki();
        f.runner.set_fault("build-ca", StubFault::Block);
        assert!(!f.pki.cancel());

        let pki = Arc::new(f.pki);
        let worker = {
            let pki = Arc::clone(&pki);
            thread::spawn(move || pki.build_ca(None))
        };
        while f.runner.call_count() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pki.cancel());

        let result = worker.join().unwrap();
        assert_eq!(result.kind, Some(FailureKind::Cancelled));
        assert_eq!(pki.ca_status(), CaStatus::Initialized);
        assert!(!pki.cancel());
    }
}
