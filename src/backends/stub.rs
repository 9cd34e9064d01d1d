//! In-process stand-in for Easy-RSA.
//!
//! `StubRunner` answers the subcommands the orchestrator uses by writing the
//! same files Easy-RSA 3 would under `EASYRSA_PKI` and printing the same
//! confirmation lines, so the whole validate/run/parse/verify/reload path can
//! be exercised without the real tool. Faults can be injected per subcommand.

use chrono::{Duration as ChronoDuration, Utc};
use log::debug;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{CancelToken, ProcessRunner, RunOutcome, RunRequest, RunStatus};
use crate::pki::model::PkiLayout;

/// Misbehaviour injected for one subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubFault {
    /// Exit with `code` and `stderr`; nothing is written.
    Exit { code: i32, stderr: String },
    /// Report a timeout. With `after_effects` the files were written first.
    Timeout { after_effects: bool },
    /// Do the work and exit 0, but print no confirmation.
    SilentSuccess,
    /// Print the confirmation and exit 0 without touching the disk.
    NoEffects,
    /// Do the work but print `stdout` instead of the usual text.
    Output(String),
    /// Run until cancelled or the request times out.
    Block,
    /// Behave as if the program does not exist.
    ToolMissing,
}

struct Reply {
    code: i32,
    stdout: String,
    stderr: String,
}

impl Reply {
    fn ok(stdout: String) -> Self {
        Self {
            code: 0,
            stdout: format!("Using SSL: openssl OpenSSL 3.0.2 15 Mar 2022\n{}", stdout),
            stderr: String::new(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            stdout: String::new(),
            stderr: format!("\nEasy-RSA error:\n\n{}\n", message.into()),
        }
    }
}

/// Stub runner for tests that provides deterministic Easy-RSA behaviour
/// without external dependencies.
pub struct StubRunner {
    id: String,
    faults: Mutex<HashMap<String, StubFault>>,
    calls: Mutex<Vec<RunRequest>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self {
            id: "stub".to_string(),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Check if we should use the stub runner (for tests)
    pub fn should_use_stub() -> bool {
        env::var("POCKETCA_TEST_BACKEND").unwrap_or_default() == "stub"
    }

    /// Inject `fault` for every later call of `subcommand`.
    pub fn set_fault(&self, subcommand: &str, fault: StubFault) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(subcommand.to_string(), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Argument lists of every call so far, oldest first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|r| r.args.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn fault_for(&self, subcommand: &str) -> Option<StubFault> {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(subcommand)
            .cloned()
    }
}

impl Default for StubRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for StubRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn simulated(&self) -> bool {
        true
    }

    fn run(&self, request: &RunRequest, cancel: &CancelToken) -> RunOutcome {
        let start = Instant::now();
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let subcommand = request.subcommand().unwrap_or_default().to_string();
        let finish = |status: RunStatus, stdout: String, stderr: String| RunOutcome {
            status,
            stdout,
            stderr,
            command: request.command_line(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if cancel.is_cancelled() {
            return finish(RunStatus::Cancelled, String::new(), String::new());
        }

        let fault = self.fault_for(&subcommand);
        debug!("stub {} (fault: {:?})", subcommand, fault);

        match fault {
            None => {
                let reply = simulate(request);
                finish(RunStatus::Exited(reply.code), reply.stdout, reply.stderr)
            }
            Some(StubFault::Exit { code, stderr }) => finish(RunStatus::Exited(code), String::new(), stderr),
            Some(StubFault::Timeout { after_effects }) => {
                let stdout = if after_effects {
                    simulate(request).stdout
                } else {
                    String::new()
                };
                finish(RunStatus::TimedOut, stdout, String::new())
            }
            Some(StubFault::SilentSuccess) => {
                let reply = simulate(request);
                let stdout = if reply.code == 0 {
                    "Using SSL: openssl OpenSSL 3.0.2 15 Mar 2022\n".to_string()
                } else {
                    reply.stdout
                };
                finish(RunStatus::Exited(reply.code), stdout, reply.stderr)
            }
            Some(StubFault::Output(stdout)) => {
                let reply = simulate(request);
                finish(RunStatus::Exited(reply.code), stdout, reply.stderr)
            }
            Some(StubFault::NoEffects) => finish(RunStatus::Exited(0), banner(&subcommand), String::new()),
            Some(StubFault::Block) => {
                let deadline = start.checked_add(request.timeout);
                loop {
                    if cancel.is_cancelled() {
                        break finish(RunStatus::Cancelled, String::new(), String::new());
                    }
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        break finish(RunStatus::TimedOut, String::new(), String::new());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            Some(StubFault::ToolMissing) => finish(
                RunStatus::ToolNotFound,
                String::new(),
                format!("{}: cannot find binary path", request.program.display()),
            ),
        }
    }
}

/// Confirmation text only, as printed by a successful run.
fn banner(subcommand: &str) -> String {
    match subcommand {
        "init-pki" => "init-pki complete; you may now create a CA or requests.\n",
        "build-ca" => "CA creation complete and you may now import and sign cert requests.\n",
        "build-server-full" | "build-client-full" | "sign-req" => "Certificate created at: /nowhere/issued/x.crt\n",
        "import-req" => "The request has been successfully imported with a short name of: x\n",
        "revoke" => "Revocation was successful. You must run gen-crl and upload a CRL.\n",
        "gen-crl" => "An updated CRL has been created.\n",
        _ => "",
    }
    .to_string()
}

fn pki_root(request: &RunRequest) -> PathBuf {
    request
        .env
        .get("EASYRSA_PKI")
        .map(PathBuf::from)
        .unwrap_or_else(|| request.cwd.join("pki"))
}

fn simulate(request: &RunRequest) -> Reply {
    let layout = PkiLayout::new(pki_root(request));
    let args: Vec<&str> = request.args.iter().map(String::as_str).collect();

    if let Some(vars) = request.env.get("EASYRSA_VARS_FILE") {
        if !Path::new(vars).is_file() {
            return Reply::error(format!("The vars file could not be found: {}", vars));
        }
    }

    let result = match args.as_slice() {
        ["init-pki", ..] => init_pki(&layout),
        ["build-ca", ..] => build_ca(&layout),
        [sub @ ("build-server-full" | "build-client-full"), name, ..] => {
            let server = *sub == "build-server-full";
            build_full(&layout, name, server)
        }
        ["import-req", source, name, ..] => import_req(&layout, Path::new(source), name),
        ["sign-req", kind, name, ..] => sign_req(&layout, kind, name),
        ["revoke", name, rest @ ..] => revoke(&layout, name, rest.first().copied().unwrap_or("unspecified")),
        ["gen-crl", ..] => gen_crl(&layout),
        _ => Ok(Reply::error(format!("Unknown command '{}'. Run 'easyrsa help'", args.join(" ")))),
    };

    result.unwrap_or_else(|e| Reply::error(format!("stub I/O failure: {}", e)))
}

fn require_pki(layout: &PkiLayout) -> Option<Reply> {
    if layout.is_initialized() {
        None
    } else {
        Some(Reply::error(format!(
            "EASYRSA_PKI does not exist (perhaps you need to run init-pki)?\nExpected to find the EASYRSA_PKI at: {}",
            layout.root().display()
        )))
    }
}

fn require_ca(layout: &PkiLayout) -> Option<Reply> {
    require_pki(layout).or_else(|| {
        if layout.has_ca() {
            None
        } else {
            Some(Reply::error("Missing CA: run build-ca first (unable to find CA certificate)"))
        }
    })
}

fn init_pki(layout: &PkiLayout) -> io::Result<Reply> {
    // Batch mode removes whatever was there.
    if layout.root().exists() {
        fs::remove_dir_all(layout.root())?;
    }
    for dir in [layout.private_dir(), layout.reqs_dir()] {
        fs::create_dir_all(dir)?;
    }
    Ok(Reply::ok(format!(
        "\ninit-pki complete; you may now create a CA or requests.\nYour newly created PKI dir is: {}\n",
        layout.root().display()
    )))
}

fn build_ca(layout: &PkiLayout) -> io::Result<Reply> {
    if let Some(reply) = require_pki(layout) {
        return Ok(reply);
    }
    if layout.has_ca() {
        return Ok(Reply::error(
            "Unable to create a CA as you already seem to have one set up.\nIf you intended to start a new CA, run init-pki first.",
        ));
    }
    for dir in [layout.issued_dir(), layout.revoked_certs_dir()] {
        fs::create_dir_all(dir)?;
    }
    fs::write(layout.ca_key(), pem("PRIVATE KEY", "stub-ca-key"))?;
    fs::write(layout.ca_cert(), pem("CERTIFICATE", "stub-ca"))?;
    fs::write(layout.index(), "")?;
    fs::write(layout.root().join("serial"), "01\n")?;
    Ok(Reply::ok(format!(
        "\nCA creation complete and you may now import and sign cert requests.\nYour new CA certificate file for publishing is at:\n{}\n",
        layout.ca_cert().display()
    )))
}

fn build_full(layout: &PkiLayout, name: &str, server: bool) -> io::Result<Reply> {
    if let Some(reply) = require_ca(layout) {
        return Ok(reply);
    }
    if layout.request(name).exists() {
        return Ok(Reply::error(format!(
            "Request file already exists. Aborting build to avoid overwriting this file.\nIf you wish to continue, please use a different name.\nConflicting file found at:\n* {}",
            layout.request(name).display()
        )));
    }
    fs::write(layout.private_key(name), pem("PRIVATE KEY", name))?;
    fs::write(layout.request(name), pem("CERTIFICATE REQUEST", name))?;
    let path = issue(layout, name, server)?;
    Ok(Reply::ok(format!("Certificate created at: {}\n", path.display())))
}

fn import_req(layout: &PkiLayout, source: &Path, name: &str) -> io::Result<Reply> {
    if let Some(reply) = require_pki(layout) {
        return Ok(reply);
    }
    let content = match fs::read_to_string(source) {
        Ok(content) => content,
        Err(_) => {
            return Ok(Reply::error(format!(
                "The input file does not appear to be a certificate request. Aborting import.\nFile Path: {}",
                source.display()
            )))
        }
    };
    if !content.contains("BEGIN CERTIFICATE REQUEST") {
        return Ok(Reply::error(format!(
            "The input file does not appear to be a certificate request. Aborting import.\nFile Path: {}",
            source.display()
        )));
    }
    if layout.request(name).exists() {
        return Ok(Reply::error(format!(
            "Unable to import the request as the destination file already exists.\nPlease choose a different name for your imported request file.\nExisting file at: {}",
            layout.request(name).display()
        )));
    }
    fs::write(layout.request(name), content)?;
    Ok(Reply::ok(format!(
        "\nThe request has been successfully imported with a short name of: {}\nYou may now use this name to perform signing operations on this request.\n",
        name
    )))
}

fn sign_req(layout: &PkiLayout, kind: &str, name: &str) -> io::Result<Reply> {
    if let Some(reply) = require_ca(layout) {
        return Ok(reply);
    }
    if !layout.request(name).is_file() {
        return Ok(Reply::error(format!(
            "No request found for the input: '{}'\nExpected to find the request at: {}",
            name,
            layout.request(name).display()
        )));
    }
    if layout.issued_cert(name).exists() {
        return Ok(Reply::error(format!(
            "Cannot sign this request for '{}'.\nConflicting certificate already exists at:\n* {}",
            name,
            layout.issued_cert(name).display()
        )));
    }
    let path = issue(layout, name, kind == "server")?;
    Ok(Reply::ok(format!("Certificate created at: {}\n", path.display())))
}

fn revoke(layout: &PkiLayout, name: &str, reason: &str) -> io::Result<Reply> {
    if let Some(reply) = require_ca(layout) {
        return Ok(reply);
    }
    let index = fs::read_to_string(layout.index()).unwrap_or_default();
    let subject = format!("/CN={}", name);
    let mut lines: Vec<String> = index.lines().map(str::to_string).collect();

    let target = lines
        .iter()
        .rposition(|l| l.starts_with("V\t") && l.ends_with(&subject));
    let Some(target) = target else {
        if lines.iter().any(|l| l.starts_with("R\t") && l.ends_with(&subject)) {
            return Ok(Reply::error(format!("ERROR:Already revoked, certificate for {}", name)));
        }
        return Ok(Reply::error(format!(
            "Unable to revoke as no certificate was found.\nCertificate was expected at:\n* {}",
            layout.issued_cert(name).display()
        )));
    };

    let mut fields: Vec<String> = lines[target].split('\t').map(str::to_string).collect();
    let serial = fields.get(3).cloned().unwrap_or_default();
    fields[0] = "R".to_string();
    fields[2] = format!("{},{}", asn1_now(), reason);
    lines[target] = fields.join("\t");
    fs::write(layout.index(), format!("{}\n", lines.join("\n")))?;

    fs::create_dir_all(layout.revoked_certs_dir())?;
    if layout.issued_cert(name).is_file() {
        fs::rename(layout.issued_cert(name), layout.revoked_cert(&serial))?;
    }
    let revoked = layout.root().join("revoked");
    for (from, sub, ext) in [
        (layout.private_key(name), "private_by_serial", "key"),
        (layout.request(name), "reqs_by_serial", "req"),
    ] {
        if from.is_file() {
            let dir = revoked.join(sub);
            fs::create_dir_all(&dir)?;
            fs::rename(from, dir.join(format!("{}.{}", serial, ext)))?;
        }
    }

    Ok(Reply::ok(format!(
        "Revoking Certificate {}.\nData Base Updated\n\nIMPORTANT!!!\n\nRevocation was successful. You must run gen-crl and upload a CRL to your\ninfrastructure in order to prevent the revoked cert from being accepted.\n",
        serial
    )))
}

fn gen_crl(layout: &PkiLayout) -> io::Result<Reply> {
    if let Some(reply) = require_ca(layout) {
        return Ok(reply);
    }
    let index = fs::read_to_string(layout.index()).unwrap_or_default();
    let revoked: Vec<&str> = index
        .lines()
        .filter(|l| l.starts_with("R\t"))
        .filter_map(|l| l.split('\t').nth(3))
        .collect();
    fs::write(layout.crl(), pem("X509 CRL", &revoked.join(",")))?;
    Ok(Reply::ok(format!(
        "\nAn updated CRL has been created.\nCRL file: {}\n",
        layout.crl().display()
    )))
}

/// Write the certificate and its index entry; returns the certificate path.
fn issue(layout: &PkiLayout, name: &str, server: bool) -> io::Result<PathBuf> {
    let serial_file = layout.root().join("serial");
    let current = fs::read_to_string(&serial_file).unwrap_or_else(|_| "01".to_string());
    let number = u64::from_str_radix(current.trim(), 16).unwrap_or(1);
    let serial = format!("{:02X}", number);
    fs::write(&serial_file, format!("{:02X}\n", number + 1))?;

    let now = Utc::now();
    let expires = now + ChronoDuration::days(825);
    let usage = if server {
        "TLS Web Server Authentication"
    } else {
        "TLS Web Client Authentication"
    };
    let text = format!(
        "Certificate:\n    Data:\n        Version: 3 (0x2)\n        Serial Number: {serial}\n        Issuer: CN=Easy-RSA CA\n        Validity\n            Not Before: {nb}\n            Not After : {na}\n        Subject: CN={name}\n        X509v3 extensions:\n            X509v3 Extended Key Usage: \n                {usage}\n{pem}",
        serial = serial,
        nb = now.format("%b %e %H:%M:%S %Y GMT"),
        na = expires.format("%b %e %H:%M:%S %Y GMT"),
        name = name,
        usage = usage,
        pem = pem("CERTIFICATE", name),
    );
    fs::create_dir_all(layout.issued_dir())?;
    let path = layout.issued_cert(name);
    fs::write(&path, text)?;

    let mut index = fs::read_to_string(layout.index()).unwrap_or_default();
    index.push_str(&format!(
        "V\t{}\t\t{}\tunknown\t/CN={}\n",
        expires.format("%y%m%d%H%M%SZ"),
        serial,
        name
    ));
    fs::write(layout.index(), index)?;
    Ok(path)
}

fn asn1_now() -> String {
    Utc::now().format("%y%m%d%H%M%SZ").to_string()
}

fn pem(label: &str, body: &str) -> String {
    format!("-----BEGIN {label}-----\nc3R1Yi17fQ== {body}\n-----END {label}-----\n")
}
