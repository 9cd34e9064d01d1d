use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use pocketca::core::config::Settings;
use pocketca::core::envelope::{BackendInfo, Envelope, Timer};
use pocketca::core::logging::init_logging;
use pocketca::pki::{
    CaStatus, CertificateCounts, CertificateRecord, CertificateType, CrlState, PkiCommand, PkiOrchestrator,
    RevocationReason, SigningRequest,
};

/// Keyboard-free certificate authority on top of Easy-RSA
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/pocketca/settings.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// PKI directory, overriding the settings file
    #[arg(long, value_name = "DIR")]
    pki_dir: Option<PathBuf>,

    /// Easy-RSA executable, overriding the settings file
    #[arg(long, value_name = "PATH")]
    easyrsa: Option<PathBuf>,

    /// Pretty-print the JSON envelope
    #[arg(long)]
    json_pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty PKI directory
    Init,
    /// Build the certificate authority
    BuildCa {
        #[arg(long)]
        template: Option<String>,
    },
    /// Generate a key and issue a certificate for it
    Issue {
        name: String,
        #[arg(long = "type", default_value = "client")]
        cert_type: CertificateType,
        #[arg(long)]
        template: Option<String>,
    },
    /// Import a certificate request (.req) for later signing
    Import { source: PathBuf, name: String },
    /// Sign an imported request
    Sign {
        name: String,
        #[arg(long = "type", default_value = "client")]
        cert_type: CertificateType,
    },
    /// Revoke a certificate and publish a new CRL
    Revoke {
        name: String,
        #[arg(long, default_value = "unspecified")]
        reason: RevocationReason,
    },
    /// Regenerate the CRL
    GenCrl,
    /// List certificates, oldest first
    List,
    /// Show CA and CRL status
    Status,
    /// List requests waiting to be signed
    Requests,
}

impl Command {
    fn into_pki_command(self) -> Result<PkiCommand, Command> {
        Ok(match self {
            Command::Init => PkiCommand::InitPki,
            Command::BuildCa { template } => PkiCommand::BuildCa { template },
            Command::Issue {
                name,
                cert_type,
                template,
            } => PkiCommand::Issue {
                name,
                cert_type,
                template,
            },
            Command::Import { source, name } => PkiCommand::Import { source, name },
            Command::Sign { name, cert_type } => PkiCommand::Sign { name, cert_type },
            Command::Revoke { name, reason } => PkiCommand::Revoke { name, reason },
            Command::GenCrl => PkiCommand::GenerateCrl,
            query => return Err(query),
        })
    }
}

#[derive(Serialize)]
struct CertificateList {
    certificates: Vec<CertificateRecord>,
    counts: CertificateCounts,
}

#[derive(Serialize)]
struct StatusReport {
    pki_dir: PathBuf,
    ca_status: CaStatus,
    ca_cert: Option<PathBuf>,
    counts: CertificateCounts,
    crl: CrlState,
    pending_requests: usize,
}

#[derive(Serialize)]
struct RequestList {
    pending: Vec<SigningRequest>,
}

fn query(orchestrator: &PkiOrchestrator, command: &Command) -> Result<(&'static str, serde_json::Value)> {
    Ok(match command {
        Command::List => (
            "list",
            serde_json::to_value(CertificateList {
                certificates: orchestrator.list_certificates(),
                counts: orchestrator.counts(),
            })?,
        ),
        Command::Requests => (
            "requests",
            serde_json::to_value(RequestList {
                pending: orchestrator.list_pending_signing_requests(),
            })?,
        ),
        _ => (
            "status",
            serde_json::to_value(StatusReport {
                pki_dir: orchestrator.layout().root().to_path_buf(),
                ca_status: orchestrator.ca_status(),
                ca_cert: orchestrator.ca_cert_path(),
                counts: orchestrator.counts(),
                crl: orchestrator.crl_state(),
                pending_requests: orchestrator.list_pending_signing_requests().len(),
            })?,
        ),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(dir) = cli.pki_dir {
        settings.pki_dir = dir;
    }
    if let Some(bin) = cli.easyrsa {
        settings.easyrsa_bin = bin;
    }
    init_logging(&settings.log_level);

    let timer = Timer::new();
    let orchestrator = PkiOrchestrator::from_settings(&settings);
    let backend = BackendInfo::new(orchestrator.runner().id(), orchestrator.runner().simulated());

    let envelope = match cli.command.into_pki_command() {
        Ok(command) => {
            let result = orchestrator.execute(&command);
            Envelope::from_operation(&result, command.target(), backend)?
        }
        Err(command) => {
            let (verb, value) = query(&orchestrator, &command)?;
            Envelope::query(verb, value, backend, timer.elapsed_ms())
        }
    };

    println!("{}", envelope.to_json(cli.json_pretty)?);

    let code = envelope.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
