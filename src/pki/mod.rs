pub mod index;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod state;
pub mod templates;
pub mod validation;
pub mod worker;

pub use model::{
    CaStatus, CertificateCounts, CertificateRecord, CertificateStatus, CertificateType, CrlState, PkiDirectory,
    PkiLayout, RevocationReason, SigningRequest,
};
pub use orchestrator::{PkiCommand, PkiOrchestrator};
pub use state::{PkiState, StateError};
pub use templates::{TemplateProvider, VarsDirectory};
pub use worker::PkiWorker;
