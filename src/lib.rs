pub mod backends;
pub mod core;
pub mod pki;

// Re-export commonly used items
pub use crate::backends::{CancelToken, ProcessRunner, RunOutcome, RunRequest, RunStatus, StubRunner, SystemRunner};
pub use crate::core::{FailureKind, OperationKind, OperationResult, Outcome, Settings};
pub use crate::pki::{PkiCommand, PkiOrchestrator, PkiWorker};
