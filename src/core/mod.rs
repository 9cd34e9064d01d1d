pub mod config;
pub mod envelope;
pub mod logging;
pub mod status;

pub use config::{ConfigError, Settings, Timeouts};
pub use envelope::{BackendInfo, Envelope, EnvelopeError, Timer};
pub use status::{AffectedEntity, FailureKind, Invocation, OperationKind, OperationResult, Outcome};
