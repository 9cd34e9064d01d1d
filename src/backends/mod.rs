use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod stub;
pub mod system;

pub use stub::{StubFault, StubRunner};
pub use system::SystemRunner;

/// One external tool invocation. Arguments are never passed through a shell.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    /// First argument, which for Easy-RSA is the subcommand.
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Program followed by its arguments, for logs and envelopes.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![self.program.to_string_lossy().to_string()];
        line.extend(self.args.iter().cloned());
        line
    }
}

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    /// Killed by a signal nobody in this process sent.
    Signaled,
    TimedOut,
    Cancelled,
    ToolNotFound,
    SpawnFailed { permission_denied: bool, message: String },
}

/// Result of backend execution. Always produced, whatever the child did.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub command: Vec<String>,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Outcome for a child that never started.
    pub fn not_started(request: &RunRequest, status: RunStatus, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
            command: request.command_line(),
            duration_ms: 0,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            RunStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.status == RunStatus::TimedOut
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Exited(0)
    }

    /// stdout and stderr joined; Easy-RSA splits messages across both.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Shared flag an owner flips to stop an in-flight invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Executes external commands on behalf of the orchestrator.
pub trait ProcessRunner: Send + Sync {
    /// Get backend ID
    fn id(&self) -> &str;

    /// True when outcomes are simulated rather than produced by a real child.
    fn simulated(&self) -> bool {
        false
    }

    /// Run one command to completion, timeout or cancellation. Never panics
    /// on non-zero exits; every path yields a `RunOutcome`.
    fn run(&self, request: &RunRequest, cancel: &CancelToken) -> RunOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_keeps_argument_order() {
        let request = RunRequest::new("/usr/share/easy-rsa/easyrsa", "/tmp", Duration::from_secs(5))
            .arg("revoke")
            .arg("web; rm -rf /")
            .env("EASYRSA_BATCH", "1");

        assert_eq!(request.subcommand(), Some("revoke"));
        assert_eq!(
            request.command_line(),
            vec!["/usr/share/easy-rsa/easyrsa", "revoke", "web; rm -rf /"]
        );
        assert_eq!(request.env["EASYRSA_BATCH"], "1");
    }

    #[test]
    fn test_combined_output() {
        let request = RunRequest::new("easyrsa", "/tmp", Duration::from_secs(1));
        let mut outcome = RunOutcome::not_started(&request, RunStatus::Exited(1), "boom");
        assert_eq!(outcome.combined_output(), "boom");
        outcome.stdout = "partial".to_string();
        assert_eq!(outcome.combined_output(), "partial\nboom");
        assert_eq!(outcome.exit_code(), Some(1));
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
