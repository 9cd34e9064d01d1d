use log::{debug, warn};
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use which::which;

use super::{CancelToken, ProcessRunner, RunOutcome, RunRequest, RunStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs commands as real child processes.
///
/// Each child is placed in its own process group so that a timeout or a
/// cancellation can take down the whole tree (Easy-RSA is a shell script
/// that forks `openssl`), after which the child is always reaped.
pub struct SystemRunner {
    id: String,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            id: "system".to_string(),
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("pipe read ended early: {}", e);
            }
        }
        buf
    })
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", child.id(), e);
        }
    }
    // Covers platforms without process groups; harmless if already dead.
    let _ = child.kill();
    if let Err(e) = child.wait() {
        warn!("failed to reap child {}: {}", child.id(), e);
    }
}

fn spawn_status(error: &io::Error) -> RunStatus {
    match error.kind() {
        io::ErrorKind::NotFound => RunStatus::ToolNotFound,
        io::ErrorKind::PermissionDenied => RunStatus::SpawnFailed {
            permission_denied: true,
            message: error.to_string(),
        },
        _ => RunStatus::SpawnFailed {
            permission_denied: false,
            message: error.to_string(),
        },
    }
}

impl ProcessRunner for SystemRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self, request: &RunRequest, cancel: &CancelToken) -> RunOutcome {
        let program = match which(&request.program) {
            Ok(path) => path,
            Err(e) => {
                return RunOutcome::not_started(
                    request,
                    RunStatus::ToolNotFound,
                    format!("{}: {}", request.program.display(), e),
                );
            }
        };

        if !request.cwd.is_dir() {
            return RunOutcome::not_started(
                request,
                RunStatus::SpawnFailed {
                    permission_denied: false,
                    message: format!("working directory missing: {}", request.cwd.display()),
                },
                "working directory missing",
            );
        }

        let mut command = Command::new(&program);
        command
            .args(&request.args)
            .current_dir(&request.cwd)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        debug!("spawning {:?} in {}", request.command_line(), request.cwd.display());
        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let status = spawn_status(&e);
                return RunOutcome::not_started(request, status, e.to_string());
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // No deadline when the timeout is too large to represent.
        let deadline = start.checked_add(request.timeout);

        let status = loop {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    break match exit.code() {
                        Some(code) => RunStatus::Exited(code),
                        None => RunStatus::Signaled,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("lost track of child {}: {}", child.id(), e);
                    terminate(&mut child);
                    break RunStatus::SpawnFailed {
                        permission_denied: false,
                        message: e.to_string(),
                    };
                }
            }

            if cancel.is_cancelled() {
                debug!("cancelling child {}", child.id());
                terminate(&mut child);
                break RunStatus::Cancelled;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!("child {} exceeded {:?}", child.id(), request.timeout);
                terminate(&mut child);
                break RunStatus::TimedOut;
            }

            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        RunOutcome {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            command: request.command_line(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(script: &str, timeout: Duration) -> RunRequest {
        RunRequest::new("/bin/sh", std::env::temp_dir(), timeout)
            .arg("-c")
            .arg(script)
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let runner = SystemRunner::new();
        let request = RunRequest::new("/nonexistent/easyrsa", std::env::temp_dir(), Duration::from_secs(1));
        let outcome = runner.run(&request, &CancelToken::new());
        assert_eq!(outcome.status, RunStatus::ToolNotFound);
        assert!(outcome.stderr.contains("/nonexistent/easyrsa"));
    }

    #[test]
    fn test_nonzero_exit_returns_outcome() {
        let runner = SystemRunner::new();
        let request = shell("echo out; echo err >&2; exit 3", Duration::from_secs(10));
        let outcome = runner.run(&request, &CancelToken::new());
        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
    }

    #[test]
    fn test_arguments_are_not_shell_interpreted() {
        let runner = SystemRunner::new();
        let request = RunRequest::new("/bin/echo", std::env::temp_dir(), Duration::from_secs(10))
            .arg("web01; echo injected");
        let outcome = runner.run(&request, &CancelToken::new());
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "web01; echo injected\n");
    }

    #[test]
    fn test_environment_is_passed() {
        let runner = SystemRunner::new();
        let request = shell("printf %s \"$EASYRSA_PKI\"", Duration::from_secs(10)).env("EASYRSA_PKI", "/srv/pki");
        let outcome = runner.run(&request, &CancelToken::new());
        assert_eq!(outcome.stdout, "/srv/pki");
    }

    #[test]
    fn test_timeout_kills_process_tree() {
        let runner = SystemRunner::new();
        let request = shell("sleep 5 & wait; echo late", Duration::from_millis(200));
        let outcome = runner.run(&request, &CancelToken::new());
        assert!(outcome.timed_out());
        assert!(!outcome.stdout.contains("late"));
        assert!(outcome.duration_ms < 4000, "took {}ms", outcome.duration_ms);
    }

    #[test]
    fn test_cancellation_stops_child() {
        let runner = SystemRunner::new();
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let outcome = runner.run(&shell("sleep 5", Duration::from_secs(30)), &token);
        handle.join().unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.duration_ms < 4000);
    }

    #[test]
    fn test_large_output_is_fully_drained() {
        let runner = SystemRunner::new();
        let script = "i=0; while [ $i -lt 20000 ]; do echo 0123456789abcdef0123456789abcdef; echo e >&2; i=$((i+1)); done";
        let outcome = runner.run(&shell(script, Duration::from_secs(60)), &CancelToken::new());
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.len(), 20000 * 33);
        assert_eq!(outcome.stderr.len(), 20000 * 2);
    }

    #[test]
    fn test_unbounded_timeout_does_not_overflow() {
        let runner = SystemRunner::new();
        let outcome = runner.run(&shell("echo ok", Duration::MAX), &CancelToken::new());
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "ok\n");
    }

    #[test]
    fn test_missing_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let runner = SystemRunner::new();
        let request = RunRequest::new("/bin/sh", temp_dir.path().join("gone"), Duration::from_secs(1));
        let outcome = runner.run(&request, &CancelToken::new());
        assert!(matches!(outcome.status, RunStatus::SpawnFailed { permission_denied: false, .. }));
    }
}
