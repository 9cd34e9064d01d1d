use log::{debug, warn};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::core::status::{FailureKind, OperationResult};

use super::orchestrator::{PkiCommand, PkiOrchestrator};

type Callback = Box<dyn FnOnce(OperationResult) + Send + 'static>;

enum Reply {
    Channel(Sender<OperationResult>),
    Callback(Callback),
}

impl Reply {
    fn deliver(self, result: OperationResult) {
        match self {
            Reply::Channel(tx) => {
                if tx.send(result).is_err() {
                    debug!("result receiver dropped");
                }
            }
            Reply::Callback(callback) => callback(result),
        }
    }
}

struct Job {
    command: PkiCommand,
    reply: Reply,
}

/// Runs orchestrator commands one at a time on a dedicated thread so the
/// caller's interaction loop never blocks on Easy-RSA.
pub struct PkiWorker {
    orchestrator: Arc<PkiOrchestrator>,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PkiWorker {
    pub fn spawn(orchestrator: Arc<PkiOrchestrator>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_orchestrator = Arc::clone(&orchestrator);
        let handle = thread::Builder::new().name("pki-worker".to_string()).spawn(move || {
            for job in rx {
                debug!("worker running {:?}", job.command.operation());
                let result = worker_orchestrator.execute(&job.command);
                job.reply.deliver(result);
            }
            debug!("worker queue closed");
        })?;

        Ok(Self {
            orchestrator,
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue `command`; the result arrives on the returned receiver.
    pub fn submit(&self, command: PkiCommand) -> Receiver<OperationResult> {
        let (tx, rx) = mpsc::channel();
        self.enqueue(command, Reply::Channel(tx));
        rx
    }

    /// Queue `command`; `callback` runs on the worker thread with the result.
    pub fn submit_with<F>(&self, command: PkiCommand, callback: F)
    where
        F: FnOnce(OperationResult) + Send + 'static,
    {
        self.enqueue(command, Reply::Callback(Box::new(callback)));
    }

    /// Cancel the command currently running, if any. Queued commands still run.
    pub fn cancel(&self) -> bool {
        self.orchestrator.cancel()
    }

    pub fn orchestrator(&self) -> &Arc<PkiOrchestrator> {
        &self.orchestrator
    }

    fn enqueue(&self, command: PkiCommand, reply: Reply) {
        let job = Job { command, reply };
        let rejected = match &self.jobs {
            Some(jobs) => jobs.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(job) = rejected {
            warn!("worker is gone; rejecting {:?}", job.command.operation());
            let result = OperationResult::failure(job.command.operation(), FailureKind::ToolError, "worker stopped");
            job.reply.deliver(result);
        }
    }
}

impl Drop for PkiWorker {
    fn drop(&mut self) {
        // Closing the queue lets the thread finish what is queued and exit.
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pki worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{StubFault, StubRunner};
    use crate::core::config::Settings;
    use crate::pki::model::{CaStatus, CertificateType};
    use crate::pki::templates::NoTemplates;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn worker() -> (TempDir, Arc<StubRunner>, PkiWorker) {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            pki_dir: temp_dir.path().join("pki"),
            easyrsa_bin: "easyrsa".into(),
            working_dir: Some(temp_dir.path().to_path_buf()),
            ..Settings::default()
        };
        let runner = Arc::new(StubRunner::new());
        let orchestrator = PkiOrchestrator::new(&settings, runner.clone(), Arc::new(NoTemplates));
        let worker = PkiWorker::spawn(Arc::new(orchestrator)).unwrap();
        (temp_dir, runner, worker)
    }

    #[test]
    fn test_commands_run_in_order() {
        let (_temp_dir, _runner, worker) = worker();
        let init = worker.submit(PkiCommand::InitPki);
        let build = worker.submit(PkiCommand::BuildCa { template: None });
        let issue = worker.submit(PkiCommand::Issue {
            name: "web".to_string(),
            cert_type: CertificateType::Server,
            template: None,
        });

        assert!(init.recv_timeout(WAIT).unwrap().is_success());
        assert!(build.recv_timeout(WAIT).unwrap().is_success());
        let issued = issue.recv_timeout(WAIT).unwrap();
        assert!(issued.is_success(), "{:?}", issued);
        assert_eq!(worker.orchestrator().list_certificates().len(), 1);
    }

    #[test]
    fn test_callback_delivery() {
        let (_temp_dir, _runner, worker) = worker();
        let (tx, rx) = mpsc::channel();
        worker.submit_with(PkiCommand::GenerateCrl, move |result| {
            tx.send(result.kind).unwrap();
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(FailureKind::CaNotBuilt));
    }

    #[test]
    fn test_cancel_running_command() {
        let (_temp_dir, runner, worker) = worker();
        runner.set_fault("build-ca", StubFault::Block);
        assert!(worker.submit(PkiCommand::InitPki).recv_timeout(WAIT).unwrap().is_success());

        let build = worker.submit(PkiCommand::BuildCa { template: None });
        while runner.call_count() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.cancel());

        let result = build.recv_timeout(WAIT).unwrap();
        assert_eq!(result.kind, Some(FailureKind::Cancelled));
        assert_eq!(worker.orchestrator().ca_status(), CaStatus::Initialized);
    }

    #[test]
    fn test_drop_finishes_queued_work() {
        let (_temp_dir, runner, worker) = worker();
        let init = worker.submit(PkiCommand::InitPki);
        drop(worker);
        assert!(init.recv().unwrap().is_success());
        assert_eq!(runner.call_count(), 1);
    }
}
