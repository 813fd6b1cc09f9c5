//! Isolation strategies.
//!
//! Each worker owns exactly one isolator. The worker calls into it to launch
//! and kill executors, and the isolator calls back into the worker (through
//! the address in [`WorkerLink`]) when an executor exits. The worker also
//! calls [`Isolator::shutdown`] while it processes its own termination, so
//! an isolator must stay alive until its worker has confirmed it stopped.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use minicluster_id::{TaskId, WorkerId};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actors::{ActorHandle, WorkerMessage};
use crate::resources::Resources;

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("isolator has not been initialized")]
    NotInitialized,

    #[error("executor {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("unknown executor {0}")]
    UnknownExecutor(TaskId),

    #[error("failed to launch executor {task_id}: {source}")]
    Launch {
        task_id: TaskId,
        #[source]
        source: std::io::Error,
    },
}

/// What an isolator knows about the worker it serves.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    pub worker_id: WorkerId,
    pub work_dir: PathBuf,
    /// True when the worker runs inside a simulated local cluster.
    pub local: bool,
    /// Address used to report executor exits back to the worker.
    pub worker: ActorHandle<WorkerMessage>,
}

/// An executor to run for a task.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub task_id: TaskId,
    /// Shell command, run with `sh -c`.
    pub command: String,
    pub resources: Resources,
}

/// Enforces resource and process boundaries for the tasks of one worker.
#[async_trait]
pub trait Isolator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once by the worker when it starts.
    async fn initialize(&self, worker: WorkerLink) -> Result<(), IsolationError>;

    /// Start an executor in `directory`. Its exit is reported to the worker
    /// as [`WorkerMessage::ExecutorExited`].
    async fn launch_executor(
        &self,
        executor: ExecutorSpec,
        directory: PathBuf,
    ) -> Result<(), IsolationError>;

    async fn kill_executor(&self, task_id: &TaskId) -> Result<(), IsolationError>;

    /// Called by the worker while it is terminating. Stops every executor.
    async fn shutdown(&self);
}

/// Builds one isolator per worker.
pub type IsolatorFactory = Arc<dyn Fn() -> Arc<dyn Isolator> + Send + Sync>;

/// Factory for the default [`ProcessIsolator`].
pub fn process_isolator_factory() -> IsolatorFactory {
    Arc::new(|| Arc::new(ProcessIsolator::new()) as Arc<dyn Isolator>)
}

// =============================================================================
// Process isolator
// =============================================================================

struct RunningExecutor {
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct ProcessState {
    link: Option<WorkerLink>,
    executors: HashMap<TaskId, RunningExecutor>,
}

/// Runs each executor as a plain child process, with no further isolation.
#[derive(Default)]
pub struct ProcessIsolator {
    state: Arc<Mutex<ProcessState>>,
}

impl ProcessIsolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.lock().executors.len()
    }

    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<ProcessState>) -> MutexGuard<'_, ProcessState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output_file(directory: &Path, name: &str, task_id: &TaskId) -> Result<Stdio, IsolationError> {
    File::create(directory.join(name))
        .map(Stdio::from)
        .map_err(|source| IsolationError::Launch {
            task_id: *task_id,
            source,
        })
}

#[async_trait]
impl Isolator for ProcessIsolator {
    fn name(&self) -> &str {
        "process"
    }

    async fn initialize(&self, worker: WorkerLink) -> Result<(), IsolationError> {
        debug!(
            worker_id = %worker.worker_id,
            work_dir = %worker.work_dir.display(),
            local = worker.local,
            "Process isolator initialized"
        );
        self.lock().link = Some(worker);
        Ok(())
    }

    async fn launch_executor(
        &self,
        executor: ExecutorSpec,
        directory: PathBuf,
    ) -> Result<(), IsolationError> {
        let task_id = executor.task_id;
        let worker = {
            let state = self.lock();
            if state.executors.contains_key(&task_id) {
                return Err(IsolationError::AlreadyRunning(task_id));
            }
            state.link.as_ref().ok_or(IsolationError::NotInitialized)?.worker.clone()
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&executor.command)
            .current_dir(&directory)
            .stdin(Stdio::null())
            .stdout(output_file(&directory, "stdout", &task_id)?)
            .stderr(output_file(&directory, "stderr", &task_id)?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolationError::Launch { task_id, source })?;

        info!(
            task_id = %task_id,
            pid = ?child.id(),
            cpus = executor.resources.cpus(),
            mem = executor.resources.mem(),
            "Launched executor"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let shared = Arc::clone(&self.state);

        let monitor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(task_id = %task_id, error = %e, "Failed to kill executor");
                    }
                    None
                }
            };

            // The entry must exist before it can be removed.
            let _ = registered_rx.await;
            lock_state(&shared).executors.remove(&task_id);
            debug!(task_id = %task_id, status = ?status, "Executor exited");

            // The worker may be terminating and no longer reading its mailbox.
            if let Err(e) = worker.try_send(WorkerMessage::ExecutorExited { task_id, status }) {
                debug!(task_id = %task_id, error = %e, "Worker did not take executor exit");
            }
        });

        self.lock().executors.insert(
            task_id,
            RunningExecutor {
                kill: kill_tx,
                monitor,
            },
        );
        let _ = registered_tx.send(());
        Ok(())
    }

    async fn kill_executor(&self, task_id: &TaskId) -> Result<(), IsolationError> {
        let running = self
            .lock()
            .executors
            .remove(task_id)
            .ok_or(IsolationError::UnknownExecutor(*task_id))?;

        let _ = running.kill.send(());
        // The monitor reports the exit to the worker.
        let _ = running.monitor.await;
        Ok(())
    }

    async fn shutdown(&self) {
        let running: Vec<(TaskId, RunningExecutor)> = self.lock().executors.drain().collect();
        if !running.is_empty() {
            info!(count = running.len(), "Killing executors on worker shutdown");
        }

        for (task_id, executor) in running {
            let _ = executor.kill.send(());
            if executor.monitor.await.is_err() {
                warn!(task_id = %task_id, "Executor monitor did not finish cleanly");
            }
        }
    }
}
