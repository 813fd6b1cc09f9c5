//! Worker actor - one simulated cluster node.
//!
//! The WorkerActor:
//! - Publishes its work directory through the shared file registry
//! - Registers with whichever coordinator the membership detector names
//! - Runs tasks through its isolator and tracks their outcome
//!
//! The isolator calls back into this actor (`ExecutorExited`), and this
//! actor calls `Isolator::shutdown` from `on_stop`. The isolator therefore
//! has to outlive the actor's confirmed stop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use minicluster_id::{TaskId, WorkerId};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::coordinator::CoordinatorMessage;
use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use crate::configuration::WorkerSettings;
use crate::files::FileRegistry;
use crate::isolation::{ExecutorSpec, Isolator, WorkerLink};
use crate::resources::Resources;

// =============================================================================
// Messages
// =============================================================================

/// A task to run on a worker.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub command: String,
    pub resources: Resources,
}

/// Messages handled by WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Sent by the membership detector.
    CoordinatorDetected {
        coordinator: ActorHandle<CoordinatorMessage>,
    },

    /// The coordinator admitted this worker.
    Registered { worker_id: WorkerId },

    /// The coordinator refused this worker.
    Rejected { reason: String },

    /// Run a task. Replies with the task's sandbox directory.
    RunTask {
        task: TaskSpec,
        reply: oneshot::Sender<Result<PathBuf, String>>,
    },

    KillTask { task_id: TaskId },

    /// Reported by the isolator when an executor ends.
    ExecutorExited {
        task_id: TaskId,
        status: Option<i32>,
    },

    Status { reply: oneshot::Sender<WorkerStatus> },
}

/// How a task ended. `status` is `None` when it was killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: Option<i32>,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub work_dir: PathBuf,
    pub registered: bool,
    pub coordinator: Option<String>,
    pub available: Resources,
    pub running: Vec<TaskId>,
    pub finished: Vec<TaskOutcome>,
}

// =============================================================================
// Worker Actor
// =============================================================================

/// Actor representing a single worker node.
pub struct WorkerActor {
    worker_id: WorkerId,
    settings: WorkerSettings,
    local: bool,
    isolator: Arc<dyn Isolator>,
    files: Arc<FileRegistry>,
    coordinator: Option<ActorHandle<CoordinatorMessage>>,
    registered: bool,
    available: Resources,
    running: BTreeMap<TaskId, Resources>,
    finished: Vec<TaskOutcome>,
}

impl WorkerActor {
    /// `local` marks a worker living inside a simulated in-process cluster.
    pub fn new(
        settings: WorkerSettings,
        local: bool,
        isolator: Arc<dyn Isolator>,
        files: Arc<FileRegistry>,
    ) -> Self {
        Self {
            worker_id: WorkerId::new(),
            available: settings.resources.clone(),
            settings,
            local,
            isolator,
            files,
            coordinator: None,
            registered: false,
            running: BTreeMap::new(),
            finished: Vec::new(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Virtual path of this worker's directory in the file registry.
    pub fn files_path(&self) -> String {
        format!("/workers/{}", self.worker_id)
    }

    fn register(&self, ctx: &ActorContext<WorkerMessage>) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };

        let msg = CoordinatorMessage::RegisterWorker {
            worker_id: self.worker_id,
            hostname: self.settings.hostname.clone(),
            resources: self.settings.resources.clone(),
            worker: ctx.myself(),
        };
        if let Err(e) = coordinator.try_send(msg) {
            warn!(
                worker_id = %self.worker_id,
                coordinator = %coordinator.actor_id(),
                error = %e,
                "Failed to register with coordinator"
            );
        }
    }

    async fn run_task(&mut self, task: TaskSpec) -> Result<PathBuf, String> {
        if self.running.contains_key(&task.task_id) {
            return Err(format!("task {} is already running", task.task_id));
        }
        if !self.available.contains(&task.resources) {
            return Err(format!(
                "task {} needs {} but only {} is available",
                task.task_id, task.resources, self.available
            ));
        }

        let directory = self
            .settings
            .work_dir
            .join("tasks")
            .join(task.task_id.to_string());
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| format!("sandbox {}: {}", directory.display(), e))?;

        let executor = ExecutorSpec {
            task_id: task.task_id,
            command: task.command,
            resources: task.resources.clone(),
        };
        self.isolator
            .launch_executor(executor, directory.clone())
            .await
            .map_err(|e| e.to_string())?;

        self.available -= &task.resources;
        self.running.insert(task.task_id, task.resources);
        Ok(directory)
    }

    fn executor_exited(&mut self, task_id: TaskId, status: Option<i32>) {
        let Some(resources) = self.running.remove(&task_id) else {
            debug!(task_id = %task_id, "Exit reported for unknown task");
            return;
        };
        self.available += &resources;
        self.finished.push(TaskOutcome { task_id, status });
        info!(worker_id = %self.worker_id, task_id = %task_id, status = ?status, "Task finished");
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.worker_id,
            hostname: self.settings.hostname.clone(),
            work_dir: self.settings.work_dir.clone(),
            registered: self.registered,
            coordinator: self.coordinator.as_ref().map(|c| c.actor_id().to_string()),
            available: self.available.clone(),
            running: self.running.keys().copied().collect(),
            finished: self.finished.clone(),
        }
    }
}

#[async_trait]
impl Actor for WorkerActor {
    type Message = WorkerMessage;

    fn name(&self) -> &str {
        "worker"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<WorkerMessage>) -> Result<(), ActorError> {
        let work_dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| ActorError::Permanent(format!("work dir {}: {}", work_dir.display(), e)))?;

        self.files
            .attach(work_dir, &self.files_path())
            .await
            .map_err(|e| ActorError::Permanent(e.to_string()))?;

        let link = WorkerLink {
            worker_id: self.worker_id,
            work_dir: work_dir.clone(),
            local: self.local,
            worker: ctx.myself(),
        };
        self.isolator
            .initialize(link)
            .await
            .map_err(|e| ActorError::Permanent(e.to_string()))?;

        lifecycle!(
            self.settings.quiet,
            actor_id = %ctx.actor_id,
            worker_id = %self.worker_id,
            work_dir = %work_dir.display(),
            isolator = self.isolator.name(),
            resources = %self.settings.resources,
            "Worker started"
        );
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: WorkerMessage,
        ctx: &mut ActorContext<WorkerMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            WorkerMessage::CoordinatorDetected { coordinator } => {
                debug!(
                    worker_id = %self.worker_id,
                    coordinator = %coordinator.actor_id(),
                    "Coordinator detected"
                );
                self.registered = false;
                self.coordinator = Some(coordinator);
                self.register(ctx);
            }
            WorkerMessage::Registered { worker_id } => {
                if worker_id == self.worker_id {
                    self.registered = true;
                    lifecycle!(self.settings.quiet, worker_id = %worker_id, "Registered with coordinator");
                }
            }
            WorkerMessage::Rejected { reason } => {
                warn!(worker_id = %self.worker_id, reason = %reason, "Coordinator rejected worker");
                self.registered = false;
            }
            WorkerMessage::RunTask { task, reply } => {
                let task_id = task.task_id;
                let result = self.run_task(task).await;
                if let Err(reason) = &result {
                    warn!(worker_id = %self.worker_id, task_id = %task_id, reason = %reason, "Task rejected");
                }
                let _ = reply.send(result);
            }
            WorkerMessage::KillTask { task_id } => {
                if let Err(e) = self.isolator.kill_executor(&task_id).await {
                    warn!(worker_id = %self.worker_id, task_id = %task_id, error = %e, "Failed to kill task");
                }
            }
            WorkerMessage::ExecutorExited { task_id, status } => self.executor_exited(task_id, status),
            WorkerMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext<WorkerMessage>) {
        // Calls back into the isolator; it must still be alive here.
        self.isolator.shutdown().await;
        self.files.detach(&self.files_path());

        lifecycle!(
            self.settings.quiet,
            actor_id = %ctx.actor_id,
            worker_id = %self.worker_id,
            running = self.running.len(),
            "Worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::spawn;
    use crate::isolation::ProcessIsolator;
    use std::time::Duration;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> WorkerSettings {
        WorkerSettings {
            work_dir: dir.join("0"),
            resources: Resources::from_parts(1.0, 256, 512),
            ..WorkerSettings::default()
        }
    }

    async fn status(handle: &ActorHandle<WorkerMessage>) -> WorkerStatus {
        let (tx, rx) = oneshot::channel();
        handle.send(WorkerMessage::Status { reply: tx }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_start_publishes_work_dir() {
        let dir = tempdir().unwrap();
        let files = Arc::new(FileRegistry::new());
        let worker = WorkerActor::new(
            settings(dir.path()),
            true,
            Arc::new(ProcessIsolator::new()),
            Arc::clone(&files),
        );
        let path = worker.files_path();
        let (handle, actor) = spawn(worker, 8);

        let st = status(&handle).await;
        assert!(st.work_dir.ends_with("0"));
        assert!(st.work_dir.is_dir());
        assert!(!st.registered);
        assert_eq!(files.attached(), vec![path]);

        actor.stop().await;
        assert!(files.attached().is_empty());
    }

    #[tokio::test]
    async fn test_run_task_tracks_resources_and_outcome() {
        let dir = tempdir().unwrap();
        let worker = WorkerActor::new(
            settings(dir.path()),
            true,
            Arc::new(ProcessIsolator::new()),
            Arc::new(FileRegistry::new()),
        );
        let (handle, actor) = spawn(worker, 8);

        let too_big = TaskSpec {
            task_id: TaskId::new(),
            command: "true".to_string(),
            resources: Resources::from_parts(4.0, 1, 1),
        };
        let (tx, rx) = oneshot::channel();
        handle.send(WorkerMessage::RunTask { task: too_big, reply: tx }).await.unwrap();
        assert!(rx.await.unwrap().is_err());

        let task = TaskSpec {
            task_id: TaskId::new(),
            command: "exit 0".to_string(),
            resources: Resources::from_parts(0.5, 128, 0),
        };
        let task_id = task.task_id;
        let (tx, rx) = oneshot::channel();
        handle.send(WorkerMessage::RunTask { task, reply: tx }).await.unwrap();
        let sandbox = rx.await.unwrap().unwrap();
        assert!(sandbox.ends_with(task_id.to_string()));

        let mut finished = Vec::new();
        for _ in 0..100 {
            finished = status(&handle).await.finished;
            if !finished.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(finished, vec![TaskOutcome { task_id, status: Some(0) }]);

        let st = status(&handle).await;
        assert!(st.running.is_empty());
        assert_eq!(st.available.cpus(), 1.0);

        actor.stop().await;
    }
}
