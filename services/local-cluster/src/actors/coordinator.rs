//! Coordinator actor - the control point of a local cluster.
//!
//! The coordinator:
//! - Learns it is the elected coordinator from the membership detector
//! - Admits registering workers (checked against the admission list) and
//!   hands their resources to the allocator
//! - Registers frameworks and serves offers computed by the allocator
//!
//! The offer algorithm itself belongs to the allocator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use minicluster_id::{FrameworkId, WorkerId};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use super::worker::WorkerMessage;
use crate::allocator::{Allocator, Offer};
use crate::configuration::CoordinatorSettings;
use crate::files::FileRegistry;
use crate::resources::Resources;

/// Virtual path the coordinator publishes its log directory under.
pub const COORDINATOR_LOG_PATH: &str = "/coordinator/log";

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by CoordinatorActor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Sent by the membership detector.
    Elected,

    /// A worker asks to join the cluster.
    RegisterWorker {
        worker_id: WorkerId,
        hostname: String,
        resources: Resources,
        worker: ActorHandle<WorkerMessage>,
    },

    RegisterFramework {
        name: String,
        reply: oneshot::Sender<FrameworkId>,
    },

    UnregisterFramework { framework_id: FrameworkId },

    /// Ask the allocator for offers over all free resources.
    RequestOffers { reply: oneshot::Sender<Vec<Offer>> },

    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
}

/// A worker admitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredWorker {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub resources: Resources,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub cluster_name: String,
    pub elected: bool,
    pub workers: Vec<RegisteredWorker>,
    pub frameworks: BTreeMap<FrameworkId, String>,
}

// =============================================================================
// Coordinator Actor
// =============================================================================

/// The singleton control-plane actor of a local cluster.
pub struct CoordinatorActor {
    allocator: Arc<dyn Allocator>,
    files: Arc<FileRegistry>,
    settings: CoordinatorSettings,
    elected: bool,
    workers: BTreeMap<WorkerId, RegisteredWorker>,
    frameworks: BTreeMap<FrameworkId, String>,
}

impl CoordinatorActor {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        files: Arc<FileRegistry>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            allocator,
            files,
            settings,
            elected: false,
            workers: BTreeMap::new(),
            frameworks: BTreeMap::new(),
        }
    }

    fn register_worker(
        &mut self,
        worker_id: WorkerId,
        hostname: String,
        resources: Resources,
        worker: ActorHandle<WorkerMessage>,
    ) {
        if !self.settings.admits(&hostname) {
            warn!(
                worker_id = %worker_id,
                hostname = %hostname,
                admission = %self.settings.admission,
                "Rejecting worker not on the admission list"
            );
            let _ = worker.try_send(WorkerMessage::Rejected {
                reason: format!("host '{}' is not admitted", hostname),
            });
            return;
        }

        if !self.workers.contains_key(&worker_id) {
            self.allocator.add_worker(worker_id, resources.clone());
            self.workers.insert(
                worker_id,
                RegisteredWorker {
                    worker_id,
                    hostname: hostname.clone(),
                    resources: resources.clone(),
                },
            );
            lifecycle!(
                self.settings.quiet,
                worker_id = %worker_id,
                hostname = %hostname,
                resources = %resources,
                "Worker registered"
            );
        }

        if let Err(e) = worker.try_send(WorkerMessage::Registered { worker_id }) {
            warn!(worker_id = %worker_id, error = %e, "Failed to acknowledge worker registration");
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            cluster_name: self.settings.cluster_name.clone(),
            elected: self.elected,
            workers: self.workers.values().cloned().collect(),
            frameworks: self.frameworks.clone(),
        }
    }
}

#[async_trait]
impl Actor for CoordinatorActor {
    type Message = CoordinatorMessage;

    fn name(&self) -> &str {
        "coordinator"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<CoordinatorMessage>) -> Result<(), ActorError> {
        if let Some(log_dir) = &self.settings.log_dir {
            tokio::fs::create_dir_all(log_dir)
                .await
                .map_err(|e| ActorError::Permanent(format!("log dir {}: {}", log_dir.display(), e)))?;
            self.files
                .attach(log_dir, COORDINATOR_LOG_PATH)
                .await
                .map_err(|e| ActorError::Permanent(e.to_string()))?;
        }

        lifecycle!(
            self.settings.quiet,
            actor_id = %ctx.actor_id,
            cluster = %self.settings.cluster_name,
            allocator = self.allocator.name(),
            "Coordinator started"
        );
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: CoordinatorMessage,
        _ctx: &mut ActorContext<CoordinatorMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            CoordinatorMessage::Elected => {
                self.elected = true;
                lifecycle!(self.settings.quiet, cluster = %self.settings.cluster_name, "Elected coordinator");
            }
            CoordinatorMessage::RegisterWorker {
                worker_id,
                hostname,
                resources,
                worker,
            } => self.register_worker(worker_id, hostname, resources, worker),
            CoordinatorMessage::RegisterFramework { name, reply } => {
                let framework_id = FrameworkId::new();
                self.allocator.add_framework(framework_id);
                debug!(framework_id = %framework_id, name = %name, "Framework registered");
                self.frameworks.insert(framework_id, name);
                let _ = reply.send(framework_id);
            }
            CoordinatorMessage::UnregisterFramework { framework_id } => {
                if self.frameworks.remove(&framework_id).is_some() {
                    self.allocator.remove_framework(&framework_id);
                    debug!(framework_id = %framework_id, "Framework unregistered");
                }
            }
            CoordinatorMessage::RequestOffers { reply } => {
                let _ = reply.send(self.allocator.allocate());
            }
            CoordinatorMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext<CoordinatorMessage>) {
        // Leave a caller-supplied allocator as we found it.
        for framework_id in std::mem::take(&mut self.frameworks).into_keys() {
            self.allocator.remove_framework(&framework_id);
        }
        for worker_id in std::mem::take(&mut self.workers).into_keys() {
            self.allocator.remove_worker(&worker_id);
        }
        if self.settings.log_dir.is_some() {
            self.files.detach(COORDINATOR_LOG_PATH);
        }

        lifecycle!(self.settings.quiet, actor_id = %ctx.actor_id, "Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::spawn;
    use crate::allocator::HierarchicalAllocator;

    async fn snapshot(handle: &ActorHandle<CoordinatorMessage>) -> CoordinatorSnapshot {
        let (tx, rx) = oneshot::channel();
        handle.send(CoordinatorMessage::Snapshot { reply: tx }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_elected_and_frameworks() {
        let allocator = Arc::new(HierarchicalAllocator::with_drf());
        let coordinator = CoordinatorActor::new(
            allocator.clone(),
            Arc::new(FileRegistry::new()),
            CoordinatorSettings::default(),
        );
        let (handle, actor) = spawn(coordinator, 16);

        assert!(!snapshot(&handle).await.elected);
        handle.send(CoordinatorMessage::Elected).await.unwrap();

        let (tx, rx) = oneshot::channel();
        handle
            .send(CoordinatorMessage::RegisterFramework {
                name: "batch".to_string(),
                reply: tx,
            })
            .await
            .unwrap();
        let framework_id = rx.await.unwrap();

        let snap = snapshot(&handle).await;
        assert!(snap.elected);
        assert_eq!(snap.cluster_name, "local");
        assert_eq!(snap.frameworks.get(&framework_id).map(String::as_str), Some("batch"));

        // No workers yet, so nothing to offer.
        let (tx, rx) = oneshot::channel();
        handle.send(CoordinatorMessage::RequestOffers { reply: tx }).await.unwrap();
        assert!(rx.await.unwrap().is_empty());

        actor.stop().await;
    }

    #[tokio::test]
    async fn test_log_dir_published_and_withdrawn() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileRegistry::new());
        let settings = CoordinatorSettings {
            log_dir: Some(dir.path().join("logs")),
            ..CoordinatorSettings::default()
        };
        let coordinator = CoordinatorActor::new(
            Arc::new(HierarchicalAllocator::with_drf()),
            Arc::clone(&files),
            settings,
        );
        let (handle, actor) = spawn(coordinator, 4);

        snapshot(&handle).await;
        assert_eq!(files.attached(), vec![COORDINATOR_LOG_PATH.to_string()]);

        actor.stop().await;
        assert!(files.attached().is_empty());
    }
}
