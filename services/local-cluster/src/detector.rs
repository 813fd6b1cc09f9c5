//! Membership detector in pre-resolved mode.
//!
//! Every address is known up front, so detection is a single broadcast at
//! construction time: the coordinator learns it is elected and every worker
//! learns where the coordinator lives.

use tracing::{debug, warn};

use crate::actors::{ActorHandle, CoordinatorMessage, WorkerMessage};

/// Detector for a cluster whose members are all spawned in-process.
pub struct StandaloneDetector {
    coordinator: ActorHandle<CoordinatorMessage>,
    workers: Vec<ActorHandle<WorkerMessage>>,
}

impl StandaloneDetector {
    /// Announce `coordinator` to every worker, in order.
    ///
    /// With `elect` set the coordinator is told it is the leader first, so
    /// it is elected before any registration reaches it.
    pub fn new(
        coordinator: ActorHandle<CoordinatorMessage>,
        workers: Vec<ActorHandle<WorkerMessage>>,
        elect: bool,
    ) -> Self {
        if elect {
            if let Err(e) = coordinator.try_send(CoordinatorMessage::Elected) {
                warn!(coordinator = %coordinator.actor_id(), error = %e, "Failed to elect coordinator");
            }
        }

        for (i, worker) in workers.iter().enumerate() {
            let msg = WorkerMessage::CoordinatorDetected {
                coordinator: coordinator.clone(),
            };
            if let Err(e) = worker.try_send(msg) {
                warn!(worker = i, actor_id = %worker.actor_id(), error = %e, "Failed to announce coordinator");
            }
        }

        debug!(
            coordinator = %coordinator.actor_id(),
            workers = workers.len(),
            "Detector resolved cluster membership"
        );

        Self {
            coordinator,
            workers,
        }
    }

    pub fn coordinator(&self) -> &ActorHandle<CoordinatorMessage> {
        &self.coordinator
    }

    /// Worker addresses in spawn order.
    pub fn workers(&self) -> &[ActorHandle<WorkerMessage>] {
        &self.workers
    }
}

impl Drop for StandaloneDetector {
    fn drop(&mut self) {
        debug!(coordinator = %self.coordinator.actor_id(), "Detector released");
    }
}
