//! The local cluster orchestrator.
//!
//! [`LocalCluster`] owns at most one running cluster, and only one cluster
//! may run per process. `launch` builds it in a fixed order (allocator, file
//! registry, coordinator, workers, detector), waiting for each actor to
//! finish starting, and `shutdown` takes it apart again:
//!
//! 1. stop the coordinator and wait, then release the allocator if owned
//! 2. for each worker in spawn order: stop and wait, then release its isolator
//! 3. release the detector, then the file registry
//!
//! A worker calls into its isolator while it stops, so an isolator is only
//! released once its worker's task has finished. A launch that fails after
//! spawning runs the same teardown over whatever it had started.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use minicluster_id::ClusterId;
use tracing::{debug, error, warn};

use crate::actors::{
    spawn, ActorError, ActorHandle, ActorRef, CoordinatorActor, CoordinatorMessage, WorkerActor,
    WorkerMessage,
};
use crate::allocator::{Allocator, HierarchicalAllocator};
use crate::configuration::Configuration;
use crate::detector::StandaloneDetector;
use crate::error::ClusterError;
use crate::files::FileRegistry;
use crate::isolation::{process_isolator_factory, Isolator, IsolatorFactory};

/// Mailbox capacity of every cluster actor.
pub const MAILBOX_SIZE: usize = 256;

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds the process-wide "a cluster is running" flag until dropped.
struct ActiveClaim;

impl ActiveClaim {
    fn acquire() -> Option<Self> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveClaim)
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

/// Who releases the allocator of a running cluster.
pub enum AllocatorSlot {
    /// Built by `launch` with the default DRF policy; released on shutdown.
    Owned(Arc<HierarchicalAllocator>),
    /// Supplied by the caller; shutdown only drops the cluster's reference.
    Borrowed(Arc<dyn Allocator>),
}

impl AllocatorSlot {
    fn resolve(allocator: Option<Arc<dyn Allocator>>) -> Self {
        match allocator {
            Some(allocator) => AllocatorSlot::Borrowed(allocator),
            None => AllocatorSlot::Owned(Arc::new(HierarchicalAllocator::with_drf())),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, AllocatorSlot::Owned(_))
    }

    /// Shared handle passed to the coordinator.
    pub fn shared(&self) -> Arc<dyn Allocator> {
        match self {
            AllocatorSlot::Owned(allocator) => allocator.clone() as Arc<dyn Allocator>,
            AllocatorSlot::Borrowed(allocator) => Arc::clone(allocator),
        }
    }
}

struct CoordinatorSlot {
    handle: ActorHandle<CoordinatorMessage>,
    actor: ActorRef,
}

struct WorkerSlot {
    isolator: Arc<dyn Isolator>,
    handle: ActorHandle<WorkerMessage>,
    actor: ActorRef,
    work_dir: PathBuf,
}

struct ClusterState {
    id: ClusterId,
    quiet: bool,
    allocator: AllocatorSlot,
    files: Arc<FileRegistry>,
    coordinator: CoordinatorSlot,
    /// Spawn order.
    workers: Vec<WorkerSlot>,
    detector: StandaloneDetector,
    claim: ActiveClaim,
}

/// Orchestrator for the process's one in-process cluster.
pub struct LocalCluster {
    isolators: IsolatorFactory,
    state: Option<ClusterState>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    /// Orchestrator whose workers run tasks with a `ProcessIsolator`.
    pub fn new() -> Self {
        Self::with_isolators(process_isolator_factory())
    }

    /// Orchestrator that builds each worker's isolator with `isolators`.
    pub fn with_isolators(isolators: IsolatorFactory) -> Self {
        Self {
            isolators,
            state: None,
        }
    }

    /// Launch `workers` workers offering the given resources each.
    ///
    /// Every host is admitted and work directories go under the default
    /// base directory.
    pub async fn launch_with(
        &mut self,
        workers: usize,
        cpus: f64,
        mem: u64,
        disk: u64,
        quiet: bool,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Result<ActorHandle<CoordinatorMessage>, ClusterError> {
        let configuration = Configuration::for_workers(workers, cpus, mem, disk, quiet);
        self.launch(&configuration, allocator).await
    }

    /// Launch a cluster described by `configuration` and return the
    /// coordinator's address once every actor has started.
    ///
    /// Without an `allocator` a default one is built and owned by the
    /// cluster. A supplied allocator stays the caller's.
    ///
    /// Fails with [`ClusterError::AlreadyRunning`] while any cluster is
    /// running in this process. On any failure no actor is left running.
    pub async fn launch(
        &mut self,
        configuration: &Configuration,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Result<ActorHandle<CoordinatorMessage>, ClusterError> {
        if self.state.is_some() {
            return Err(ClusterError::AlreadyRunning);
        }
        tokio::runtime::Handle::try_current().map_err(|_| ClusterError::NoRuntime)?;
        let claim = ActiveClaim::acquire().ok_or(ClusterError::AlreadyRunning)?;

        let num_workers = configuration.num_workers()?;
        let coordinator_settings = configuration.coordinator_settings()?;
        let worker_settings = configuration.worker_settings()?;

        let work_dirs: Vec<PathBuf> = (0..num_workers)
            .map(|i| worker_settings.work_dir.join(i.to_string()))
            .collect();
        for path in &work_dirs {
            std::fs::create_dir_all(path).map_err(|source| ClusterError::WorkDir {
                path: path.clone(),
                source,
            })?;
        }

        let id = ClusterId::new();
        let quiet = coordinator_settings.quiet;
        lifecycle!(
            quiet,
            cluster_id = %id,
            workers = num_workers,
            resources = %worker_settings.resources,
            work_dir = %worker_settings.work_dir.display(),
            "Launching local cluster"
        );

        let allocator = AllocatorSlot::resolve(allocator);
        debug!(cluster_id = %id, owned = allocator.is_owned(), "Allocator resolved");

        let files = Arc::new(FileRegistry::new());

        let coordinator = CoordinatorActor::new(allocator.shared(), Arc::clone(&files), coordinator_settings);
        let (handle, mut actor) = spawn(coordinator, MAILBOX_SIZE);
        if let Err(e) = actor.started().await {
            let err = start_failure(handle.actor_id(), e);
            stop_actors(id, CoordinatorSlot { handle, actor }, allocator, Vec::new()).await;
            return Err(err);
        }
        let coordinator = CoordinatorSlot { handle, actor };

        let mut workers = Vec::with_capacity(num_workers);
        for (i, work_dir) in work_dirs.into_iter().enumerate() {
            let isolator = (self.isolators)();
            let mut settings = worker_settings.clone();
            settings.work_dir = work_dir.clone();

            let worker = WorkerActor::new(settings, true, Arc::clone(&isolator), Arc::clone(&files));
            let worker_id = worker.worker_id();
            let (handle, mut actor) = spawn(worker, MAILBOX_SIZE);
            let started = actor.started().await;
            debug!(
                cluster_id = %id,
                worker = i,
                worker_id = %worker_id,
                actor_id = %handle.actor_id(),
                isolator = isolator.name(),
                started = started.is_ok(),
                "Worker spawned"
            );

            let failure = started.err().map(|e| start_failure(handle.actor_id(), e));
            workers.push(WorkerSlot {
                isolator,
                handle,
                actor,
                work_dir,
            });
            if let Some(err) = failure {
                stop_actors(id, coordinator, allocator, workers).await;
                return Err(err);
            }
        }

        let detector = StandaloneDetector::new(
            coordinator.handle.clone(),
            workers.iter().map(|w| w.handle.clone()).collect(),
            true,
        );

        let address = coordinator.handle.clone();
        self.state = Some(ClusterState {
            id,
            quiet,
            allocator,
            files,
            coordinator,
            workers,
            detector,
            claim,
        });

        lifecycle!(quiet, cluster_id = %id, coordinator = %address.actor_id(), "Local cluster running");
        Ok(address)
    }

    /// Stop the running cluster. A no-op when nothing is running.
    ///
    /// Each wait is unbounded: if an actor never stops, neither does this.
    pub async fn shutdown(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let ClusterState {
            id,
            quiet,
            allocator,
            files,
            coordinator,
            workers,
            detector,
            claim,
        } = state;

        lifecycle!(quiet, cluster_id = %id, workers = workers.len(), "Shutting down local cluster");

        stop_actors(id, coordinator, allocator, workers).await;
        drop(detector);
        drop(files);
        drop(claim);

        lifecycle!(quiet, cluster_id = %id, "Local cluster stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.state.as_ref().map(|s| s.id)
    }

    pub fn coordinator(&self) -> Option<&ActorHandle<CoordinatorMessage>> {
        self.state.as_ref().map(|s| &s.coordinator.handle)
    }

    /// Worker addresses in spawn order. Empty when nothing is running.
    pub fn workers(&self) -> Vec<ActorHandle<WorkerMessage>> {
        self.state
            .iter()
            .flat_map(|s| s.workers.iter().map(|w| w.handle.clone()))
            .collect()
    }

    /// Per-worker work directories in spawn order.
    pub fn work_dirs(&self) -> Vec<PathBuf> {
        self.state
            .iter()
            .flat_map(|s| s.workers.iter().map(|w| w.work_dir.clone()))
            .collect()
    }

    pub fn detector(&self) -> Option<&StandaloneDetector> {
        self.state.as_ref().map(|s| &s.detector)
    }

    pub fn files(&self) -> Option<Arc<FileRegistry>> {
        self.state.as_ref().map(|s| Arc::clone(&s.files))
    }

    pub fn allocator(&self) -> Option<Arc<dyn Allocator>> {
        self.state.as_ref().map(|s| s.allocator.shared())
    }

    /// Whether the running cluster owns its allocator.
    pub fn owns_allocator(&self) -> Option<bool> {
        self.state.as_ref().map(|s| s.allocator.is_owned())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            warn!(
                cluster_id = %state.id,
                "Local cluster dropped while running; actors are terminated without waiting"
            );
        }
    }
}

fn start_failure(actor_id: &str, e: ActorError) -> ClusterError {
    let reason = match e {
        ActorError::Permanent(reason) | ActorError::Transient(reason) => reason,
        other => other.to_string(),
    };
    error!(actor_id = %actor_id, reason = %reason, "Cluster actor failed to start");
    ClusterError::ActorStart {
        actor: actor_id.to_string(),
        reason,
    }
}

/// Stop the coordinator, release the allocator, then stop each worker and
/// release its isolator once the worker has confirmed it stopped.
async fn stop_actors(
    id: ClusterId,
    coordinator: CoordinatorSlot,
    allocator: AllocatorSlot,
    workers: Vec<WorkerSlot>,
) {
    let CoordinatorSlot { handle, actor } = coordinator;
    let exit = actor.stop().await;
    debug!(cluster_id = %id, actor_id = %handle.actor_id(), exit = ?exit, "Coordinator stopped");
    drop(handle);
    drop(allocator);

    for (i, worker) in workers.into_iter().enumerate() {
        let WorkerSlot {
            isolator,
            handle,
            actor,
            work_dir,
        } = worker;

        let exit = actor.stop().await;
        debug!(
            cluster_id = %id,
            worker = i,
            actor_id = %handle.actor_id(),
            work_dir = %work_dir.display(),
            exit = ?exit,
            "Worker stopped"
        );
        drop(isolator);
        drop(handle);
    }
}
