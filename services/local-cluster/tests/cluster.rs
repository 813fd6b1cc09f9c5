//! Integration tests for launching and shutting down a local cluster.
//!
//! These tests drive `LocalCluster` through its public API and observe the
//! running actors through their addresses.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use minicluster_local::actors::{
    ActorHandle, CoordinatorMessage, CoordinatorSnapshot, TaskSpec, WorkerMessage, WorkerStatus,
};
use minicluster_local::allocator::{Allocator, HierarchicalAllocator};
use minicluster_local::configuration::{
    WorkerSettings, ADMISSION_KEY, LOG_DIR_KEY, NUM_WORKERS_KEY, QUIET_KEY, RESOURCES_KEY,
    WORK_DIR_KEY,
};
use minicluster_local::{ClusterError, Configuration, LocalCluster, Resources};

use minicluster_id::TaskId;
use rstest::rstest;
use tempfile::{tempdir, TempDir};
use tokio::sync::{oneshot, Mutex};

// Only one cluster may run per process, so tests that launch take turns.
static SERIAL: Mutex<()> = Mutex::const_new(());

/// Helper to build a configuration rooted in a fresh temp directory
fn test_configuration(workers: i64) -> (Configuration, TempDir) {
    let dir = tempdir().unwrap();
    let configuration = Configuration::new()
        .with(NUM_WORKERS_KEY, workers)
        .with(QUIET_KEY, true)
        .with(RESOURCES_KEY, "cpus:1;mem:512;disk:1024")
        .with(WORK_DIR_KEY, dir.path().to_string_lossy().to_string());
    (configuration, dir)
}

async fn snapshot(coordinator: &ActorHandle<CoordinatorMessage>) -> CoordinatorSnapshot {
    let (tx, rx) = oneshot::channel();
    coordinator
        .send(CoordinatorMessage::Snapshot { reply: tx })
        .await
        .unwrap();
    rx.await.unwrap()
}

async fn status(worker: &ActorHandle<WorkerMessage>) -> WorkerStatus {
    let (tx, rx) = oneshot::channel();
    worker.send(WorkerMessage::Status { reply: tx }).await.unwrap();
    rx.await.unwrap()
}

/// Poll the coordinator until `n` workers have registered
async fn wait_for_workers(coordinator: &ActorHandle<CoordinatorMessage>, n: usize) -> CoordinatorSnapshot {
    for _ in 0..100 {
        let snap = snapshot(coordinator).await;
        if snap.workers.len() == n {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} workers never registered", n);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn test_launch_spawns_coordinator_and_workers(#[case] n: usize) {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(n as i64);
    let mut cluster = LocalCluster::new();

    let coordinator = cluster.launch(&configuration, None).await.unwrap();
    assert!(cluster.is_running());
    assert_eq!(cluster.coordinator(), Some(&coordinator));

    let workers = cluster.workers();
    assert_eq!(workers.len(), n);

    let mut ids: BTreeSet<String> = workers.iter().map(|w| w.actor_id().to_string()).collect();
    ids.insert(coordinator.actor_id().to_string());
    assert_eq!(ids.len(), n + 1);

    let snap = wait_for_workers(&coordinator, n).await;
    assert!(snap.elected);
    for worker in &workers {
        assert!(status(worker).await.registered);
    }

    cluster.shutdown().await;
    assert!(!cluster.is_running());
    assert!(coordinator.is_closed());
    assert!(workers.iter().all(|w| w.is_closed()));
}

#[tokio::test]
async fn test_second_launch_is_rejected() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(1);
    let (other, _other_dir) = test_configuration(2);
    let mut cluster = LocalCluster::new();

    let coordinator = cluster.launch(&configuration, None).await.unwrap();

    let err = cluster.launch(&other, None).await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyRunning));
    let err = cluster.launch_with(0, 1.0, 64, 64, true, None).await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyRunning));

    // The running cluster is untouched.
    assert_eq!(cluster.coordinator(), Some(&coordinator));
    assert_eq!(cluster.workers().len(), 1);
    assert!(!coordinator.is_closed());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_without_cluster_is_noop() {
    let _serial = SERIAL.lock().await;
    let mut cluster = LocalCluster::new();
    cluster.shutdown().await;
    cluster.shutdown().await;
    assert!(!cluster.is_running());
    assert!(cluster.workers().is_empty());
}

#[tokio::test]
async fn test_relaunch_after_shutdown() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(2);
    let mut cluster = LocalCluster::new();

    let first = cluster.launch(&configuration, None).await.unwrap();
    let first_id = cluster.cluster_id().unwrap();
    cluster.shutdown().await;

    let second = cluster.launch(&configuration, None).await.unwrap();
    assert_ne!(first, second);
    assert_ne!(cluster.cluster_id(), Some(first_id));
    assert!(!second.is_closed());
    wait_for_workers(&second, 2).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_owned_allocator_is_released() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(2);
    let mut cluster = LocalCluster::new();

    let coordinator = cluster.launch(&configuration, None).await.unwrap();
    wait_for_workers(&coordinator, 2).await;

    let allocator = Arc::downgrade(&cluster.allocator().unwrap());
    assert!(allocator.upgrade().is_some());

    cluster.shutdown().await;
    assert!(allocator.upgrade().is_none());
}

#[tokio::test]
async fn test_supplied_allocator_survives_shutdown() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(2);
    let mut cluster = LocalCluster::new();

    let allocator = Arc::new(HierarchicalAllocator::with_drf());
    let coordinator = cluster
        .launch(&configuration, Some(allocator.clone() as Arc<dyn Allocator>))
        .await
        .unwrap();
    wait_for_workers(&coordinator, 2).await;
    assert_eq!(allocator.worker_count(), 2);

    cluster.shutdown().await;
    assert_eq!(Arc::strong_count(&allocator), 1);
    // Still usable; the coordinator removed its workers on the way out.
    assert_eq!(allocator.worker_count(), 0);
}

#[tokio::test]
async fn test_work_dirs_are_distinct_per_worker() {
    let _serial = SERIAL.lock().await;
    let (configuration, dir) = test_configuration(3);
    let mut cluster = LocalCluster::new();
    cluster.launch(&configuration, None).await.unwrap();

    let work_dirs = cluster.work_dirs();
    assert_eq!(
        work_dirs,
        vec![dir.path().join("0"), dir.path().join("1"), dir.path().join("2")]
    );
    assert!(work_dirs.iter().all(|d| d.is_dir()));

    let mut reported = BTreeSet::new();
    for worker in cluster.workers() {
        reported.insert(status(&worker).await.work_dir);
    }
    assert_eq!(reported.len(), 3);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_detector_references_every_actor() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(3);
    let mut cluster = LocalCluster::new();
    let coordinator = cluster.launch(&configuration, None).await.unwrap();

    let detector = cluster.detector().unwrap();
    assert_eq!(detector.coordinator(), &coordinator);
    assert_eq!(detector.workers(), cluster.workers().as_slice());

    cluster.shutdown().await;
    assert!(cluster.detector().is_none());
}

#[tokio::test]
async fn test_scenario_three_workers() {
    let _serial = SERIAL.lock().await;
    let mut cluster = LocalCluster::new();

    let coordinator = cluster.launch_with(3, 1.0, 512, 1024, true, None).await.unwrap();
    let snap = wait_for_workers(&coordinator, 3).await;
    for worker in &snap.workers {
        assert_eq!(worker.resources, Resources::from_parts(1.0, 512, 1024));
    }

    let base = WorkerSettings::default().work_dir;
    let expected: Vec<_> = (0..3).map(|i| base.join(i.to_string())).collect();
    assert_eq!(cluster.work_dirs(), expected);

    let files = cluster.files().unwrap();
    assert_eq!(files.attached().len(), 3);

    cluster.shutdown().await;
    assert!(files.attached().is_empty());
    assert_eq!(Arc::strong_count(&files), 1);
}

#[tokio::test]
async fn test_failed_coordinator_start_fails_launch() {
    let _serial = SERIAL.lock().await;
    let (configuration, dir) = test_configuration(2);
    let taken = dir.path().join("taken");
    std::fs::write(&taken, b"").unwrap();
    let broken = configuration
        .clone()
        .with(LOG_DIR_KEY, taken.join("log").to_string_lossy().to_string());
    let mut cluster = LocalCluster::new();

    let err = cluster.launch(&broken, None).await.unwrap_err();
    assert!(matches!(err, ClusterError::ActorStart { .. }), "{err}");
    assert_eq!(err.reason_code(), "actor_start_failed");
    assert!(!cluster.is_running());
    assert!(cluster.coordinator().is_none());
    assert!(cluster.workers().is_empty());

    // Nothing was left claimed.
    cluster.launch(&configuration, None).await.unwrap();
    assert!(cluster.is_running());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_second_orchestrator_is_refused() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(1);
    let mut first = LocalCluster::new();
    let mut second = LocalCluster::new();

    first.launch(&configuration, None).await.unwrap();
    let err = second.launch(&configuration, None).await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyRunning), "{err}");
    assert!(!second.is_running());
    assert!(first.is_running());

    first.shutdown().await;
    second.launch(&configuration, None).await.unwrap();
    assert!(second.is_running());
    second.shutdown().await;
}

#[tokio::test]
async fn test_admission_list_rejects_unknown_hosts() {
    let _serial = SERIAL.lock().await;
    let (configuration, _dir) = test_configuration(2);
    let configuration = configuration.with(ADMISSION_KEY, "db1,db2");
    let mut cluster = LocalCluster::new();

    let coordinator = cluster.launch(&configuration, None).await.unwrap();
    let workers = cluster.workers();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(snapshot(&coordinator).await.workers.is_empty());
    for worker in &workers {
        assert!(!status(worker).await.registered);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_task_runs_in_worker_sandbox() {
    let _serial = SERIAL.lock().await;
    let (configuration, dir) = test_configuration(1);
    let mut cluster = LocalCluster::new();
    cluster.launch(&configuration, None).await.unwrap();
    let worker = cluster.workers().remove(0);

    let task_id = TaskId::new();
    let (tx, rx) = oneshot::channel();
    let task = TaskSpec {
        task_id,
        command: "echo hello > greeting".to_string(),
        resources: Resources::from_parts(0.5, 64, 0),
    };
    worker.send(WorkerMessage::RunTask { task, reply: tx }).await.unwrap();
    let sandbox = rx.await.unwrap().unwrap();
    assert!(sandbox.starts_with(dir.path().join("0")));

    for _ in 0..100 {
        if !status(&worker).await.finished.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let contents = std::fs::read_to_string(sandbox.join("greeting")).unwrap();
    assert_eq!(contents.trim(), "hello");
    assert!(Path::new(&sandbox).is_dir());

    cluster.shutdown().await;
}
