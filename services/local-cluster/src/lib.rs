//! minicluster local cluster library
//!
//! Stands up a miniature simulated cluster inside one process: one
//! coordinator and any number of workers, wired to a shared allocator,
//! per-worker isolators, a membership detector and a static-file registry.
//!
//! ## Architecture
//!
//! ```text
//! LocalCluster
//! ├── AllocatorSlot            (owned default or caller's allocator)
//! ├── FileRegistry             (shared by every actor)
//! ├── CoordinatorActor
//! ├── WorkerActor(i) × N       (each paired with its own Isolator)
//! └── StandaloneDetector       (pre-resolved membership)
//! ```
//!
//! Construction runs top to bottom. Teardown stops the coordinator, then
//! each worker in spawn order, releasing a worker's isolator only after the
//! worker has confirmed it stopped.
//!
//! ## Modules
//!
//! - `actors`: actor runtime plus the coordinator and worker actors
//! - `cluster`: the orchestrator
//! - `configuration`: generic key/value configuration and actor settings
//! - `allocator`, `isolation`, `files`, `detector`: cluster collaborators

/// Log at `info`, or at `debug` when the component was configured quiet.
macro_rules! lifecycle {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            tracing::debug!($($arg)+)
        } else {
            tracing::info!($($arg)+)
        }
    };
}

pub mod actors;
pub mod allocator;
pub mod cluster;
pub mod config;
pub mod configuration;
pub mod detector;
pub mod error;
pub mod files;
pub mod isolation;
pub mod resources;

// Re-export commonly used types
pub use cluster::{AllocatorSlot, LocalCluster};
pub use configuration::Configuration;
pub use error::ClusterError;
pub use resources::Resources;
