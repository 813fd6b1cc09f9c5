//! Actor runtime and the two cluster actors.
//!
//! ```text
//! LocalCluster (orchestrator, not an actor)
//! ├── CoordinatorActor        (allocator + file registry)
//! └── WorkerActor(i) × N      (isolator(i) + file registry)
//! ```
//!
//! - `framework`: spawn / terminate / wait, addresses, actor contexts
//! - `coordinator`: the control point; admits workers into the allocator
//! - `worker`: runs tasks through its isolator

mod coordinator;
mod framework;
mod worker;

pub use coordinator::{
    CoordinatorActor, CoordinatorMessage, CoordinatorSnapshot, RegisteredWorker, COORDINATOR_LOG_PATH,
};
pub use framework::{
    spawn, Actor, ActorContext, ActorError, ActorExit, ActorHandle, ActorRef, Message,
};
pub use worker::{TaskOutcome, TaskSpec, WorkerActor, WorkerMessage, WorkerStatus};
