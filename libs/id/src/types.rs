//! Id types used across the simulated cluster.

use crate::define_id;

define_id!(
    /// One launch of a local cluster. A relaunch gets a new id.
    ClusterId,
    "cluster"
);

define_id!(
    /// A worker node; stable for the lifetime of its actor.
    WorkerId,
    "wrk"
);

define_id!(
    /// A framework registered with the coordinator's allocator.
    FrameworkId,
    "fw"
);

define_id!(TaskId, "task");
