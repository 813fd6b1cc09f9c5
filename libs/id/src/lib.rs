//! # minicluster-id
//!
//! Typed identifiers for the pieces of a simulated cluster.
//!
//! Every id renders as `{prefix}_{ulid}`:
//!
//! - `cluster_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `wrk_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `fw_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a worker id from being passed where a framework id is
//! expected, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod typed;
mod types;

pub use error::IdError;
pub use typed::TypedId;
pub use types::*;

/// Re-exported so the `define_id!` expansion resolves in downstream crates.
pub use ulid::Ulid;
