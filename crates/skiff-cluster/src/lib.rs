//! # skiff-cluster
//!
//! Coordination layer over the `skiff-raft` engine: a cluster coordinator
//! that multiplexes any number of named replicated resources onto one
//! transport server and one meta-log, the per-resource topic router, and
//! the user-facing [`StateLog`] command/query façade.
//!
//! Resource creation and deletion are themselves replicated: the
//! coordinator runs an internal Raft instance over a meta-log, and every
//! node converges on the same resource registry by replaying it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Cluster coordinator and resource registry.
pub mod coordinator;

/// Per-resource transport routing.
pub mod router;

/// The replicated state log façade.
pub mod state_log;

pub use coordinator::ClusterCoordinator;
pub use router::{ClientOutbound, Router};
pub use state_log::StateLog;
