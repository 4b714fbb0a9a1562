//! # skiff-raft
//!
//! Replicated state-machine engine built on the Raft consensus algorithm.
//!
//! A fixed cluster of processes agrees on an ordered sequence of opaque
//! commands and applies them deterministically to a user-supplied consumer.
//! The crate provides:
//! - Linearizable command submission through the cluster leader
//! - Tunable-consistency queries (strong, lease, weak)
//! - Snapshotting and log-backed recovery
//! - Pluggable transport (in-process and TCP) and log storage (memory and
//!   file-backed)
//!
//! Each replicated resource runs on its own serial execution context (a
//! dedicated driver task); see [`node`] for the driver and [`context`] for
//! the Raft state it owns.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Cluster and log configuration.
pub mod config;

/// Raft state context and commit/apply pipeline.
pub mod context;

/// Error types.
pub mod error;

/// Log entries and log storage.
pub mod log;

/// Cluster membership.
pub mod member;

/// Per-resource driver task.
pub mod node;

/// Protocol message types.
pub mod rpc;

/// Role state machines (start, follower, candidate, leader).
pub mod role;

/// Durable log and metadata storage.
pub mod storage;

/// Network transport.
pub mod transport;

/// A position in the replicated log. Indices start at 1 and are dense.
pub type LogIndex = u64;

/// A monotonically increasing election epoch.
pub type Term = u64;

pub use config::{ClusterConfig, LogConfig, RetentionPolicy};
pub use context::{ElectionEvent, ElectionStatus, StateContext};
pub use error::{ClusterError, Error, LogError, Result};
pub use log::{Log, LogEntry, MemoryLog, Snapshot};
pub use member::{MemberInfo, MemberState, MemberType, Members, Uri};
pub use node::{spawn, Event, Outbound, ResourceHandle, StatusSnapshot};
pub use role::{Role, RoleKind};
pub use rpc::{Consistency, Request, Response};
pub use storage::{FileLog, MetaStore};
