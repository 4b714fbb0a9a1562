//! Cluster and log configuration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::member::Uri;

/// Configuration for a replicated resource's cluster view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The local member URI.
    pub local_member: Uri,
    /// URIs of all voting members, local included (when it votes).
    pub members: BTreeSet<Uri>,
    /// Base election timeout. The effective timeout is randomized in
    /// `[timeout, 2 * timeout]`.
    #[serde(with = "duration_millis")]
    pub election_timeout: Duration,
    /// Leader heartbeat interval. Must be shorter than the election timeout.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

impl ClusterConfig {
    /// Creates a configuration for the given local member.
    pub fn new(local_member: impl Into<Uri>) -> Self {
        Self {
            local_member: local_member.into(),
            members: BTreeSet::new(),
            election_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(250),
        }
    }

    /// Sets the voting member URIs.
    pub fn with_members(mut self, members: impl IntoIterator<Item = impl Into<Uri>>) -> Self {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the base election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.local_member.is_empty() {
            return Err(Error::Protocol("local member URI is required".into()));
        }
        if scheme_of(&self.local_member).is_none() {
            return Err(Error::Protocol(format!(
                "member URI {} has no scheme",
                self.local_member
            )));
        }
        for member in &self.members {
            if scheme_of(member).is_none() {
                return Err(Error::Protocol(format!("member URI {} has no scheme", member)));
            }
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(Error::IllegalState(format!(
                "heartbeat interval {:?} must be shorter than election timeout {:?}",
                self.heartbeat_interval, self.election_timeout
            )));
        }
        Ok(())
    }
}

/// Extracts the scheme of a member URI.
pub fn scheme_of(uri: &str) -> Option<&str> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        None
    } else {
        Some(scheme)
    }
}

/// Log retention after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Delete compacted segments immediately.
    Delete,
    /// Keep compacted segments on disk.
    Retain,
}

/// Configuration for a resource's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// The log name. Used for file names under the log directory.
    pub name: String,
    /// Directory for durable storage. `None` selects an in-memory log.
    pub directory: Option<PathBuf>,
    /// Target segment size in bytes.
    pub segment_size: u64,
    /// What happens to compacted data.
    pub retention: RetentionPolicy,
    /// Entries applied since the last snapshot before the leader takes a new
    /// one. Zero disables automatic compaction.
    pub compaction_threshold: u64,
}

impl LogConfig {
    /// Creates a log configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
            segment_size: 1024 * 1024 * 32,
            retention: RetentionPolicy::Delete,
            compaction_threshold: 0,
        }
    }

    /// Renames the log.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the storage directory, selecting the file-backed log.
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the automatic compaction threshold.
    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
