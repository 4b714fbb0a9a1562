//! Cluster membership.
//!
//! Members are identified by opaque URI strings; the URI scheme also selects
//! the transport protocol. A member is either a voting `Member` or a passive
//! `Listener` that receives replicated state but never votes or counts
//! toward quorum.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque member identifier. The scheme prefix (e.g. `tcp://`, `local://`)
/// selects the transport.
pub type Uri = String;

/// The type of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// A voting member. Counts toward quorum.
    Member,
    /// A passive member that receives replicated state but does not vote.
    Listener,
}

/// The liveness state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Responding normally.
    Alive,
    /// Missed recent responses.
    Suspicious,
    /// Considered gone; listeners in this state are dropped.
    Dead,
}

/// Information about a single member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// The member URI.
    pub uri: Uri,
    /// Voting member or passive listener.
    pub member_type: MemberType,
    /// Liveness state.
    pub state: MemberState,
}

impl MemberInfo {
    /// Creates info for a voting member.
    pub fn member(uri: impl Into<Uri>) -> Self {
        Self {
            uri: uri.into(),
            member_type: MemberType::Member,
            state: MemberState::Alive,
        }
    }

    /// Creates info for a listener.
    pub fn listener(uri: impl Into<Uri>) -> Self {
        Self {
            uri: uri.into(),
            member_type: MemberType::Listener,
            state: MemberState::Alive,
        }
    }
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?},{:?})", self.uri, self.member_type, self.state)
    }
}

/// The membership view of a single resource.
///
/// Voting members are fixed by configuration; listeners may come and go at
/// runtime. Quorum is a strict majority of voting members only.
#[derive(Debug, Clone)]
pub struct Members {
    local: MemberInfo,
    remote: BTreeMap<Uri, MemberInfo>,
}

impl Members {
    /// Builds the membership view for `local_uri` given the configured set
    /// of voting member URIs. A local URI absent from the configured set is
    /// a listener.
    pub fn new(local_uri: &str, member_uris: impl IntoIterator<Item = Uri>) -> Self {
        let mut remote = BTreeMap::new();
        let mut local_is_member = false;
        for uri in member_uris {
            if uri == local_uri {
                local_is_member = true;
            } else {
                remote.insert(uri.clone(), MemberInfo::member(uri));
            }
        }
        let local = if local_is_member {
            MemberInfo::member(local_uri)
        } else {
            MemberInfo::listener(local_uri)
        };
        Self { local, remote }
    }

    /// The local member.
    pub fn local(&self) -> &MemberInfo {
        &self.local
    }

    /// The local member URI.
    pub fn local_uri(&self) -> &str {
        &self.local.uri
    }

    /// True if the local member votes.
    pub fn local_is_voter(&self) -> bool {
        self.local.member_type == MemberType::Member
    }

    /// All remote members, listeners included.
    pub fn remote(&self) -> impl Iterator<Item = &MemberInfo> {
        self.remote.values()
    }

    /// Remote voting members.
    pub fn remote_voters(&self) -> impl Iterator<Item = &MemberInfo> {
        self.remote
            .values()
            .filter(|m| m.member_type == MemberType::Member)
    }

    /// Looks up a member by URI (local included).
    pub fn get(&self, uri: &str) -> Option<&MemberInfo> {
        if uri == self.local.uri {
            Some(&self.local)
        } else {
            self.remote.get(uri)
        }
    }

    /// Number of voting members, local included.
    pub fn voter_count(&self) -> usize {
        let remote = self.remote_voters().count();
        if self.local_is_voter() {
            remote + 1
        } else {
            remote
        }
    }

    /// Votes required for a strict majority of voting members.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Inserts or updates a remote member. Used by the coordinator to track
    /// listeners joining at runtime.
    pub fn update(&mut self, info: MemberInfo) {
        if info.uri != self.local.uri {
            self.remote.insert(info.uri.clone(), info);
        }
    }

    /// Removes a remote member, returning its info.
    pub fn remove(&mut self, uri: &str) -> Option<MemberInfo> {
        self.remote.remove(uri)
    }
}
