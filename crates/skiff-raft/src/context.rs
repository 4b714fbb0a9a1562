//! The per-resource Raft state context.
//!
//! A [`StateContext`] owns everything Raft needs for one replicated
//! resource: the persistent metadata (term, vote), the log, the volatile
//! commit/apply cursors, the membership view, and the currently active role.
//! All mutation happens on the resource's driver task (see [`crate::node`]),
//! so the context itself needs no locking.
//!
//! Role-specific protocol logic lives in [`crate::role`]; this module holds
//! the state, the guarded setters, the pending-submission table, and the
//! commit→apply pipeline.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::log::{Log, Snapshot};
use crate::member::{MemberInfo, MemberState, MemberType, Members, Uri};
use crate::role::Role;
use crate::rpc::{
    CommitResponse, QueryResponse, Request, Response, ResponseStatus,
};
use crate::storage::MetaStore;
use crate::{LogIndex, Term};

/// Applies a committed entry, returning the bytes handed back to the
/// submitter.
pub type Consumer = Box<dyn FnMut(LogIndex, Bytes) -> Result<Bytes> + Send>;

/// Evaluates a query against local state.
pub type QueryConsumer = Box<dyn FnMut(Bytes) -> Result<Bytes> + Send>;

/// Produces an opaque snapshot of the state machine.
pub type Snapshotter = Box<dyn FnMut() -> Result<Bytes> + Send>;

/// Installs an opaque snapshot into the state machine.
pub type Installer = Box<dyn FnMut(Bytes) -> Result<()> + Send>;

/// Whether a leader is known for the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStatus {
    /// No leader is known; an election is pending or underway.
    InProgress,
    /// A leader is known for the current term.
    Complete,
}

/// Published whenever the term, leader, or election status changes.
#[derive(Debug, Clone)]
pub struct ElectionEvent {
    /// The current term.
    pub term: Term,
    /// The known leader, if any.
    pub leader: Option<Uri>,
    /// Election status.
    pub status: ElectionStatus,
}

/// How a pending submission or query reports its outcome.
pub(crate) enum Completion {
    /// A local submission future.
    Submit(oneshot::Sender<Result<Bytes>>),
    /// A forwarded commit awaiting a wire response.
    Commit(oneshot::Sender<Response>),
    /// A forwarded query awaiting a wire response.
    Query(oneshot::Sender<Response>),
}

impl Completion {
    pub(crate) fn complete(self, result: Result<Bytes>) {
        match self {
            Completion::Submit(tx) => {
                let _ = tx.send(result);
            }
            Completion::Commit(tx) => {
                let response = match result {
                    Ok(bytes) => CommitResponse {
                        status: ResponseStatus::Ok,
                        result: Some(bytes),
                        error: None,
                    },
                    Err(e) => CommitResponse {
                        status: ResponseStatus::Error,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                let _ = tx.send(Response::Commit(response));
            }
            Completion::Query(tx) => {
                let response = match result {
                    Ok(bytes) => QueryResponse {
                        status: ResponseStatus::Ok,
                        result: Some(bytes),
                        error: None,
                    },
                    Err(e) => QueryResponse {
                        status: ResponseStatus::Error,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                let _ = tx.send(Response::Query(response));
            }
        }
    }
}

/// The Raft state for one replicated resource.
pub struct StateContext {
    pub(crate) config: ClusterConfig,
    pub(crate) members: Members,
    pub(crate) log: Box<dyn Log>,
    pub(crate) meta: Option<MetaStore>,

    pub(crate) term: Term,
    pub(crate) voted_for: Option<Uri>,
    pub(crate) leader: Option<Uri>,
    pub(crate) status: ElectionStatus,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) role: Role,
    pub(crate) open: bool,

    pub(crate) consumer: Option<Consumer>,
    pub(crate) query_consumer: Option<QueryConsumer>,
    pub(crate) snapshotter: Option<Snapshotter>,
    pub(crate) installer: Option<Installer>,

    /// Pending submissions keyed by log index. Entries survive role changes;
    /// they resolve when applied or fail when overwritten.
    pub(crate) pending: HashMap<LogIndex, Completion>,
    /// Requests to send to peers, drained by the driver after each event.
    pub(crate) outbox: Vec<(Uri, Request)>,
    /// Requests to forward with a waiting completion, drained by the driver.
    pub(crate) forwards: Vec<(Uri, Request, Completion)>,
    /// Set when the election timer should be re-armed.
    pub(crate) timer_reset: bool,

    pub(crate) events: watch::Sender<ElectionEvent>,
    pub(crate) compaction_threshold: u64,
    pub(crate) applied_since_snapshot: u64,
    pub(crate) incoming_snapshot: Option<BytesMut>,
}

impl StateContext {
    /// Creates a closed context over the given log.
    pub fn new(config: ClusterConfig, log: Box<dyn Log>, meta: Option<MetaStore>) -> Result<Self> {
        config.validate()?;
        let members = Members::new(&config.local_member, config.members.iter().cloned());
        let (events, _) = watch::channel(ElectionEvent {
            term: 0,
            leader: None,
            status: ElectionStatus::InProgress,
        });
        Ok(Self {
            config,
            members,
            log,
            meta,
            term: 0,
            voted_for: None,
            leader: None,
            status: ElectionStatus::InProgress,
            commit_index: 0,
            last_applied: 0,
            role: Role::Start,
            open: false,
            consumer: None,
            query_consumer: None,
            snapshotter: None,
            installer: None,
            pending: HashMap::new(),
            outbox: Vec::new(),
            forwards: Vec::new(),
            timer_reset: false,
            events,
            compaction_threshold: 0,
            applied_since_snapshot: 0,
            incoming_snapshot: None,
        })
    }

    /// Sets the automatic compaction threshold (entries applied between
    /// leader-side snapshots; zero disables).
    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Opens the context: loads durable state, opens the log, and becomes a
    /// follower with the election timer armed.
    pub fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        if let Some(meta) = &self.meta {
            self.term = meta.current_term();
            self.voted_for = meta.voted_for().cloned();
        }
        self.log.open()?;
        // Recover the apply cursor from the snapshot boundary; entries above
        // it re-apply on the next commit advance.
        if let Some(snapshot) = self.log.snapshot() {
            self.commit_index = snapshot.last_included_index;
            self.last_applied = snapshot.last_included_index;
        }
        self.open = true;
        self.become_follower();
        self.publish();
        Ok(())
    }

    /// Closes the context: transitions to Start, fails pending submissions,
    /// and closes the log.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::IllegalState("context not open".into()));
        }
        self.open = false;
        self.become_start();
        self.fail_pending(Error::no_leader);
        self.log.close()?;
        Ok(())
    }

    /// The local member URI.
    pub fn local_uri(&self) -> &str {
        self.members.local_uri()
    }

    /// The current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// The known leader, if any.
    pub fn leader(&self) -> Option<&Uri> {
        self.leader.as_ref()
    }

    /// The commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// The last applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Subscribes to `(term, leader, status)` change events.
    pub fn subscribe(&self) -> watch::Receiver<ElectionEvent> {
        self.events.subscribe()
    }

    /// Installs the commit consumer.
    pub fn set_consumer(&mut self, consumer: Consumer) {
        self.consumer = Some(consumer);
    }

    /// Installs the query consumer.
    pub fn set_query_consumer(&mut self, consumer: QueryConsumer) {
        self.query_consumer = Some(consumer);
    }

    /// Installs the snapshot provider.
    pub fn set_snapshotter(&mut self, snapshotter: Snapshotter) {
        self.snapshotter = Some(snapshotter);
    }

    /// Installs the snapshot installer.
    pub fn set_installer(&mut self, installer: Installer) {
        self.installer = Some(installer);
    }

    /// Adopts a higher term: clears the leader and vote and publishes. Terms
    /// never decrease; lower or equal terms are ignored.
    pub(crate) fn set_term(&mut self, term: Term) -> Result<bool> {
        if term <= self.term {
            return Ok(false);
        }
        self.term = term;
        self.leader = None;
        self.voted_for = None;
        self.status = ElectionStatus::InProgress;
        self.persist_meta()?;
        self.publish();
        Ok(true)
    }

    /// Records the known leader for the current term.
    pub(crate) fn set_leader(&mut self, leader: Option<Uri>) {
        match (&self.leader, &leader) {
            (None, None) => return,
            (Some(old), Some(new)) if old == new => return,
            _ => {}
        }
        self.leader = leader;
        self.status = if self.leader.is_some() {
            ElectionStatus::Complete
        } else {
            ElectionStatus::InProgress
        };
        self.publish();
    }

    /// Records a vote for the current term. Fails if a different candidate
    /// already holds the vote or a leader is known. Votes reset only on term
    /// advance; there is no mid-term unvote.
    pub(crate) fn set_voted_for(&mut self, candidate: &str) -> Result<()> {
        if let Some(voted) = &self.voted_for {
            if voted != candidate {
                return Err(Error::IllegalState(
                    "already voted for another candidate".into(),
                ));
            }
            return Ok(());
        }
        if self.leader.is_some() {
            return Err(Error::IllegalState(
                "cannot cast vote while a leader is known".into(),
            ));
        }
        self.voted_for = Some(candidate.to_string());
        self.persist_meta()?;
        Ok(())
    }

    /// Advances the commit index. Strictly increasing; a decrease is fatal.
    pub(crate) fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Err(Error::IllegalState(format!(
                "cannot move commit index from {} to {}",
                self.commit_index, index
            )));
        }
        debug_assert!(index <= self.log.last_index());
        self.commit_index = index;
        Ok(())
    }

    /// Advances the apply cursor. Strictly increasing; a decrease is fatal.
    pub(crate) fn set_last_applied(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.last_applied || index > self.commit_index {
            return Err(Error::IllegalState(format!(
                "cannot move last applied from {} to {} (commit {})",
                self.last_applied, index, self.commit_index
            )));
        }
        self.last_applied = index;
        Ok(())
    }

    fn persist_meta(&mut self) -> Result<()> {
        if let Some(meta) = &mut self.meta {
            meta.save(self.term, self.voted_for.as_deref())?;
        }
        Ok(())
    }

    pub(crate) fn publish(&self) {
        self.events.send_replace(ElectionEvent {
            term: self.term,
            leader: self.leader.clone(),
            status: self.status,
        });
    }

    /// Delivers committed entries to the consumer in index order, resolving
    /// pending submissions with the consumer's output. A consumer error
    /// fails that submission but never wedges the cursor.
    pub(crate) fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.get(index) {
                Some(entry) => entry,
                None => {
                    warn!(index, "committed entry missing from log");
                    return;
                }
            };
            let result = match self.consumer.as_mut() {
                Some(consumer) => {
                    consumer(index, entry.payload).map_err(|e| Error::Commit(e.to_string()))
                }
                None => Ok(Bytes::new()),
            };
            self.last_applied = index;
            self.applied_since_snapshot += 1;
            if let Some(completion) = self.pending.remove(&index) {
                completion.complete(result);
            }
        }
        self.maybe_compact();
    }

    /// Takes a snapshot when the configured threshold is exceeded.
    fn maybe_compact(&mut self) {
        if self.compaction_threshold == 0
            || self.applied_since_snapshot < self.compaction_threshold
            || self.snapshotter.is_none()
        {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            warn!(error = %e, "automatic compaction failed");
        }
    }

    /// Snapshots the state machine at `last_applied` and compacts the log.
    pub(crate) fn take_snapshot(&mut self) -> Result<()> {
        let through = self.last_applied;
        if through == 0 {
            return Ok(());
        }
        let snapshotter = self
            .snapshotter
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no snapshotter registered".into()))?;
        let blob = snapshotter()?;
        let term = self.log.term_at(through).unwrap_or(self.term);
        let snapshot = Snapshot::new(through, term, blob);
        self.log.compact(through, &snapshot)?;
        self.applied_since_snapshot = 0;
        debug!(through, "snapshot taken");
        Ok(())
    }

    /// Installs a snapshot received from the leader. Installing a snapshot
    /// at or below `last_applied` is a no-op.
    pub(crate) fn install_snapshot(
        &mut self,
        index: LogIndex,
        term: Term,
        data: Bytes,
    ) -> Result<()> {
        if index <= self.last_applied {
            return Ok(());
        }
        let snapshot = Snapshot::new(index, term, data.clone());
        self.log.compact(index, &snapshot)?;
        if index > self.commit_index {
            self.commit_index = index;
        }
        self.last_applied = index;
        self.applied_since_snapshot = 0;
        if let Some(installer) = self.installer.as_mut() {
            installer(data)?;
        }
        debug!(index, term, "snapshot installed");
        Ok(())
    }

    /// Fails every pending submission with a fresh error.
    pub(crate) fn fail_pending(&mut self, error: impl Fn() -> Error) {
        for (_, completion) in self.pending.drain() {
            completion.complete(Err(error()));
        }
    }

    /// Fails pending submissions at or above `from_index`; their entries
    /// were overwritten by a newer leader.
    pub(crate) fn fail_pending_from(&mut self, from_index: LogIndex) {
        let stale: Vec<LogIndex> = self
            .pending
            .keys()
            .copied()
            .filter(|&i| i >= from_index)
            .collect();
        for index in stale {
            if let Some(completion) = self.pending.remove(&index) {
                completion.complete(Err(Error::no_leader()));
            }
        }
    }

    /// Handles a fatal storage error: the context closes and all pending
    /// submissions fail. Restart is required.
    pub(crate) fn fatal(&mut self, error: &Error) {
        warn!(error = %error, "fatal error, closing context");
        self.open = false;
        self.become_start();
        self.fail_pending(Error::no_leader);
        let _ = self.log.close();
    }

    /// Drains requests queued for peers.
    pub(crate) fn take_outbox(&mut self) -> Vec<(Uri, Request)> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains forwarded requests with waiting completions.
    pub(crate) fn take_forwards(&mut self) -> Vec<(Uri, Request, Completion)> {
        std::mem::take(&mut self.forwards)
    }

    /// True if the election timer should be re-armed.
    pub(crate) fn take_timer_reset(&mut self) -> bool {
        std::mem::take(&mut self.timer_reset)
    }

    /// Inserts or updates a member (listeners joining at runtime). Dead
    /// listeners are dropped from the view.
    pub(crate) fn update_member(&mut self, info: MemberInfo) {
        if info.member_type == MemberType::Listener && info.state == MemberState::Dead {
            self.members.remove(&info.uri);
            if let Role::Leader(state) = &mut self.role {
                state.forget_peer(&info.uri);
            }
            return;
        }
        let uri = info.uri.clone();
        self.members.update(info);
        let last_index = self.log.last_index();
        if let Role::Leader(state) = &mut self.role {
            state.track_peer(&uri, last_index);
        }
    }
}
