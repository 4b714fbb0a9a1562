//! Role state machines.
//!
//! Each resource is always in exactly one of four roles:
//!
//! ```text
//! Start ── open() ──▶ Follower
//! Follower ── election timeout ──▶ Candidate
//! Candidate ── majority votes ──▶ Leader
//! Candidate ── higher term | new leader appends ──▶ Follower
//! Leader ── higher term ──▶ Follower
//! Any ── close() ──▶ Start
//! ```
//!
//! Roles are a tagged variant with per-role fields; every protocol message
//! is routed through a single dispatch on the current variant, so a role
//! change swaps behavior atomically on the resource's driver task.

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::context::{Completion, StateContext};
use crate::error::Error;
use crate::log::is_up_to_date;
use crate::member::{MemberType, Uri};
use crate::rpc::{
    AppendRequest, AppendResponse, CommitRequest, Consistency, PingRequest, PingResponse,
    PollRequest, PollResponse, QueryRequest, Request, Response, SyncRequest, SyncResponse,
};
use crate::{LogIndex, Term};

/// Maximum entries shipped in a single append.
const MAX_BATCH_ENTRIES: u64 = 100;

/// Discriminant of the active role, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Closed; all protocol operations fail.
    Start,
    /// Following a leader (or waiting for one).
    Follower,
    /// Running for leadership.
    Candidate,
    /// The cluster leader.
    Leader,
}

/// The active role and its local state.
pub enum Role {
    /// Closed.
    Start,
    /// Following.
    Follower,
    /// Electing.
    Candidate(CandidateState),
    /// Leading.
    Leader(LeaderState),
}

/// Candidate-local state: votes received this term, self included.
pub struct CandidateState {
    pub(crate) votes: HashSet<Uri>,
}

/// Replication progress for one peer.
#[derive(Debug)]
pub(crate) struct Progress {
    pub(crate) next_index: LogIndex,
    pub(crate) match_index: LogIndex,
    pub(crate) in_flight: bool,
    pub(crate) syncing: bool,
}

impl Progress {
    fn new(last_index: LogIndex) -> Self {
        Self {
            next_index: last_index + 1,
            match_index: 0,
            in_flight: false,
            syncing: false,
        }
    }
}

/// A strong query waiting for a heartbeat round to confirm leadership.
pub(crate) struct BarrierQuery {
    round: u64,
    payload: Bytes,
    completion: Completion,
}

/// Leader-local state.
pub struct LeaderState {
    pub(crate) progress: HashMap<Uri, Progress>,
    /// Heartbeat round counter; acks are collected per round.
    round: u64,
    round_acks: HashSet<Uri>,
    barrier: Vec<BarrierQuery>,
}

impl LeaderState {
    fn new(peers: &[Uri], last_index: LogIndex) -> Self {
        let progress = peers
            .iter()
            .map(|uri| (uri.clone(), Progress::new(last_index)))
            .collect();
        Self {
            progress,
            round: 0,
            round_acks: HashSet::new(),
            barrier: Vec::new(),
        }
    }

    /// Starts tracking a peer that joined at runtime.
    pub(crate) fn track_peer(&mut self, uri: &str, last_index: LogIndex) {
        self.progress
            .entry(uri.to_string())
            .or_insert_with(|| Progress::new(last_index));
    }

    /// Stops tracking a removed peer.
    pub(crate) fn forget_peer(&mut self, uri: &str) {
        self.progress.remove(uri);
    }

    fn fail_barrier(&mut self) {
        for query in self.barrier.drain(..) {
            query.completion.complete(Err(Error::no_leader()));
        }
    }
}

impl StateContext {
    /// The active role's discriminant.
    pub fn role_kind(&self) -> RoleKind {
        match self.role {
            Role::Start => RoleKind::Start,
            Role::Follower => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    /// Routes an inbound protocol request to the active role.
    pub(crate) fn dispatch(
        &mut self,
        request: Request,
        responder: tokio::sync::oneshot::Sender<Response>,
    ) {
        if !self.open {
            let _ = responder.send(Response::failure_for(&request, self.term, "context closed"));
            return;
        }
        match request {
            Request::Ping(req) => {
                let resp = self.on_ping(req);
                let _ = responder.send(Response::Ping(resp));
            }
            Request::Poll(req) => {
                let resp = self.on_poll(req);
                let _ = responder.send(Response::Poll(resp));
            }
            Request::Append(req) => {
                let resp = self.on_append(req);
                let _ = responder.send(Response::Append(resp));
            }
            Request::Sync(req) => {
                let resp = self.on_sync(req);
                let _ = responder.send(Response::Sync(resp));
            }
            Request::Query(req) => {
                self.on_query(req.payload, req.consistency, Completion::Query(responder));
            }
            Request::Commit(req) => {
                self.on_commit(req.payload, Completion::Commit(responder));
            }
        }
    }

    /// Runs leader-only logic against the leader state. The closure must not
    /// transition roles; step-down decisions are made before entering.
    fn with_leader(&mut self, f: impl FnOnce(&mut Self, &mut LeaderState)) {
        let mut role = std::mem::replace(&mut self.role, Role::Start);
        if let Role::Leader(state) = &mut role {
            f(self, state);
        }
        self.role = role;
    }

    /// True for messages from a stale term, or an equal-term message that a
    /// sitting leader can ignore outright.
    fn reject_leader_message(&self, term: Term) -> bool {
        term < self.term || (term == self.term && matches!(self.role, Role::Leader(_)))
    }

    /// Common prologue for ping/append/sync with an acceptable term: adopt
    /// the term, step down if not following, record the leader, reset the
    /// election timer.
    fn recognize_leader(&mut self, term: Term, leader: &str) {
        match self.set_term(term) {
            Ok(_) => {}
            Err(e) => {
                self.fatal(&e);
                return;
            }
        }
        if !matches!(self.role, Role::Follower) {
            self.become_follower();
        }
        self.set_leader(Some(leader.to_string()));
        self.timer_reset = true;
    }

    pub(crate) fn on_ping(&mut self, req: PingRequest) -> PingResponse {
        if self.reject_leader_message(req.term) {
            return PingResponse {
                term: self.term,
                succeeded: false,
            };
        }
        self.recognize_leader(req.term, &req.leader);

        let consistent = req.last_log_index == 0
            || self.log.term_at(req.last_log_index) == Some(req.last_log_term);
        if consistent && req.commit_index > self.commit_index {
            let new_commit = req.commit_index.min(self.log.last_index());
            if new_commit > self.commit_index && self.set_commit_index(new_commit).is_ok() {
                self.apply_committed();
            }
        }
        PingResponse {
            term: self.term,
            succeeded: consistent,
        }
    }

    pub(crate) fn on_poll(&mut self, req: PollRequest) -> PollResponse {
        if req.term < self.term {
            return PollResponse {
                term: self.term,
                vote_granted: false,
            };
        }
        if req.term > self.term {
            if let Err(e) = self.set_term(req.term) {
                self.fatal(&e);
                return PollResponse {
                    term: self.term,
                    vote_granted: false,
                };
            }
            if !matches!(self.role, Role::Follower) {
                self.become_follower();
            }
        }

        // Listeners receive state but take no part in elections.
        if !self.members.local_is_voter() {
            return PollResponse {
                term: self.term,
                vote_granted: false,
            };
        }

        let log_ok = is_up_to_date(
            req.last_log_index,
            req.last_log_term,
            self.log.last_index(),
            self.log.last_term(),
        );
        let vote_free = self
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == req.candidate);

        if log_ok && vote_free && self.leader.is_none() {
            if let Err(e) = self.set_voted_for(&req.candidate) {
                self.fatal(&e);
                return PollResponse {
                    term: self.term,
                    vote_granted: false,
                };
            }
            self.timer_reset = true;
            debug!(term = self.term, candidate = %req.candidate, "vote granted");
            PollResponse {
                term: self.term,
                vote_granted: true,
            }
        } else {
            PollResponse {
                term: self.term,
                vote_granted: false,
            }
        }
    }

    pub(crate) fn on_append(&mut self, req: AppendRequest) -> AppendResponse {
        let failure = |term: Term, hint: LogIndex| AppendResponse {
            term,
            succeeded: false,
            log_index: hint,
        };

        if self.reject_leader_message(req.term) {
            return failure(self.term, self.log.last_index());
        }
        self.recognize_leader(req.term, &req.leader);

        // Consistency check on the entry preceding the batch.
        let prev_ok = req.prev_log_index == 0
            || self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
        if !prev_ok {
            let hint = if self.log.last_index() < req.prev_log_index {
                self.log.last_index()
            } else {
                req.prev_log_index.saturating_sub(1)
            };
            return failure(self.term, hint);
        }

        // Only the verified prefix counts as matched; a stale tail beyond
        // the batch is repaired by a later append.
        let batch_end = req.prev_log_index + req.entries.len() as u64;

        for entry in req.entries {
            if entry.index < self.log.first_index() {
                // Already covered by our snapshot.
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflicting suffix from a stale leader. A conflict at
                    // or below the commit index would violate leader
                    // completeness.
                    if entry.index <= self.commit_index {
                        let e = Error::IllegalState(format!(
                            "conflicting entry at committed index {}",
                            entry.index
                        ));
                        self.fatal(&e);
                        return failure(self.term, 0);
                    }
                    if let Err(e) = self.log.truncate(entry.index) {
                        self.fatal(&e.into());
                        return failure(self.term, 0);
                    }
                    self.fail_pending_from(entry.index);
                    if let Err(e) = self.log.append_entry(entry) {
                        self.fatal(&e.into());
                        return failure(self.term, 0);
                    }
                }
                None => {
                    if let Err(e) = self.log.append_entry(entry) {
                        self.fatal(&e.into());
                        return failure(self.term, 0);
                    }
                }
            }
        }

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(self.log.last_index());
            if new_commit > self.commit_index && self.set_commit_index(new_commit).is_ok() {
                self.apply_committed();
            }
        }

        AppendResponse {
            term: self.term,
            succeeded: true,
            log_index: batch_end,
        }
    }

    pub(crate) fn on_sync(&mut self, req: SyncRequest) -> SyncResponse {
        if self.reject_leader_message(req.term) {
            return SyncResponse {
                term: self.term,
                succeeded: false,
            };
        }
        self.recognize_leader(req.term, &req.leader);

        if req.offset == 0 {
            self.incoming_snapshot = Some(BytesMut::new());
        }
        let Some(buffer) = self.incoming_snapshot.as_mut() else {
            // A non-initial chunk with no transfer in progress.
            return SyncResponse {
                term: self.term,
                succeeded: false,
            };
        };
        buffer.extend_from_slice(&req.data);

        if req.done {
            let blob = self.incoming_snapshot.take().unwrap_or_default().freeze();
            match self.install_snapshot(req.snapshot_index, req.snapshot_term, blob) {
                Ok(()) => {}
                Err(Error::Log(e)) => {
                    self.fatal(&e.into());
                    return SyncResponse {
                        term: self.term,
                        succeeded: false,
                    };
                }
                Err(e) => {
                    debug!(error = %e, "snapshot install rejected");
                    return SyncResponse {
                        term: self.term,
                        succeeded: false,
                    };
                }
            }
        }
        SyncResponse {
            term: self.term,
            succeeded: true,
        }
    }

    pub(crate) fn on_commit(&mut self, payload: Bytes, completion: Completion) {
        match &self.role {
            Role::Leader(_) => self.leader_commit(payload, completion),
            Role::Follower | Role::Candidate(_) => match self.leader.clone() {
                Some(leader) if leader != self.local_uri() => {
                    self.forwards.push((
                        leader,
                        Request::Commit(CommitRequest { payload }),
                        completion,
                    ));
                }
                _ => completion.complete(Err(Error::no_leader())),
            },
            Role::Start => completion.complete(Err(Error::Closed)),
        }
    }

    fn leader_commit(&mut self, payload: Bytes, completion: Completion) {
        let index = match self.log.append(self.term, payload) {
            Ok(index) => index,
            Err(e) => {
                completion.complete(Err(Error::no_leader()));
                self.fatal(&e.into());
                return;
            }
        };
        self.pending.insert(index, completion);

        let peers: Vec<Uri> = self.members.remote().map(|m| m.uri.clone()).collect();
        self.with_leader(|ctx, state| {
            for peer in &peers {
                // A new entry supersedes any exchange already in flight.
                if let Some(progress) = state.progress.get_mut(peer.as_str()) {
                    progress.in_flight = false;
                }
                Self::send_replication(ctx, state, peer);
            }
            Self::try_advance_commit(ctx, state);
        });
    }

    pub(crate) fn on_query(
        &mut self,
        payload: Bytes,
        consistency: Consistency,
        completion: Completion,
    ) {
        if matches!(self.role, Role::Start) {
            completion.complete(Err(Error::Closed));
            return;
        }
        let is_leader = matches!(self.role, Role::Leader(_));
        match consistency {
            Consistency::Weak => self.run_query(payload, completion),
            Consistency::Lease if is_leader => self.run_query(payload, completion),
            Consistency::Strong if is_leader => {
                self.with_leader(|ctx, state| {
                    state.barrier.push(BarrierQuery {
                        round: state.round + 1,
                        payload,
                        completion,
                    });
                    Self::heartbeat_now(ctx, state);
                });
            }
            _ => match self.leader.clone() {
                Some(leader) if leader != self.local_uri() => {
                    self.forwards.push((
                        leader,
                        Request::Query(QueryRequest {
                            consistency,
                            payload,
                        }),
                        completion,
                    ));
                }
                _ => completion.complete(Err(Error::no_leader())),
            },
        }
    }

    pub(crate) fn run_query(&mut self, payload: Bytes, completion: Completion) {
        let result = match self.query_consumer.as_mut() {
            Some(query) => query(payload).map_err(|e| Error::Commit(e.to_string())),
            None => Err(Error::Commit("no query consumer registered".into())),
        };
        completion.complete(result);
    }

    /// Handles a response to a request this node sent.
    pub(crate) fn handle_response(&mut self, from: &str, response: Response) {
        match response {
            Response::Poll(resp) => self.on_poll_response(from, resp),
            Response::Append(resp) => self.on_append_response(from, resp),
            Response::Ping(resp) => self.on_ping_response(from, resp),
            Response::Sync(resp) => self.on_sync_response(from, resp),
            // Query and commit responses resolve their forward tasks
            // directly and never come back through here.
            Response::Query(_) | Response::Commit(_) => {}
        }
    }

    fn on_poll_response(&mut self, from: &str, resp: PollResponse) {
        if resp.term > self.term {
            self.step_down(resp.term);
            return;
        }
        // Only grants from voting members count toward the majority.
        let voter = self.is_voter(from);
        let promoted = if let Role::Candidate(state) = &mut self.role {
            if resp.vote_granted && resp.term == self.term && voter {
                state.votes.insert(from.to_string());
            }
            state.votes.len() >= self.members.quorum()
        } else {
            false
        };
        if promoted {
            self.become_leader();
        }
    }

    fn on_append_response(&mut self, from: &str, resp: AppendResponse) {
        if resp.term > self.term {
            self.step_down(resp.term);
            return;
        }
        let voter = self.is_voter(from);
        let from = from.to_string();
        self.with_leader(|ctx, state| {
            let Some(progress) = state.progress.get_mut(&from) else {
                return;
            };
            progress.in_flight = false;
            if resp.succeeded {
                let matched = resp.log_index.min(ctx.log.last_index());
                if matched > progress.match_index {
                    progress.match_index = matched;
                }
                progress.next_index = progress.match_index + 1;
                if voter {
                    state.round_acks.insert(from.clone());
                }
                Self::try_advance_commit(ctx, state);
                Self::flush_barrier(ctx, state);
                Self::continue_replication(ctx, state, &from);
            } else {
                // Walk back using the responder's hint, always making
                // progress.
                let fallback = progress.next_index.saturating_sub(1).max(1);
                progress.next_index = fallback.min(resp.log_index + 1).max(1);
                Self::continue_replication(ctx, state, &from);
            }
        });
    }

    fn on_ping_response(&mut self, from: &str, resp: PingResponse) {
        if resp.term > self.term {
            self.step_down(resp.term);
            return;
        }
        let voter = self.is_voter(from);
        let from = from.to_string();
        self.with_leader(|ctx, state| {
            let Some(progress) = state.progress.get_mut(&from) else {
                return;
            };
            progress.in_flight = false;
            if resp.succeeded {
                if voter {
                    state.round_acks.insert(from.clone());
                }
                Self::flush_barrier(ctx, state);
            } else {
                progress.next_index = progress.next_index.saturating_sub(1).max(1);
                Self::continue_replication(ctx, state, &from);
            }
        });
    }

    fn on_sync_response(&mut self, from: &str, resp: SyncResponse) {
        if resp.term > self.term {
            self.step_down(resp.term);
            return;
        }
        let from = from.to_string();
        self.with_leader(|ctx, state| {
            let Some(progress) = state.progress.get_mut(&from) else {
                return;
            };
            progress.in_flight = false;
            progress.syncing = false;
            if resp.succeeded {
                if let Some(snapshot) = ctx.log.snapshot() {
                    progress.match_index = progress.match_index.max(snapshot.last_included_index);
                    progress.next_index = progress.match_index + 1;
                }
                Self::continue_replication(ctx, state, &from);
            }
        });
    }

    fn is_voter(&self, uri: &str) -> bool {
        self.members
            .get(uri)
            .map_or(false, |m| m.member_type == MemberType::Member)
    }

    /// Timer events from the driver.
    pub(crate) fn on_election_timeout(&mut self) {
        match self.role {
            Role::Follower | Role::Candidate(_) => {
                self.set_leader(None);
                self.become_candidate();
            }
            _ => {}
        }
    }

    /// Heartbeat ticks from the driver.
    pub(crate) fn on_heartbeat_tick(&mut self) {
        self.with_leader(|ctx, state| {
            Self::heartbeat_now(ctx, state);
        });
    }

    pub(crate) fn become_follower(&mut self) {
        if let Role::Leader(state) = &mut self.role {
            state.fail_barrier();
        }
        self.role = Role::Follower;
        self.timer_reset = true;
        debug!(term = self.term, uri = %self.local_uri(), "became follower");
    }

    pub(crate) fn become_start(&mut self) {
        if let Role::Leader(state) = &mut self.role {
            state.fail_barrier();
        }
        self.role = Role::Start;
    }

    fn become_candidate(&mut self) {
        // Listeners never stand for election.
        if !self.members.local_is_voter() {
            self.timer_reset = true;
            return;
        }
        let next_term = self.term + 1;
        if let Err(e) = self.set_term(next_term) {
            self.fatal(&e);
            return;
        }
        let local = self.local_uri().to_string();
        if let Err(e) = self.set_voted_for(&local) {
            self.fatal(&e);
            return;
        }
        let mut votes = HashSet::new();
        votes.insert(local.clone());
        self.role = Role::Candidate(CandidateState { votes });
        self.timer_reset = true;
        debug!(term = self.term, uri = %local, "election started");

        let poll = PollRequest {
            term: self.term,
            candidate: local,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let peers: Vec<Uri> = self.members.remote_voters().map(|m| m.uri.clone()).collect();
        for peer in peers {
            self.outbox.push((peer, Request::Poll(poll.clone())));
        }

        if self.members.quorum() <= 1 {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        let last_index = self.log.last_index();
        let peers: Vec<Uri> = self.members.remote().map(|m| m.uri.clone()).collect();
        self.role = Role::Leader(LeaderState::new(&peers, last_index));
        self.set_leader(Some(self.local_uri().to_string()));
        info!(term = self.term, uri = %self.local_uri(), "elected leader");
        self.with_leader(|ctx, state| {
            Self::heartbeat_now(ctx, state);
        });
    }

    fn step_down(&mut self, term: Term) {
        if let Err(e) = self.set_term(term) {
            self.fatal(&e);
            return;
        }
        if !matches!(self.role, Role::Follower) {
            self.become_follower();
        }
    }

    /// Starts a heartbeat round: one replication exchange per peer, acks
    /// collected for strong-query barriers.
    fn heartbeat_now(ctx: &mut Self, state: &mut LeaderState) {
        state.round += 1;
        state.round_acks.clear();
        if ctx.members.local_is_voter() {
            state.round_acks.insert(ctx.local_uri().to_string());
        }
        let peers: Vec<Uri> = ctx.members.remote().map(|m| m.uri.clone()).collect();
        for peer in &peers {
            // A heartbeat supersedes any exchange lost to the network,
            // including an unacknowledged snapshot transfer.
            if let Some(progress) = state.progress.get_mut(peer) {
                progress.in_flight = false;
                progress.syncing = false;
            }
            Self::send_replication(ctx, state, peer);
        }
        Self::try_advance_commit(ctx, state);
        Self::flush_barrier(ctx, state);
    }

    /// Sends the appropriate replication message to one peer: a snapshot
    /// when the peer fell behind the compaction point, entries when it lags
    /// the log, a bare ping otherwise.
    fn send_replication(ctx: &mut Self, state: &mut LeaderState, peer: &str) {
        let Some(progress) = state.progress.get_mut(peer) else {
            return;
        };
        if progress.in_flight || progress.syncing {
            return;
        }

        if progress.next_index < ctx.log.first_index() {
            let Some(snapshot) = ctx.log.snapshot() else {
                return;
            };
            progress.in_flight = true;
            progress.syncing = true;
            ctx.outbox.push((
                peer.to_string(),
                Request::Sync(SyncRequest {
                    term: ctx.term,
                    leader: ctx.local_uri().to_string(),
                    snapshot_index: snapshot.last_included_index,
                    snapshot_term: snapshot.last_included_term,
                    offset: 0,
                    data: snapshot.data,
                    done: true,
                }),
            ));
            return;
        }

        let last_index = ctx.log.last_index();
        if progress.next_index <= last_index {
            let prev_log_index = progress.next_index - 1;
            let prev_log_term = ctx.log.term_at(prev_log_index).unwrap_or(0);
            let end = (progress.next_index + MAX_BATCH_ENTRIES).min(last_index + 1);
            let entries = match ctx.log.entries(progress.next_index, end) {
                Ok(entries) => entries,
                Err(_) => return,
            };
            progress.in_flight = true;
            ctx.outbox.push((
                peer.to_string(),
                Request::Append(AppendRequest {
                    term: ctx.term,
                    leader: ctx.local_uri().to_string(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: ctx.commit_index,
                }),
            ));
        } else {
            progress.in_flight = true;
            ctx.outbox.push((
                peer.to_string(),
                Request::Ping(PingRequest {
                    term: ctx.term,
                    leader: ctx.local_uri().to_string(),
                    last_log_index: last_index,
                    last_log_term: ctx.log.last_term(),
                    commit_index: ctx.commit_index,
                }),
            ));
        }
    }

    /// Continues catch-up after a response, but only when the peer still
    /// lags; a caught-up peer waits for the next heartbeat.
    fn continue_replication(ctx: &mut Self, state: &mut LeaderState, peer: &str) {
        let behind = state.progress.get(peer).map_or(false, |p| {
            p.next_index <= ctx.log.last_index() || p.next_index < ctx.log.first_index()
        });
        if behind {
            Self::send_replication(ctx, state, peer);
        }
    }

    /// Advances the commit index to the highest entry replicated on a
    /// majority of voters, provided it belongs to the current term.
    fn try_advance_commit(ctx: &mut Self, state: &mut LeaderState) {
        let mut indices: Vec<LogIndex> = ctx
            .members
            .remote_voters()
            .map(|m| {
                state
                    .progress
                    .get(&m.uri)
                    .map(|p| p.match_index)
                    .unwrap_or(0)
            })
            .collect();
        if ctx.members.local_is_voter() {
            indices.push(ctx.log.last_index());
        }
        indices.sort_unstable();
        indices.reverse();

        let quorum_index = ctx.members.quorum() - 1;
        if quorum_index >= indices.len() {
            return;
        }
        let candidate = indices[quorum_index];
        // Only entries from the current term advance the commit index.
        if candidate > ctx.commit_index && ctx.log.term_at(candidate) == Some(ctx.term) {
            if ctx.set_commit_index(candidate).is_ok() {
                ctx.apply_committed();
            }
        }
    }

    /// Completes strong queries whose barrier round has a majority of acks.
    fn flush_barrier(ctx: &mut Self, state: &mut LeaderState) {
        if state.barrier.is_empty() || state.round_acks.len() < ctx.members.quorum() {
            return;
        }
        let round = state.round;
        let queries = std::mem::take(&mut state.barrier);
        for query in queries {
            if query.round <= round {
                ctx.run_query(query.payload, query.completion);
            } else {
                state.barrier.push(query);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::log::{LogEntry, MemoryLog};
    use tokio::sync::oneshot;

    fn context(local: &str, members: &[&str]) -> StateContext {
        let config = ClusterConfig::new(local).with_members(members.iter().copied());
        let mut ctx = StateContext::new(config, Box::new(MemoryLog::new()), None).unwrap();
        ctx.open().unwrap();
        ctx.set_consumer(Box::new(|_, payload| Ok(payload)));
        ctx
    }

    fn append_request(term: Term, prev: (LogIndex, Term), entries: Vec<LogEntry>, commit: LogIndex) -> AppendRequest {
        AppendRequest {
            term,
            leader: "local://m1".into(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn test_open_starts_follower() {
        let ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
    }

    #[test]
    fn test_election_timeout_starts_election() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();

        assert_eq!(ctx.role_kind(), RoleKind::Candidate);
        assert_eq!(ctx.term(), 1);
        assert_eq!(ctx.voted_for.as_deref(), Some("local://m0"));

        let outbox = ctx.take_outbox();
        assert_eq!(outbox.len(), 2);
        for (_, request) in outbox {
            match request {
                Request::Poll(poll) => {
                    assert_eq!(poll.term, 1);
                    assert_eq!(poll.candidate, "local://m0");
                }
                other => panic!("expected poll, got {:?}", other.kind()),
            }
        }
    }

    #[test]
    fn test_single_node_becomes_leader_immediately() {
        let mut ctx = context("local://m0", &["local://m0"]);
        ctx.on_election_timeout();
        assert_eq!(ctx.role_kind(), RoleKind::Leader);
        assert_eq!(ctx.leader().map(|s| s.as_str()), Some("local://m0"));
    }

    #[test]
    fn test_listener_never_elects() {
        let mut ctx = context("local://watch", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
        assert_eq!(ctx.term(), 0);
    }

    #[test]
    fn test_listener_denies_votes() {
        let mut ctx = context("local://watch", &["local://m0", "local://m1", "local://m2"]);

        let resp = ctx.on_poll(PollRequest {
            term: 1,
            candidate: "local://m0".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
        // The term is still adopted.
        assert_eq!(resp.term, 1);
        assert_eq!(ctx.voted_for, None);
    }

    #[test]
    fn test_listener_votes_do_not_count() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.update_member(crate::member::MemberInfo::listener("local://watch"));
        ctx.on_election_timeout();
        ctx.take_outbox();

        // A grant from a listener does not make a majority.
        ctx.handle_response(
            "local://watch",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Candidate);

        // A voting member's grant does.
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Leader);
    }

    #[test]
    fn test_majority_votes_promote() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();
        ctx.take_outbox();

        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Leader);

        // Initial heartbeats went out.
        let outbox = ctx.take_outbox();
        assert_eq!(outbox.len(), 2);
        for (_, request) in outbox {
            assert!(matches!(request, Request::Ping(_)));
        }
    }

    #[test]
    fn test_denied_votes_do_not_promote() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: false,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Candidate);
    }

    #[test]
    fn test_candidate_steps_down_on_new_leader() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();
        assert_eq!(ctx.term(), 1);

        let resp = ctx.on_append(append_request(1, (0, 0), vec![], 0));
        assert!(resp.succeeded);
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
        assert_eq!(ctx.leader().map(|s| s.as_str()), Some("local://m1"));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() {
        let mut ctx = context("local://m0", &["local://m0"]);
        ctx.on_election_timeout();
        assert_eq!(ctx.role_kind(), RoleKind::Leader);

        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 9,
                succeeded: false,
                log_index: 0,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
        assert_eq!(ctx.term(), 9);
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);

        let resp = ctx.on_poll(PollRequest {
            term: 1,
            candidate: "local://m1".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(resp.vote_granted);

        let resp = ctx.on_poll(PollRequest {
            term: 1,
            candidate: "local://m2".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);

        // Same candidate again is granted.
        let resp = ctx.on_poll(PollRequest {
            term: 1,
            candidate: "local://m1".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(resp.vote_granted);
    }

    #[test]
    fn test_vote_denied_for_stale_log() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.log.append(1, Bytes::from("a")).unwrap();
        ctx.log.append(2, Bytes::from("b")).unwrap();
        ctx.set_term(2).unwrap();

        // Candidate's log ends at a lower term.
        let resp = ctx.on_poll(PollRequest {
            term: 3,
            candidate: "local://m1".into(),
            last_log_index: 5,
            last_log_term: 1,
        });
        assert!(!resp.vote_granted);
        assert_eq!(ctx.voted_for, None);

        // Candidate with an up-to-date log gets the vote.
        let resp = ctx.on_poll(PollRequest {
            term: 3,
            candidate: "local://m2".into(),
            last_log_index: 2,
            last_log_term: 2,
        });
        assert!(resp.vote_granted);
    }

    #[test]
    fn test_vote_denied_stale_term() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        ctx.set_term(5).unwrap();

        let resp = ctx.on_poll(PollRequest {
            term: 3,
            candidate: "local://m1".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        ctx.set_term(5).unwrap();

        let resp = ctx.on_append(append_request(3, (0, 0), vec![], 0));
        assert!(!resp.succeeded);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_append_rejects_prev_mismatch() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        // Leader believes we have an entry at index 3.
        let resp = ctx.on_append(append_request(1, (3, 1), vec![], 0));
        assert!(!resp.succeeded);
        // Hint points at our actual log end.
        assert_eq!(resp.log_index, 0);
    }

    #[test]
    fn test_append_accepts_and_commits() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        let entries = vec![
            LogEntry::new(1, 1, Bytes::from("a")),
            LogEntry::new(2, 1, Bytes::from("b")),
        ];
        let resp = ctx.on_append(append_request(1, (0, 0), entries, 1));
        assert!(resp.succeeded);
        assert_eq!(resp.log_index, 2);
        assert_eq!(ctx.commit_index(), 1);
        assert_eq!(ctx.last_applied(), 1);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        // Entries 1..=3 from term 1.
        let entries = (1..=3)
            .map(|i| LogEntry::new(i, 1, Bytes::from(format!("old{}", i))))
            .collect();
        ctx.on_append(append_request(1, (0, 0), entries, 1));

        // A new leader in term 2 replaces 2..=3.
        let entries = vec![
            LogEntry::new(2, 2, Bytes::from("new2")),
            LogEntry::new(3, 2, Bytes::from("new3")),
        ];
        let resp = ctx.on_append(append_request(2, (1, 1), entries, 1));
        assert!(resp.succeeded);

        assert_eq!(ctx.log.term_at(1), Some(1));
        assert_eq!(ctx.log.term_at(2), Some(2));
        assert_eq!(ctx.log.term_at(3), Some(2));
        assert_eq!(ctx.log.get(2).unwrap().payload, Bytes::from("new2"));
    }

    #[test]
    fn test_append_idempotent_for_existing_entries() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        let entries = vec![LogEntry::new(1, 1, Bytes::from("a"))];
        ctx.on_append(append_request(1, (0, 0), entries.clone(), 0));
        let resp = ctx.on_append(append_request(1, (0, 0), entries, 0));
        assert!(resp.succeeded);
        assert_eq!(ctx.log.last_index(), 1);
    }

    #[test]
    fn test_ping_advances_commit() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        let entries = vec![
            LogEntry::new(1, 1, Bytes::from("a")),
            LogEntry::new(2, 1, Bytes::from("b")),
        ];
        ctx.on_append(append_request(1, (0, 0), entries, 0));
        assert_eq!(ctx.commit_index(), 0);

        let resp = ctx.on_ping(PingRequest {
            term: 1,
            leader: "local://m1".into(),
            last_log_index: 2,
            last_log_term: 1,
            commit_index: 2,
        });
        assert!(resp.succeeded);
        assert_eq!(ctx.commit_index(), 2);
        assert_eq!(ctx.last_applied(), 2);
    }

    #[test]
    fn test_ping_inconsistent_log() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        let resp = ctx.on_ping(PingRequest {
            term: 1,
            leader: "local://m1".into(),
            last_log_index: 5,
            last_log_term: 1,
            commit_index: 5,
        });
        assert!(!resp.succeeded);
        assert_eq!(ctx.commit_index(), 0);
    }

    #[test]
    fn test_leader_commit_single_node() {
        let mut ctx = context("local://m0", &["local://m0"]);
        ctx.on_election_timeout();
        assert_eq!(ctx.role_kind(), RoleKind::Leader);

        let (tx, mut rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("hello"), Completion::Submit(tx));

        assert_eq!(ctx.commit_index(), 1);
        assert_eq!(ctx.last_applied(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("hello"));
    }

    #[test]
    fn test_leader_commit_requires_majority() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();

        let (tx, mut rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("x"), Completion::Submit(tx));
        assert_eq!(ctx.commit_index(), 0);
        assert!(rx.try_recv().is_err());

        // One follower acknowledging makes a majority of three.
        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 1,
                succeeded: true,
                log_index: 1,
            }),
        );
        assert_eq!(ctx.commit_index(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("x"));
    }

    #[test]
    fn test_commit_only_current_term() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);

        // Entries from term 1 land while following.
        let entries = vec![LogEntry::new(1, 1, Bytes::from("old"))];
        ctx.on_append(append_request(1, (0, 0), entries, 0));

        // This node wins term 2.
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 2,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();

        // Both followers hold the term-1 entry, but it must not commit
        // until a term-2 entry covers it.
        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 2,
                succeeded: true,
                log_index: 1,
            }),
        );
        assert_eq!(ctx.commit_index(), 0);

        let (tx, _rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("new"), Completion::Submit(tx));
        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 2,
                succeeded: true,
                log_index: 2,
            }),
        );
        // The term-2 entry commits, carrying the term-1 entry with it.
        assert_eq!(ctx.commit_index(), 2);
    }

    #[test]
    fn test_follower_forwards_commit() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        ctx.on_append(append_request(1, (0, 0), vec![], 0));
        assert_eq!(ctx.leader().map(|s| s.as_str()), Some("local://m1"));

        let (tx, _rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("cmd"), Completion::Submit(tx));

        let forwards = ctx.take_forwards();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].0, "local://m1");
        assert!(matches!(forwards[0].1, Request::Commit(_)));
    }

    #[test]
    fn test_commit_without_leader_fails() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);

        let (tx, mut rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("cmd"), Completion::Submit(tx));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::Cluster(crate::error::ClusterError::NoLeader))
        ));
    }

    #[test]
    fn test_weak_query_local() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        ctx.set_query_consumer(Box::new(|payload| Ok(payload)));

        let (tx, mut rx) = oneshot::channel();
        ctx.on_query(Bytes::from("q"), Consistency::Weak, Completion::Submit(tx));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("q"));
    }

    #[test]
    fn test_strong_query_waits_for_heartbeat_round() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.set_query_consumer(Box::new(|payload| Ok(payload)));
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();

        let (tx, mut rx) = oneshot::channel();
        ctx.on_query(Bytes::from("q"), Consistency::Strong, Completion::Submit(tx));
        // Not served until a round of heartbeats succeeds.
        assert!(rx.try_recv().is_err());

        ctx.handle_response(
            "local://m1",
            Response::Ping(PingResponse {
                term: 1,
                succeeded: true,
            }),
        );
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("q"));
    }

    #[test]
    fn test_strong_query_single_node_immediate() {
        let mut ctx = context("local://m0", &["local://m0"]);
        ctx.set_query_consumer(Box::new(|payload| Ok(payload)));
        ctx.on_election_timeout();

        let (tx, mut rx) = oneshot::channel();
        ctx.on_query(Bytes::from("q"), Consistency::Strong, Completion::Submit(tx));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("q"));
    }

    #[test]
    fn test_step_down_fails_barrier_queries() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        ctx.set_query_consumer(Box::new(|payload| Ok(payload)));
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );

        let (tx, mut rx) = oneshot::channel();
        ctx.on_query(Bytes::from("q"), Consistency::Strong, Completion::Submit(tx));

        // A higher term forces a step-down before the round completes.
        ctx.handle_response(
            "local://m1",
            Response::Ping(PingResponse {
                term: 5,
                succeeded: false,
            }),
        );
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cluster(_))));
    }

    #[test]
    fn test_replication_walks_back_on_rejection() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        // Local log has entries 1..=3 from a prior term.
        for i in 1..=3u8 {
            ctx.log.append(1, Bytes::from(vec![i])).unwrap();
        }
        ctx.set_term(1).unwrap();
        ctx.on_election_timeout(); // Term 2.
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 2,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();

        // The follower rejects; its log ends at index 1.
        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 2,
                succeeded: false,
                log_index: 1,
            }),
        );

        let outbox = ctx.take_outbox();
        assert_eq!(outbox.len(), 1);
        match &outbox[0].1 {
            Request::Append(req) => {
                assert_eq!(req.prev_log_index, 1);
                assert_eq!(req.entries.first().map(|e| e.index), Some(2));
            }
            other => panic!("expected append, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_leader_ships_snapshot_to_lagging_peer() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        for i in 1..=5u8 {
            ctx.log.append(1, Bytes::from(vec![i])).unwrap();
        }
        ctx.set_term(1).unwrap();
        ctx.set_snapshotter(Box::new(|| Ok(Bytes::from("state"))));
        ctx.set_commit_index(5).unwrap();
        ctx.apply_committed();
        ctx.take_snapshot().unwrap();
        assert_eq!(ctx.log.first_index(), 6);

        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 2,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();

        // Peer reports a log far behind the compaction point.
        ctx.handle_response(
            "local://m1",
            Response::Append(AppendResponse {
                term: 2,
                succeeded: false,
                log_index: 2,
            }),
        );
        let outbox = ctx.take_outbox();
        assert_eq!(outbox.len(), 1);
        match &outbox[0].1 {
            Request::Sync(req) => {
                assert_eq!(req.snapshot_index, 5);
                assert!(req.done);
                assert_eq!(req.data, Bytes::from("state"));
            }
            other => panic!("expected sync, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_follower_installs_snapshot() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        let installed = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let sink = installed.clone();
        ctx.set_installer(Box::new(move |data| {
            *sink.lock() = Some(data);
            Ok(())
        }));
        ctx.log.append(1, Bytes::from("stale")).unwrap();

        let resp = ctx.on_sync(SyncRequest {
            term: 2,
            leader: "local://m1".into(),
            snapshot_index: 100,
            snapshot_term: 2,
            offset: 0,
            data: Bytes::from("blob"),
            done: true,
        });
        assert!(resp.succeeded);
        assert_eq!(ctx.last_applied(), 100);
        assert_eq!(ctx.commit_index(), 100);
        assert_eq!(ctx.log.first_index(), 101);
        assert_eq!(installed.lock().clone(), Some(Bytes::from("blob")));

        // Appends after the snapshot land normally.
        let entries = vec![LogEntry::new(101, 2, Bytes::from("next"))];
        let resp = ctx.on_append(append_request(2, (100, 2), entries, 101));
        assert!(resp.succeeded);
        assert_eq!(ctx.last_applied(), 101);
    }

    #[test]
    fn test_sync_chunked_transfer() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1"]);
        let installed = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let sink = installed.clone();
        ctx.set_installer(Box::new(move |data| {
            *sink.lock() = Some(data);
            Ok(())
        }));

        let chunk = |offset, data: &str, done| SyncRequest {
            term: 1,
            leader: "local://m1".into(),
            snapshot_index: 10,
            snapshot_term: 1,
            offset,
            data: Bytes::from(data.to_string()),
            done,
        };
        assert!(ctx.on_sync(chunk(0, "hello ", false)).succeeded);
        assert!(ctx.on_sync(chunk(6, "world", true)).succeeded);
        assert_eq!(installed.lock().clone(), Some(Bytes::from("hello world")));
    }

    #[test]
    fn test_overwritten_pending_fails() {
        let mut ctx = context("local://m0", &["local://m0", "local://m1", "local://m2"]);
        // Leader in term 1 with an uncommitted entry.
        ctx.on_election_timeout();
        ctx.handle_response(
            "local://m1",
            Response::Poll(PollResponse {
                term: 1,
                vote_granted: true,
            }),
        );
        ctx.take_outbox();
        let (tx, mut rx) = oneshot::channel();
        ctx.on_commit(Bytes::from("orphan"), Completion::Submit(tx));
        assert!(rx.try_recv().is_err());

        // A new leader overwrites index 1 with its own entry.
        let entries = vec![LogEntry::new(1, 2, Bytes::from("winner"))];
        let resp = ctx.on_append(append_request(2, (0, 0), entries, 1));
        assert!(resp.succeeded);
        assert_eq!(ctx.role_kind(), RoleKind::Follower);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cluster(_))));
        assert_eq!(ctx.log.get(1).unwrap().payload, Bytes::from("winner"));
    }
}
