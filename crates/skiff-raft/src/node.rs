//! The per-resource driver.
//!
//! Each replicated resource owns a serial execution context: one tokio task
//! that holds the [`StateContext`] and processes every event in arrival
//! order (inbound protocol requests, peer responses, client submissions,
//! timer expiries). Nothing else ever touches the context, which is what
//! makes the role logic lock-free.
//!
//! Outbound work never blocks the driver: requests queued by the role logic
//! are shipped on spawned tasks, and their responses come back through the
//! same inbox as ordinary events.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::debug;

use crate::context::{
    Completion, Consumer, ElectionEvent, Installer, QueryConsumer, Snapshotter, StateContext,
};
use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::member::{MemberInfo, Uri};
use crate::role::RoleKind;
use crate::rpc::{Consistency, Request, Response, ResponseStatus};
use crate::{LogIndex, Term};

/// Sends a protocol request to a peer and returns its response. Installed by
/// the router; implementations resolve the member URI to a transport client.
pub trait Outbound: Send + Sync {
    /// Sends `request` to the member at `uri`.
    fn send(
        &self,
        uri: &str,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send>>;
}

/// An event on a resource's serial inbox.
pub enum Event {
    /// An inbound protocol request with its responder.
    Inbound(Request, oneshot::Sender<Response>),
    /// A peer's response to a request this node sent.
    PeerResponse(Uri, Response),
    /// A local client submission.
    Submit(Bytes, oneshot::Sender<Result<Bytes>>),
    /// A local client query.
    Query(Bytes, Consistency, oneshot::Sender<Result<Bytes>>),
    /// A membership update (listeners joining or dying).
    UpdateMember(MemberInfo),
    /// Installs the commit consumer.
    SetConsumer(Consumer),
    /// Installs the query consumer.
    SetQueryConsumer(QueryConsumer),
    /// Installs the snapshot provider.
    SetSnapshotter(Snapshotter),
    /// Installs the snapshot installer.
    SetInstaller(Installer),
    /// Snapshots the state machine and compacts the log.
    TakeSnapshot(oneshot::Sender<Result<()>>),
    /// Reads a status snapshot for introspection.
    Inspect(oneshot::Sender<StatusSnapshot>),
    /// Reads a log entry for introspection.
    ReadEntry(LogIndex, oneshot::Sender<Option<LogEntry>>),
    /// Closes the resource.
    Close(oneshot::Sender<Result<()>>),
}

/// A point-in-time view of a resource's Raft state.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// The active role.
    pub role: RoleKind,
    /// The current term.
    pub term: Term,
    /// The known leader, if any.
    pub leader: Option<Uri>,
    /// The commit index.
    pub commit_index: LogIndex,
    /// The last applied index.
    pub last_applied: LogIndex,
    /// First available log index.
    pub first_index: LogIndex,
    /// Last log index.
    pub last_index: LogIndex,
}

/// Handle to a running resource driver. Cheap to clone.
#[derive(Clone)]
pub struct ResourceHandle {
    tx: mpsc::UnboundedSender<Event>,
    events: watch::Receiver<ElectionEvent>,
}

impl ResourceHandle {
    /// Delivers an inbound protocol request and awaits the response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Inbound(request, tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Submits a command, resolving once it is committed and applied.
    pub async fn submit(&self, payload: Bytes) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Submit(payload, tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Submits a command with a deadline. On expiry the future fails with
    /// [`Error::Timeout`]; an already-appended entry is not rolled back and
    /// will still be applied if it commits.
    pub async fn submit_with_deadline(&self, payload: Bytes, deadline: Duration) -> Result<Bytes> {
        match tokio::time::timeout(deadline, self.submit(payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Runs a query at the given consistency level.
    pub async fn query(&self, payload: Bytes, consistency: Consistency) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Query(payload, consistency, tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Installs the commit consumer.
    pub fn set_consumer(&self, consumer: Consumer) -> Result<()> {
        self.send(Event::SetConsumer(consumer))
    }

    /// Installs the query consumer.
    pub fn set_query_consumer(&self, consumer: QueryConsumer) -> Result<()> {
        self.send(Event::SetQueryConsumer(consumer))
    }

    /// Installs the snapshot provider.
    pub fn set_snapshotter(&self, snapshotter: Snapshotter) -> Result<()> {
        self.send(Event::SetSnapshotter(snapshotter))
    }

    /// Installs the snapshot installer.
    pub fn set_installer(&self, installer: Installer) -> Result<()> {
        self.send(Event::SetInstaller(installer))
    }

    /// Posts a membership update.
    pub fn update_member(&self, info: MemberInfo) -> Result<()> {
        self.send(Event::UpdateMember(info))
    }

    /// Snapshots the state machine at `last_applied` and compacts the log.
    pub async fn take_snapshot(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::TakeSnapshot(tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Reads the resource's current status.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Inspect(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Reads a log entry, if present.
    pub async fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ReadEntry(index, tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Closes the resource, failing pending submissions.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Close(tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Subscribes to `(term, leader, status)` change events.
    pub fn events(&self) -> watch::Receiver<ElectionEvent> {
        self.events.clone()
    }

    fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| Error::Closed)
    }
}

/// Opens the context and spawns its driver task.
pub fn spawn(mut ctx: StateContext, outbound: Arc<dyn Outbound>) -> Result<ResourceHandle> {
    ctx.open()?;
    let events = ctx.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ResourceHandle {
        tx: tx.clone(),
        events,
    };
    tokio::spawn(run(ctx, outbound, tx, rx));
    Ok(handle)
}

async fn run(
    mut ctx: StateContext,
    outbound: Arc<dyn Outbound>,
    tx: mpsc::UnboundedSender<Event>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) {
    let mut election_deadline = Instant::now() + election_delay(&ctx);
    let mut heartbeat = interval(ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        pump(&mut ctx, &outbound, &tx);
        if ctx.take_timer_reset() {
            election_deadline = Instant::now() + election_delay(&ctx);
        }
        let electable = matches!(ctx.role_kind(), RoleKind::Follower | RoleKind::Candidate);
        let leading = ctx.role_kind() == RoleKind::Leader;

        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Close(reply)) => {
                    let result = ctx.close();
                    pump(&mut ctx, &outbound, &tx);
                    let _ = reply.send(result);
                    return;
                }
                Some(event) => handle_event(&mut ctx, event),
                None => {
                    // Every handle dropped; shut the resource down.
                    if ctx.role_kind() != RoleKind::Start {
                        let _ = ctx.close();
                    }
                    return;
                }
            },
            _ = sleep_until(election_deadline), if electable => {
                ctx.on_election_timeout();
                election_deadline = Instant::now() + election_delay(&ctx);
            }
            _ = heartbeat.tick(), if leading => {
                ctx.on_heartbeat_tick();
            }
        }
    }
}

fn handle_event(ctx: &mut StateContext, event: Event) {
    match event {
        Event::Inbound(request, responder) => ctx.dispatch(request, responder),
        Event::PeerResponse(uri, response) => ctx.handle_response(&uri, response),
        Event::Submit(payload, reply) => ctx.on_commit(payload, Completion::Submit(reply)),
        Event::Query(payload, consistency, reply) => {
            ctx.on_query(payload, consistency, Completion::Submit(reply));
        }
        Event::UpdateMember(info) => ctx.update_member(info),
        Event::SetConsumer(consumer) => ctx.set_consumer(consumer),
        Event::SetQueryConsumer(consumer) => ctx.set_query_consumer(consumer),
        Event::SetSnapshotter(snapshotter) => ctx.set_snapshotter(snapshotter),
        Event::SetInstaller(installer) => ctx.set_installer(installer),
        Event::TakeSnapshot(reply) => {
            let _ = reply.send(ctx.take_snapshot());
        }
        Event::Inspect(reply) => {
            let _ = reply.send(StatusSnapshot {
                role: ctx.role_kind(),
                term: ctx.term(),
                leader: ctx.leader().cloned(),
                commit_index: ctx.commit_index(),
                last_applied: ctx.last_applied(),
                first_index: ctx.log.first_index(),
                last_index: ctx.log.last_index(),
            });
        }
        Event::ReadEntry(index, reply) => {
            let _ = reply.send(ctx.log.get(index));
        }
        Event::Close(_) => unreachable!("close is handled by the driver loop"),
    }
}

/// Ships queued outbound requests without blocking the driver. Peer
/// responses come back as inbox events; forwarded requests resolve their
/// waiting completions directly.
fn pump(ctx: &mut StateContext, outbound: &Arc<dyn Outbound>, tx: &mpsc::UnboundedSender<Event>) {
    for (uri, request) in ctx.take_outbox() {
        let outbound = Arc::clone(outbound);
        let tx = tx.clone();
        tokio::spawn(async move {
            match outbound.send(&uri, request).await {
                Ok(response) => {
                    let _ = tx.send(Event::PeerResponse(uri, response));
                }
                Err(e) => {
                    debug!(peer = %uri, error = %e, "peer request failed");
                }
            }
        });
    }
    for (uri, request, completion) in ctx.take_forwards() {
        let outbound = Arc::clone(outbound);
        tokio::spawn(async move {
            match outbound.send(&uri, request).await {
                Ok(response) => resolve_forward(completion, response),
                Err(e) => completion.complete(Err(e)),
            }
        });
    }
}

/// Resolves a forwarded request: wire responders get the response verbatim,
/// local submitters get the decoded result.
fn resolve_forward(completion: Completion, response: Response) {
    match completion {
        Completion::Commit(tx) | Completion::Query(tx) => {
            let _ = tx.send(response);
        }
        Completion::Submit(tx) => {
            let _ = tx.send(result_from_response(response));
        }
    }
}

fn result_from_response(response: Response) -> Result<Bytes> {
    let (status, result, error) = match response {
        Response::Commit(resp) => (resp.status, resp.result, resp.error),
        Response::Query(resp) => (resp.status, resp.result, resp.error),
        other => {
            return Err(Error::Protocol(format!(
                "unexpected response to forwarded request: {:?}",
                std::mem::discriminant(&other)
            )))
        }
    };
    match status {
        ResponseStatus::Ok => Ok(result.unwrap_or_default()),
        ResponseStatus::Error => {
            let message = error.unwrap_or_else(|| "unknown error".to_string());
            if message == Error::no_leader().to_string() {
                Err(Error::no_leader())
            } else {
                Err(Error::Commit(message))
            }
        }
    }
}

fn election_delay(ctx: &StateContext) -> Duration {
    let base = ctx.config.election_timeout.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base..=base * 2))
}
