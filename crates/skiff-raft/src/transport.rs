//! Network transport.
//!
//! The engine sees two small traits: a [`Server`] that hands every inbound
//! message to a single handler, and a [`Client`] that sends a message to a
//! member URI and returns the response. Topic multiplexing layers on top:
//! each message is framed with a kind, a resource address, and (for topic
//! dispatch) a topic name, so many resources share one server.
//!
//! ```text
//! +---------+------------+----------------+-------------+---------+
//! | kind(4) | address(4) | [topic_len(4)  | topic(len)] | payload |
//! +---------+------------+----------------+-------------+---------+
//! ```
//!
//! kind 0 executes a remote admin task; kind 1 dispatches to a registered
//! `(address, topic)` handler.
//!
//! Two implementations ship with the crate, selected by URI scheme:
//! `local://` for in-process clusters (with partition injection for tests)
//! and `tcp://` for the wire.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::config::scheme_of;
use crate::error::{Error, Result};
use crate::member::Uri;

/// A boxed future returning `T`.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handles one inbound message, returning the response bytes.
pub type ServerHandler = Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes>> + Send + Sync>;

/// Handles one message on a registered `(address, topic)` route.
pub type TopicHandler = Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes>> + Send + Sync>;

/// Server side of a transport: accepts connections at the local URI and
/// delivers every inbound message to the installed handler.
pub trait Server: Send + Sync {
    /// Installs the message handler. Must be called before [`Server::listen`].
    fn handler(&self, handler: ServerHandler);

    /// Starts listening. Resolves once the server is accepting messages.
    fn listen(&self) -> BoxFuture<Result<()>>;

    /// Stops the server.
    fn close(&self) -> BoxFuture<()>;
}

/// Client side of a transport: sends a message to a member and returns the
/// response. Sends never block the caller's execution context.
///
/// Connections are pooled per destination and opened on first use;
/// `connect`/`disconnect` let the coordinator manage the lifecycle
/// explicitly for members that come and go at runtime (listeners).
pub trait Client: Send + Sync {
    /// Sends `message` to the member at `uri`, connecting if necessary.
    fn send(&self, uri: &str, message: Bytes) -> BoxFuture<Result<Bytes>>;

    /// Opens the connection to the member at `uri` ahead of the first send.
    /// A no-op when already connected.
    fn connect(&self, uri: &str) -> BoxFuture<Result<()>>;

    /// Drops any open connection to the member at `uri`. Subsequent sends
    /// reconnect.
    fn disconnect(&self, uri: &str) -> BoxFuture<()>;
}

/// Builds servers and clients for one URI scheme.
pub trait Protocol: Send + Sync {
    /// Creates the server listening at `uri`.
    fn server(&self, uri: &str) -> Result<Arc<dyn Server>>;

    /// Creates a client originating from `local_uri`.
    fn client(&self, local_uri: &str) -> Result<Arc<dyn Client>>;
}

/// Protocols keyed by URI scheme.
pub struct ProtocolRegistry {
    schemes: DashMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            schemes: DashMap::new(),
        }
    }

    /// Creates a registry with the built-in `tcp` protocol.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("tcp", Arc::new(TcpProtocol));
        registry
    }

    /// Registers a protocol for a scheme.
    pub fn register(&self, scheme: impl Into<String>, protocol: Arc<dyn Protocol>) {
        self.schemes.insert(scheme.into(), protocol);
    }

    /// Resolves the protocol for a member URI.
    pub fn get(&self, uri: &str) -> Result<Arc<dyn Protocol>> {
        let scheme =
            scheme_of(uri).ok_or_else(|| Error::Protocol(format!("URI {} has no scheme", uri)))?;
        self.schemes
            .get(scheme)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::Protocol(format!("no protocol registered for scheme {}", scheme)))
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Message framing.
pub mod frame {
    use super::*;

    /// Execute a remote admin task.
    pub const KIND_TASK: u32 = 0;
    /// Dispatch to an `(address, topic)` handler.
    pub const KIND_TOPIC: u32 = 1;

    /// A decoded frame.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Frame {
        /// Remote admin task execution.
        Task {
            /// Target resource address.
            address: u32,
            /// Task payload.
            payload: Bytes,
        },
        /// Topic dispatch.
        Topic {
            /// Target resource address.
            address: u32,
            /// Topic name.
            topic: String,
            /// Message payload.
            payload: Bytes,
        },
    }

    /// Encodes a topic-dispatch frame.
    pub fn encode_topic(address: u32, topic: &str, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + topic.len() + payload.len());
        buf.put_u32(KIND_TOPIC);
        buf.put_u32(address);
        buf.put_u32(topic.len() as u32);
        buf.put_slice(topic.as_bytes());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Encodes a task-execution frame.
    pub fn encode_task(address: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32(KIND_TASK);
        buf.put_u32(address);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decodes a frame.
    pub fn decode(mut data: Bytes) -> Result<Frame> {
        if data.len() < 8 {
            return Err(Error::Protocol("frame too short".into()));
        }
        let kind = data.get_u32();
        let address = data.get_u32();
        match kind {
            KIND_TASK => Ok(Frame::Task {
                address,
                payload: data,
            }),
            KIND_TOPIC => {
                if data.len() < 4 {
                    return Err(Error::Protocol("topic frame too short".into()));
                }
                let topic_len = data.get_u32() as usize;
                if data.len() < topic_len {
                    return Err(Error::Protocol("topic name truncated".into()));
                }
                let topic = std::str::from_utf8(&data[..topic_len])
                    .map_err(|_| Error::Protocol("topic name is not utf-8".into()))?
                    .to_string();
                data.advance(topic_len);
                Ok(Frame::Topic {
                    address,
                    topic,
                    payload: data,
                })
            }
            other => Err(Error::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

/// Routes decoded frames to per-resource topic handlers. The handler map is
/// concurrent: registration happens from coordinator threads while dispatch
/// runs on transport tasks.
pub struct TopicMux {
    handlers: DashMap<(u32, String), TopicHandler>,
    task: RwLock<Option<TopicHandler>>,
}

impl TopicMux {
    /// Creates an empty mux.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            task: RwLock::new(None),
        })
    }

    /// Registers a handler for `(address, topic)`.
    pub fn register(&self, address: u32, topic: &str, handler: TopicHandler) {
        self.handlers.insert((address, topic.to_string()), handler);
    }

    /// Unregisters a handler.
    pub fn unregister(&self, address: u32, topic: &str) {
        self.handlers.remove(&(address, topic.to_string()));
    }

    /// Installs the handler for remote task execution (frame kind 0).
    pub fn task_handler(&self, handler: TopicHandler) {
        *self.task.write() = Some(handler);
    }

    /// Builds the [`ServerHandler`] that decodes frames and dispatches them.
    pub fn server_handler(self: &Arc<Self>) -> ServerHandler {
        let mux = Arc::clone(self);
        Arc::new(move |message: Bytes| {
            let mux = Arc::clone(&mux);
            Box::pin(async move {
                match frame::decode(message)? {
                    frame::Frame::Task { payload, .. } => {
                        let handler = mux.task.read().clone();
                        match handler {
                            Some(handler) => handler(payload).await,
                            None => Err(Error::Protocol("no task handler installed".into())),
                        }
                    }
                    frame::Frame::Topic {
                        address,
                        topic,
                        payload,
                    } => {
                        let handler = mux
                            .handlers
                            .get(&(address, topic.clone()))
                            .map(|h| Arc::clone(h.value()));
                        match handler {
                            Some(handler) => handler(payload).await,
                            None => Err(Error::Protocol(format!(
                                "no handler for topic {} at address {}",
                                topic, address
                            ))),
                        }
                    }
                }
            })
        })
    }
}

// ---------------------------------------------------------------------------
// local:// transport
// ---------------------------------------------------------------------------

/// An in-process network shared by `local://` members.
///
/// Supports one-way and bidirectional partition injection: a partitioned
/// request (or its response path) fails with `Unreachable`, simulating a
/// dead link.
pub struct LocalNetwork {
    servers: DashMap<Uri, ServerHandler>,
    partitions: RwLock<Vec<(Uri, Uri)>>,
}

impl LocalNetwork {
    /// Creates a shared network.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            servers: DashMap::new(),
            partitions: RwLock::new(Vec::new()),
        })
    }

    /// Builds the [`Protocol`] backed by this network.
    pub fn protocol(self: &Arc<Self>) -> Arc<dyn Protocol> {
        Arc::new(LocalProtocol {
            network: Arc::clone(self),
        })
    }

    /// Blocks messages from `from` to `to`.
    pub fn partition(&self, from: &str, to: &str) {
        self.partitions
            .write()
            .push((from.to_string(), to.to_string()));
    }

    /// Blocks messages in both directions between `a` and `b`.
    pub fn partition_both(&self, a: &str, b: &str) {
        let mut partitions = self.partitions.write();
        partitions.push((a.to_string(), b.to_string()));
        partitions.push((b.to_string(), a.to_string()));
    }

    /// Isolates a member from every other registered member.
    pub fn isolate(&self, uri: &str) {
        let others: Vec<Uri> = self
            .servers
            .iter()
            .map(|e| e.key().clone())
            .filter(|u| u != uri)
            .collect();
        for other in others {
            self.partition_both(uri, &other);
        }
    }

    /// Removes the partition from `from` to `to`.
    pub fn heal(&self, from: &str, to: &str) {
        self.partitions
            .write()
            .retain(|(f, t)| f != from || t != to);
    }

    /// Removes every partition involving `uri`.
    pub fn heal_member(&self, uri: &str) {
        self.partitions
            .write()
            .retain(|(f, t)| f != uri && t != uri);
    }

    /// Removes all partitions.
    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    /// True if messages from `from` to `to` are blocked.
    pub fn is_partitioned(&self, from: &str, to: &str) -> bool {
        self.partitions
            .read()
            .iter()
            .any(|(f, t)| f == from && t == to)
    }
}

struct LocalProtocol {
    network: Arc<LocalNetwork>,
}

impl Protocol for LocalProtocol {
    fn server(&self, uri: &str) -> Result<Arc<dyn Server>> {
        Ok(Arc::new(LocalServer {
            uri: uri.to_string(),
            network: Arc::clone(&self.network),
            handler: RwLock::new(None),
        }))
    }

    fn client(&self, local_uri: &str) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(LocalClient {
            local: local_uri.to_string(),
            network: Arc::clone(&self.network),
        }))
    }
}

struct LocalServer {
    uri: Uri,
    network: Arc<LocalNetwork>,
    handler: RwLock<Option<ServerHandler>>,
}

impl Server for LocalServer {
    fn handler(&self, handler: ServerHandler) {
        *self.handler.write() = Some(handler);
    }

    fn listen(&self) -> BoxFuture<Result<()>> {
        let result = match self.handler.read().clone() {
            Some(handler) => {
                self.network.servers.insert(self.uri.clone(), handler);
                Ok(())
            }
            None => Err(Error::IllegalState("no handler installed".into())),
        };
        Box::pin(async move { result })
    }

    fn close(&self) -> BoxFuture<()> {
        self.network.servers.remove(&self.uri);
        Box::pin(async {})
    }
}

struct LocalClient {
    local: Uri,
    network: Arc<LocalNetwork>,
}

impl Client for LocalClient {
    fn send(&self, uri: &str, message: Bytes) -> BoxFuture<Result<Bytes>> {
        let network = Arc::clone(&self.network);
        let from = self.local.clone();
        let to = uri.to_string();
        Box::pin(async move {
            if network.is_partitioned(&from, &to) {
                return Err(Error::unreachable(&to, "partitioned"));
            }
            let handler = network
                .servers
                .get(&to)
                .map(|h| Arc::clone(h.value()))
                .ok_or_else(|| Error::unreachable(&to, "no such member"))?;
            let response = handler(message).await?;
            // The response path can be severed independently.
            if network.is_partitioned(&to, &from) {
                return Err(Error::unreachable(&to, "partitioned"));
            }
            Ok(response)
        })
    }

    fn connect(&self, uri: &str) -> BoxFuture<Result<()>> {
        let network = Arc::clone(&self.network);
        let to = uri.to_string();
        Box::pin(async move {
            if network.servers.contains_key(&to) {
                Ok(())
            } else {
                Err(Error::unreachable(&to, "no such member"))
            }
        })
    }

    fn disconnect(&self, _uri: &str) -> BoxFuture<()> {
        // In-process delivery holds no per-destination state.
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// tcp:// transport
// ---------------------------------------------------------------------------

/// Maximum message size on the wire (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// TCP transport: length-prefixed request/response frames over pooled
/// connections.
pub struct TcpProtocol;

impl Protocol for TcpProtocol {
    fn server(&self, uri: &str) -> Result<Arc<dyn Server>> {
        Ok(Arc::new(TcpServer {
            addr: parse_tcp_uri(uri)?,
            handler: RwLock::new(None),
            shutdown: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn client(&self, _local_uri: &str) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(TcpClient {
            connections: DashMap::new(),
        }))
    }
}

fn parse_tcp_uri(uri: &str) -> Result<SocketAddr> {
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::Protocol(format!("not a tcp URI: {}", uri)))?;
    rest.parse()
        .map_err(|e| Error::Protocol(format!("invalid tcp address {}: {}", rest, e)))
}

struct TcpServer {
    addr: SocketAddr,
    handler: RwLock<Option<ServerHandler>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl Server for TcpServer {
    fn handler(&self, handler: ServerHandler) {
        *self.handler.write() = Some(handler);
    }

    fn listen(&self) -> BoxFuture<Result<()>> {
        let addr = self.addr;
        let handler = self.handler.read().clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown.lock() = Some(shutdown_tx);

        Box::pin(async move {
            let handler =
                handler.ok_or_else(|| Error::IllegalState("no handler installed".into()))?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Protocol(format!("bind {}: {}", addr, e)))?;
            info!(%addr, "transport listening");

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "connection accepted");
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(stream, handler).await {
                                        debug!(%peer, error = %e, "connection closed");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        },
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }
}

/// Serves one connection: read a framed request, invoke the handler, write
/// the framed response, repeat.
async fn serve_connection(mut stream: TcpStream, handler: ServerHandler) -> Result<()> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(Error::Protocol(format!("read: {}", e))),
        };
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!("message too large: {} bytes", len)));
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::Protocol(format!("read: {}", e)))?;

        let response = handler(Bytes::from(body)).await?;
        stream
            .write_u32(response.len() as u32)
            .await
            .map_err(|e| Error::Protocol(format!("write: {}", e)))?;
        stream
            .write_all(&response)
            .await
            .map_err(|e| Error::Protocol(format!("write: {}", e)))?;
    }
}

struct TcpClient {
    /// One pooled connection per destination; a request holds the slot for
    /// its full exchange.
    connections: DashMap<Uri, Arc<TokioMutex<Option<TcpStream>>>>,
}

impl TcpClient {
    fn slot(&self, uri: &str) -> Arc<TokioMutex<Option<TcpStream>>> {
        Arc::clone(
            self.connections
                .entry(uri.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(None)))
                .value(),
        )
    }
}

impl Client for TcpClient {
    fn send(&self, uri: &str, message: Bytes) -> BoxFuture<Result<Bytes>> {
        let slot = self.slot(uri);
        let uri = uri.to_string();
        Box::pin(async move {
            let addr = parse_tcp_uri(&uri)?;
            let mut guard = slot.lock().await;
            if guard.is_none() {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::unreachable(&uri, e))?;
                *guard = Some(stream);
            }
            let stream = guard.as_mut().expect("connection established");

            let result = exchange(stream, &message).await;
            if result.is_err() {
                // Drop the broken connection; the next send reconnects.
                *guard = None;
            }
            result.map_err(|e| Error::unreachable(&uri, e))
        })
    }

    fn connect(&self, uri: &str) -> BoxFuture<Result<()>> {
        let slot = self.slot(uri);
        let uri = uri.to_string();
        Box::pin(async move {
            let addr = parse_tcp_uri(&uri)?;
            let mut guard = slot.lock().await;
            if guard.is_none() {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::unreachable(&uri, e))?;
                *guard = Some(stream);
            }
            Ok(())
        })
    }

    fn disconnect(&self, uri: &str) -> BoxFuture<()> {
        // Dropping the slot closes the stream once any in-flight exchange
        // finishes with its own reference.
        self.connections.remove(uri);
        Box::pin(async {})
    }
}

async fn exchange(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<Bytes> {
    stream.write_u32(message.len() as u32).await?;
    stream.write_all(message).await?;
    stream.flush().await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "response too large",
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}
