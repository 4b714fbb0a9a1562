//! The cluster coordinator.
//!
//! One coordinator per process hosts the transport server for the local
//! member and multiplexes any number of named replicated resources over it.
//! Resource creation and deletion are agreed on through an internal Raft
//! instance (the meta-log, resource address 0): `create_resource` submits a
//! create entry, every node's meta consumer applies it, and the registries
//! converge by log replay.
//!
//! Meta-log payloads:
//!
//! ```text
//! create: | +1 (i32) | name_len(4) | name | cluster_len(4) | member set |
//!         | log_len(4) | log config |
//! delete: | -1 (i32) | name_len(4) | name |
//! ```
//!
//! Member sets and log configs travel as bincode inside the framed entry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use skiff_raft::config::{ClusterConfig, LogConfig};
use skiff_raft::log::{Log, MemoryLog};
use skiff_raft::storage::{FileLog, MetaStore};
use skiff_raft::transport::{Client, ProtocolRegistry, Server, TopicMux};
use skiff_raft::{
    Error, MemberInfo, MemberState, MemberType, ResourceHandle, Result, StateContext, Uri,
};

use crate::router::{ClientOutbound, Router};

/// The meta-log's resource address.
pub const META_ADDRESS: u32 = 0;

/// Deadline for meta-log submissions. With no elected leader the submission
/// fails with `Cluster(NoLeader)`; a stalled forward fails with `Timeout`.
const META_DEADLINE: Duration = Duration::from_secs(10);

/// A registered resource.
struct Resource {
    handle: ResourceHandle,
    router: Router,
}

struct Inner {
    config: ClusterConfig,
    server: Arc<dyn Server>,
    client: Arc<dyn Client>,
    mux: Arc<TopicMux>,
    resources: DashMap<String, Resource>,
    meta: RwLock<Option<(ResourceHandle, Router)>>,
    meta_log_config: RwLock<LogConfig>,
    /// Serializes resource instantiation between the meta consumer and the
    /// client-side catch-up path.
    creation: Mutex<()>,
}

/// Coordinates the replicated resources of one cluster member.
pub struct ClusterCoordinator {
    inner: Arc<Inner>,
}

impl ClusterCoordinator {
    /// Creates a coordinator with the built-in protocols.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_protocols(config, ProtocolRegistry::with_defaults())
    }

    /// Creates a coordinator with an explicit protocol registry.
    pub fn with_protocols(config: ClusterConfig, protocols: ProtocolRegistry) -> Result<Self> {
        config.validate()?;
        let protocol = protocols.get(&config.local_member)?;
        let server = protocol.server(&config.local_member)?;
        let client = protocol.client(&config.local_member)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                server,
                client,
                mux: TopicMux::new(),
                resources: DashMap::new(),
                meta: RwLock::new(None),
                meta_log_config: RwLock::new(LogConfig::new("meta")),
                creation: Mutex::new(()),
            }),
        })
    }

    /// Overrides the meta-log configuration (e.g. to make it durable).
    /// Takes effect on [`ClusterCoordinator::open`].
    pub fn set_meta_log(&self, log_config: LogConfig) {
        *self.inner.meta_log_config.write() = log_config.with_name("meta");
    }

    /// The local member URI.
    pub fn local_uri(&self) -> &str {
        &self.inner.config.local_member
    }

    /// Starts the transport server and the meta-log Raft instance.
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.meta.read().is_some() {
            return Ok(());
        }

        inner.server.handler(inner.mux.server_handler());
        inner.server.listen().await?;

        let meta_log_config = inner.meta_log_config.read().clone();
        let (log, meta_store) = make_log(&meta_log_config)?;
        let ctx = StateContext::new(inner.config.clone(), log, meta_store)?;
        let outbound = Arc::new(ClientOutbound::new(META_ADDRESS, Arc::clone(&inner.client)));
        let handle = skiff_raft::spawn(ctx, outbound)?;

        // The meta consumer instantiates and tears down resources as the
        // meta-log replays on this node.
        let weak = Arc::downgrade(inner);
        handle.set_consumer(Box::new(move |_index, payload| {
            let inner = weak.upgrade().ok_or(Error::Closed)?;
            apply_meta(&inner, &payload)
        }))?;

        let router = Router::new(META_ADDRESS, Arc::clone(&inner.mux));
        router.create_routes(&handle);
        *inner.meta.write() = Some((handle, router));

        info!(uri = %inner.config.local_member, "coordinator open");
        Ok(())
    }

    fn meta_handle(&self) -> Result<ResourceHandle> {
        self.inner
            .meta
            .read()
            .as_ref()
            .map(|(handle, _)| handle.clone())
            .ok_or_else(|| Error::IllegalState("coordinator not open".into()))
    }

    /// Creates (or joins) a replicated resource with the default log
    /// configuration, returning its handle.
    pub async fn create_resource(&self, name: &str) -> Result<ResourceHandle> {
        self.create_resource_with(name, LogConfig::new(name)).await
    }

    /// Creates (or joins) a replicated resource with an explicit log
    /// configuration.
    pub async fn create_resource_with(
        &self,
        name: &str,
        log_config: LogConfig,
    ) -> Result<ResourceHandle> {
        let log_config = log_config.with_name(name);
        let entry = encode_create(name, &self.inner.config.members, &log_config)?;
        let meta = self.meta_handle()?;
        meta.submit_with_deadline(entry, META_DEADLINE).await?;

        // The leader applied the entry before acknowledging; our own replay
        // may still be behind, so instantiate directly when needed.
        create_local(
            &self.inner,
            name,
            self.inner.config.members.clone(),
            log_config,
        )
    }

    /// Deletes a replicated resource, returning true if it existed.
    pub async fn delete_resource(&self, name: &str) -> Result<bool> {
        let entry = encode_delete(name);
        let meta = self.meta_handle()?;
        let result = meta.submit_with_deadline(entry, META_DEADLINE).await?;

        // Converge locally even when replay lags the acknowledgement.
        if let Some((_, resource)) = self.inner.resources.remove(name) {
            resource.router.destroy_routes();
            let _ = resource.handle.close().await;
        }
        Ok(decode_result(&result)? == 1)
    }

    /// Looks up a locally registered resource.
    pub fn resource(&self, name: &str) -> Option<ResourceHandle> {
        self.inner.resources.get(name).map(|r| r.handle.clone())
    }

    /// Registers a listener member: it receives replicated state for every
    /// resource but never votes. The transport connection opens as soon as
    /// the listener is observed alive; if it cannot be reached yet, the
    /// first replication send retries the connection.
    pub async fn add_listener(&self, uri: &str) -> Result<()> {
        self.broadcast_member(MemberInfo::listener(uri))?;
        if let Err(e) = self.inner.client.connect(uri).await {
            debug!(listener = %uri, error = %e, "listener connection deferred");
        }
        Ok(())
    }

    /// Drops a dead listener and closes its transport connection.
    pub async fn remove_listener(&self, uri: &str) -> Result<()> {
        let mut info = MemberInfo::listener(uri);
        info.state = MemberState::Dead;
        self.broadcast_member(info)?;
        self.inner.client.disconnect(uri).await;
        Ok(())
    }

    fn broadcast_member(&self, info: MemberInfo) -> Result<()> {
        debug_assert_eq!(info.member_type, MemberType::Listener);
        if let Some((meta, _)) = self.inner.meta.read().as_ref() {
            meta.update_member(info.clone())?;
        }
        for resource in self.inner.resources.iter() {
            resource.handle.update_member(info.clone())?;
        }
        Ok(())
    }

    /// Closes every resource, the meta-log instance, and the server.
    pub async fn close(&self) -> Result<()> {
        let names: Vec<String> = self
            .inner
            .resources
            .iter()
            .map(|r| r.key().clone())
            .collect();
        for name in names {
            if let Some((_, resource)) = self.inner.resources.remove(&name) {
                resource.router.destroy_routes();
                let _ = resource.handle.close().await;
            }
        }
        if let Some((handle, router)) = self.inner.meta.write().take() {
            router.destroy_routes();
            let _ = handle.close().await;
        }
        self.inner.server.close().await;
        Ok(())
    }
}

/// Derives a resource's transport address from its name. Address 0 is
/// reserved for the meta-log.
pub fn resource_address(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes()).max(1)
}

fn make_log(log_config: &LogConfig) -> Result<(Box<dyn Log>, Option<MetaStore>)> {
    match &log_config.directory {
        Some(dir) => {
            let log = FileLog::new(dir.clone(), &log_config.name);
            let meta = MetaStore::open(dir, &log_config.name)?;
            Ok((Box::new(log), Some(meta)))
        }
        None => Ok((Box::new(MemoryLog::new()), None)),
    }
}

/// Applies one meta-log entry on this node.
fn apply_meta(inner: &Arc<Inner>, payload: &[u8]) -> Result<Bytes> {
    match decode_meta(payload)? {
        MetaOp::Create {
            name,
            members,
            log_config,
        } => {
            if inner.resources.contains_key(&name) {
                return Ok(result_bytes(0));
            }
            create_local(inner, &name, members, log_config)?;
            Ok(result_bytes(1))
        }
        MetaOp::Delete { name } => match inner.resources.remove(&name) {
            Some((_, resource)) => {
                resource.router.destroy_routes();
                let handle = resource.handle;
                tokio::spawn(async move {
                    let _ = handle.close().await;
                });
                debug!(name = %name, "resource deleted");
                Ok(result_bytes(1))
            }
            None => Ok(result_bytes(0)),
        },
    }
}

/// Instantiates a resource on this node: its own log, state context,
/// driver, and routes, addressed by the hash of its name.
fn create_local(
    inner: &Arc<Inner>,
    name: &str,
    members: BTreeSet<Uri>,
    log_config: LogConfig,
) -> Result<ResourceHandle> {
    let _guard = inner.creation.lock();
    if let Some(existing) = inner.resources.get(name) {
        return Ok(existing.handle.clone());
    }

    let address = resource_address(name);
    let cluster = inner.config.clone().with_members(members);
    let (log, meta_store) = make_log(&log_config)?;
    let ctx = StateContext::new(cluster, log, meta_store)?
        .with_compaction_threshold(log_config.compaction_threshold);
    let outbound = Arc::new(ClientOutbound::new(address, Arc::clone(&inner.client)));
    let handle = skiff_raft::spawn(ctx, outbound)?;

    let router = Router::new(address, Arc::clone(&inner.mux));
    router.create_routes(&handle);

    inner.resources.insert(
        name.to_string(),
        Resource {
            handle: handle.clone(),
            router,
        },
    );
    info!(name, address, "resource created");
    Ok(handle)
}

enum MetaOp {
    Create {
        name: String,
        members: BTreeSet<Uri>,
        log_config: LogConfig,
    },
    Delete {
        name: String,
    },
}

fn encode_create(name: &str, members: &BTreeSet<Uri>, log_config: &LogConfig) -> Result<Bytes> {
    let members_bytes = bincode::serialize(members)
        .map_err(|e| Error::Protocol(format!("encode member set: {}", e)))?;
    let log_bytes = bincode::serialize(log_config)
        .map_err(|e| Error::Protocol(format!("encode log config: {}", e)))?;

    let mut buf =
        BytesMut::with_capacity(16 + name.len() + members_bytes.len() + log_bytes.len());
    buf.put_i32(1);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u32(members_bytes.len() as u32);
    buf.put_slice(&members_bytes);
    buf.put_u32(log_bytes.len() as u32);
    buf.put_slice(&log_bytes);
    Ok(buf.freeze())
}

fn encode_delete(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + name.len());
    buf.put_i32(-1);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

fn decode_meta(mut payload: &[u8]) -> Result<MetaOp> {
    if payload.len() < 8 {
        return Err(Error::Protocol("meta entry too short".into()));
    }
    let kind = payload.get_i32();
    let name = read_chunk(&mut payload)?;
    let name = String::from_utf8(name)
        .map_err(|_| Error::Protocol("resource name is not utf-8".into()))?;

    match kind {
        1 => {
            let members_bytes = read_chunk(&mut payload)?;
            let members: BTreeSet<Uri> = bincode::deserialize(&members_bytes)
                .map_err(|e| Error::Protocol(format!("decode member set: {}", e)))?;
            let log_bytes = read_chunk(&mut payload)?;
            let log_config: LogConfig = bincode::deserialize(&log_bytes)
                .map_err(|e| Error::Protocol(format!("decode log config: {}", e)))?;
            Ok(MetaOp::Create {
                name,
                members,
                log_config,
            })
        }
        -1 => Ok(MetaOp::Delete { name }),
        other => Err(Error::Protocol(format!("unknown meta entry kind {}", other))),
    }
}

fn read_chunk(payload: &mut &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 4 {
        return Err(Error::Protocol("meta entry truncated".into()));
    }
    let len = payload.get_u32() as usize;
    if payload.len() < len {
        return Err(Error::Protocol("meta entry truncated".into()));
    }
    let chunk = payload[..len].to_vec();
    payload.advance(len);
    Ok(chunk)
}

fn result_bytes(value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(value);
    buf.freeze()
}

fn decode_result(mut data: &[u8]) -> Result<i32> {
    if data.len() < 4 {
        return Err(Error::Protocol("meta result too short".into()));
    }
    Ok(data.get_i32())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_raft::transport::LocalNetwork;

    #[test]
    fn test_meta_codec_roundtrip() {
        let members: BTreeSet<Uri> = ["local://m0", "local://m1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let log_config = LogConfig::new("orders").with_compaction_threshold(50);

        let encoded = encode_create("orders", &members, &log_config).unwrap();
        match decode_meta(&encoded).unwrap() {
            MetaOp::Create {
                name,
                members: decoded_members,
                log_config: decoded_log,
            } => {
                assert_eq!(name, "orders");
                assert_eq!(decoded_members, members);
                assert_eq!(decoded_log.name, "orders");
                assert_eq!(decoded_log.compaction_threshold, 50);
            }
            MetaOp::Delete { .. } => panic!("expected create"),
        }

        let encoded = encode_delete("orders");
        match decode_meta(&encoded).unwrap() {
            MetaOp::Delete { name } => assert_eq!(name, "orders"),
            MetaOp::Create { .. } => panic!("expected delete"),
        }
    }

    #[test]
    fn test_meta_codec_rejects_garbage() {
        assert!(decode_meta(b"xy").is_err());

        let mut buf = BytesMut::new();
        buf.put_i32(7); // Unknown kind.
        buf.put_u32(1);
        buf.put_slice(b"x");
        assert!(decode_meta(&buf.freeze()).is_err());
    }

    #[test]
    fn test_result_codec() {
        assert_eq!(decode_result(&result_bytes(1)).unwrap(), 1);
        assert_eq!(decode_result(&result_bytes(0)).unwrap(), 0);
        assert!(decode_result(b"").is_err());
    }

    #[test]
    fn test_resource_address() {
        assert_ne!(resource_address("orders"), META_ADDRESS);
        assert_eq!(resource_address("orders"), resource_address("orders"));
        assert_ne!(resource_address("orders"), resource_address("users"));
    }

    fn local_coordinator(network: &Arc<LocalNetwork>, uri: &str) -> ClusterCoordinator {
        let protocols = ProtocolRegistry::new();
        protocols.register("local", network.protocol());
        let config = ClusterConfig::new(uri)
            .with_members([uri])
            .with_election_timeout(Duration::from_millis(60))
            .with_heartbeat_interval(Duration::from_millis(20));
        ClusterCoordinator::with_protocols(config, protocols).unwrap()
    }

    async fn create_when_ready(
        coordinator: &ClusterCoordinator,
        name: &str,
    ) -> ResourceHandle {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match coordinator.create_resource(name).await {
                Ok(handle) => return handle,
                Err(Error::Cluster(_)) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => panic!("create_resource failed: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_single_node_resource_lifecycle() {
        let network = LocalNetwork::shared();
        let coordinator = local_coordinator(&network, "local://solo");
        coordinator.open().await.unwrap();

        let handle = create_when_ready(&coordinator, "kv").await;
        handle
            .set_consumer(Box::new(|_, payload| Ok(payload)))
            .unwrap();

        // The resource elects itself and accepts commands.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match handle
                .submit_with_deadline(Bytes::from("x"), Duration::from_millis(200))
                .await
            {
                Ok(result) => {
                    assert_eq!(result, Bytes::from("x"));
                    break;
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => panic!("submit failed: {}", e),
            }
        }

        // Creating again joins the existing instance.
        let again = coordinator.create_resource("kv").await.unwrap();
        let status = again.status().await.unwrap();
        assert!(status.last_index >= 1);

        assert!(coordinator.delete_resource("kv").await.unwrap());
        assert!(coordinator.resource("kv").is_none());
        // Deleting a missing resource reports false.
        assert!(!coordinator.delete_resource("kv").await.unwrap());

        coordinator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_resource_recovers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_config = LogConfig::new("kv").with_directory(tmp.path());

        // First run: commit one entry into the durable log.
        {
            let network = LocalNetwork::shared();
            let coordinator = local_coordinator(&network, "local://solo");
            coordinator.open().await.unwrap();

            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            let handle = loop {
                match coordinator
                    .create_resource_with("kv", log_config.clone())
                    .await
                {
                    Ok(handle) => break handle,
                    Err(Error::Cluster(_)) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                    Err(e) => panic!("create_resource failed: {}", e),
                }
            };
            handle
                .set_consumer(Box::new(|_, payload| Ok(payload)))
                .unwrap();

            loop {
                match handle
                    .submit_with_deadline(Bytes::from("durable"), Duration::from_millis(200))
                    .await
                {
                    Ok(_) => break,
                    Err(_) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                    Err(e) => panic!("submit failed: {}", e),
                }
            }
            coordinator.close().await.unwrap();
        }

        // Second run: the log replays from disk.
        {
            let network = LocalNetwork::shared();
            let coordinator = local_coordinator(&network, "local://solo");
            coordinator.open().await.unwrap();

            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            let handle = loop {
                match coordinator
                    .create_resource_with("kv", log_config.clone())
                    .await
                {
                    Ok(handle) => break handle,
                    Err(Error::Cluster(_)) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                    Err(e) => panic!("create_resource failed: {}", e),
                }
            };

            let status = handle.status().await.unwrap();
            assert!(status.last_index >= 1);
            let entry = handle.entry(1).await.unwrap().unwrap();
            assert_eq!(&entry.payload[..], b"durable");
            // The restarted node remembers the term it voted in.
            assert!(status.term >= 1);

            coordinator.close().await.unwrap();
        }
    }
}
