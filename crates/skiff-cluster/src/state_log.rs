//! The replicated state log façade.
//!
//! A [`StateLog`] is the user-facing surface of one replicated resource:
//! named commands that go through consensus, named queries served at a
//! chosen consistency level, and snapshot hooks for log compaction. The
//! façade serializes `(name, input)` into the entry payload; its consumer
//! dispatches by name on every node, so registering the same functions on
//! every member yields a deterministic state machine.
//!
//! ```ignore
//! let log = StateLog::create("kv", &coordinator).await?;
//! log.register_command("put", move |input| { /* mutate state */ });
//! log.register_query("get", move |input| { /* read state */ });
//!
//! let value = log.submit("put", Bytes::from("k=v")).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use skiff_raft::{Consistency, Error, ResourceHandle, Result};

use crate::coordinator::ClusterCoordinator;

/// A registered command or query body.
pub type OperationFn = Box<dyn FnMut(Bytes) -> Result<Bytes> + Send>;

/// A registered snapshot provider.
pub type SnapshotFn = Box<dyn FnMut() -> Result<Bytes> + Send>;

/// A registered snapshot installer.
pub type InstallFn = Box<dyn FnMut(Bytes) -> Result<()> + Send>;

#[derive(Default)]
struct Registry {
    commands: HashMap<String, OperationFn>,
    queries: HashMap<String, (OperationFn, Consistency)>,
    snapshotter: Option<SnapshotFn>,
    installer: Option<InstallFn>,
}

/// User-facing command/query registry over one replicated resource.
pub struct StateLog {
    name: String,
    handle: ResourceHandle,
    registry: Arc<Mutex<Registry>>,
}

impl StateLog {
    /// Creates (or joins) the named resource through the coordinator and
    /// attaches a façade to it.
    pub async fn create(name: &str, coordinator: &ClusterCoordinator) -> Result<StateLog> {
        let handle = coordinator.create_resource(name).await?;
        Self::attach(name, handle)
    }

    /// Attaches a façade to an existing resource handle, installing the
    /// dispatching consumers.
    pub fn attach(name: &str, handle: ResourceHandle) -> Result<StateLog> {
        let registry = Arc::new(Mutex::new(Registry::default()));

        let commands = Arc::clone(&registry);
        handle.set_consumer(Box::new(move |_index, payload| {
            let (name, input) = decode_operation(&payload)?;
            let mut registry = commands.lock();
            let command = registry
                .commands
                .get_mut(&name)
                .ok_or_else(|| Error::Commit(format!("unknown command {}", name)))?;
            command(input)
        }))?;

        let queries = Arc::clone(&registry);
        handle.set_query_consumer(Box::new(move |payload| {
            let (name, input) = decode_operation(&payload)?;
            let mut registry = queries.lock();
            let (query, _) = registry
                .queries
                .get_mut(&name)
                .ok_or_else(|| Error::Commit(format!("unknown query {}", name)))?;
            query(input)
        }))?;

        let snapshots = Arc::clone(&registry);
        handle.set_snapshotter(Box::new(move || {
            let mut registry = snapshots.lock();
            match registry.snapshotter.as_mut() {
                Some(snapshotter) => snapshotter(),
                None => Err(Error::IllegalState("no snapshot provider registered".into())),
            }
        }))?;

        let installs = Arc::clone(&registry);
        handle.set_installer(Box::new(move |data| {
            let mut registry = installs.lock();
            match registry.installer.as_mut() {
                Some(installer) => installer(data),
                None => Ok(()),
            }
        }))?;

        Ok(StateLog {
            name: name.to_string(),
            handle,
            registry,
        })
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying resource handle.
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Registers a command. Commands go through consensus and must be
    /// deterministic: every node applies them in the same order.
    pub fn register_command(
        &self,
        name: &str,
        command: impl FnMut(Bytes) -> Result<Bytes> + Send + 'static,
    ) -> &Self {
        self.registry
            .lock()
            .commands
            .insert(name.to_string(), Box::new(command));
        self
    }

    /// Registers a query at the default (strong) consistency.
    pub fn register_query(
        &self,
        name: &str,
        query: impl FnMut(Bytes) -> Result<Bytes> + Send + 'static,
    ) -> &Self {
        self.register_query_with(name, Consistency::default(), query)
    }

    /// Registers a query at an explicit consistency level.
    pub fn register_query_with(
        &self,
        name: &str,
        consistency: Consistency,
        query: impl FnMut(Bytes) -> Result<Bytes> + Send + 'static,
    ) -> &Self {
        self.registry
            .lock()
            .queries
            .insert(name.to_string(), (Box::new(query), consistency));
        self
    }

    /// Unregisters a command or query.
    pub fn unregister(&self, name: &str) -> &Self {
        let mut registry = self.registry.lock();
        registry.commands.remove(name);
        registry.queries.remove(name);
        self
    }

    /// Registers the snapshot provider used for log compaction.
    pub fn take_snapshot_with(
        &self,
        snapshotter: impl FnMut() -> Result<Bytes> + Send + 'static,
    ) -> &Self {
        self.registry.lock().snapshotter = Some(Box::new(snapshotter));
        self
    }

    /// Registers the snapshot installer used when receiving state from the
    /// leader.
    pub fn install_snapshot_with(
        &self,
        installer: impl FnMut(Bytes) -> Result<()> + Send + 'static,
    ) -> &Self {
        self.registry.lock().installer = Some(Box::new(installer));
        self
    }

    /// Submits a named operation. Commands replicate through consensus and
    /// resolve with the command's output once applied; queries are served
    /// at their registered consistency level.
    pub async fn submit(&self, name: &str, input: Bytes) -> Result<Bytes> {
        let payload = encode_operation(name, &input);
        match self.operation_kind(name)? {
            OperationKind::Command => self.handle.submit(payload).await,
            OperationKind::Query(consistency) => self.handle.query(payload, consistency).await,
        }
    }

    /// Submits a named operation with a deadline. On expiry the future
    /// fails with [`Error::Timeout`]; an already-appended entry is not
    /// rolled back.
    pub async fn submit_with_deadline(
        &self,
        name: &str,
        input: Bytes,
        deadline: Duration,
    ) -> Result<Bytes> {
        let payload = encode_operation(name, &input);
        match self.operation_kind(name)? {
            OperationKind::Command => self.handle.submit_with_deadline(payload, deadline).await,
            OperationKind::Query(consistency) => {
                match tokio::time::timeout(deadline, self.handle.query(payload, consistency)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                }
            }
        }
    }

    /// Typed submit: bincode in, bincode out.
    pub async fn submit_typed<I, O>(&self, name: &str, input: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = bincode::serialize(input)
            .map_err(|e| Error::Protocol(format!("encode input: {}", e)))?;
        let output = self.submit(name, Bytes::from(input)).await?;
        bincode::deserialize(&output).map_err(|e| Error::Protocol(format!("decode output: {}", e)))
    }

    /// Snapshots the state machine and compacts the log through the last
    /// applied index.
    pub async fn compact(&self) -> Result<()> {
        self.handle.take_snapshot().await
    }

    /// Closes the underlying resource.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }

    fn operation_kind(&self, name: &str) -> Result<OperationKind> {
        let registry = self.registry.lock();
        if registry.commands.contains_key(name) {
            Ok(OperationKind::Command)
        } else if let Some((_, consistency)) = registry.queries.get(name) {
            Ok(OperationKind::Query(*consistency))
        } else {
            Err(Error::Commit(format!("unknown operation {}", name)))
        }
    }
}

enum OperationKind {
    Command,
    Query(Consistency),
}

/// Frames an operation as `name_len(4) | name | input`.
fn encode_operation(name: &str, input: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + name.len() + input.len());
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_slice(input);
    buf.freeze()
}

fn decode_operation(payload: &Bytes) -> Result<(String, Bytes)> {
    let mut data = payload.clone();
    if data.len() < 4 {
        return Err(Error::Protocol("operation payload too short".into()));
    }
    let name_len = data.get_u32() as usize;
    if data.len() < name_len {
        return Err(Error::Protocol("operation name truncated".into()));
    }
    let name = std::str::from_utf8(&data[..name_len])
        .map_err(|_| Error::Protocol("operation name is not utf-8".into()))?
        .to_string();
    data.advance(name_len);
    Ok((name, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codec() {
        let payload = encode_operation("put", b"k=v");
        let (name, input) = decode_operation(&payload).unwrap();
        assert_eq!(name, "put");
        assert_eq!(input, Bytes::from_static(b"k=v"));

        // Empty input is valid.
        let payload = encode_operation("ping", b"");
        let (name, input) = decode_operation(&payload).unwrap();
        assert_eq!(name, "ping");
        assert!(input.is_empty());

        assert!(decode_operation(&Bytes::from_static(b"ab")).is_err());
    }
}
