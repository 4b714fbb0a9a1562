//! Per-resource transport routing.
//!
//! A [`Router`] wires one resource onto the shared transport: it registers
//! the six inbound topic handlers that deliver protocol requests into the
//! resource's driver, and a [`ClientOutbound`] resolves outbound requests
//! to `client.send` on the matching topic. Destroying the routes
//! unregisters all six handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use skiff_raft::node::Outbound;
use skiff_raft::rpc::{self, topics};
use skiff_raft::transport::{frame, Client, TopicMux};
use skiff_raft::{Request, ResourceHandle, Response, Result};

/// All six protocol topics.
const TOPICS: [&str; 6] = [
    topics::PING,
    topics::POLL,
    topics::APPEND,
    topics::QUERY,
    topics::COMMIT,
    topics::SYNC,
];

/// Registers a resource's inbound topic handlers on the shared mux.
pub struct Router {
    address: u32,
    mux: Arc<TopicMux>,
}

impl Router {
    /// Creates a router for the resource at `address`.
    pub fn new(address: u32, mux: Arc<TopicMux>) -> Self {
        Self { address, mux }
    }

    /// Registers the six topic handlers, delivering into `handle`.
    pub fn create_routes(&self, handle: &ResourceHandle) {
        for topic in TOPICS {
            let handle = handle.clone();
            self.mux.register(
                self.address,
                topic,
                Arc::new(move |payload: Bytes| {
                    let handle = handle.clone();
                    Box::pin(async move {
                        let request = rpc::decode_request(&payload)?;
                        let response = handle.request(request).await?;
                        rpc::encode_response(&response)
                    })
                }),
            );
        }
    }

    /// Unregisters all six topic handlers.
    pub fn destroy_routes(&self) {
        for topic in TOPICS {
            self.mux.unregister(self.address, topic);
        }
    }
}

/// Outbound dispatcher for one resource: frames each request on its topic
/// and sends it to the destination member over the transport client.
pub struct ClientOutbound {
    address: u32,
    client: Arc<dyn Client>,
}

impl ClientOutbound {
    /// Creates the dispatcher for the resource at `address`.
    pub fn new(address: u32, client: Arc<dyn Client>) -> Self {
        Self { address, client }
    }
}

impl Outbound for ClientOutbound {
    fn send(
        &self,
        uri: &str,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send>> {
        let client = Arc::clone(&self.client);
        let address = self.address;
        let uri = uri.to_string();
        Box::pin(async move {
            let payload = rpc::encode_request(&request)?;
            let framed = frame::encode_topic(address, request.topic(), &payload);
            let raw = client.send(&uri, framed).await?;
            rpc::decode_response(&raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_raft::config::ClusterConfig;
    use skiff_raft::log::MemoryLog;
    use skiff_raft::transport::LocalNetwork;
    use skiff_raft::{Consistency, StateContext};

    use skiff_raft::rpc::{PollRequest, QueryRequest};

    async fn single_node_routed() -> (Arc<LocalNetwork>, ResourceHandle) {
        let network = LocalNetwork::shared();
        let protocol = network.protocol();

        let config = ClusterConfig::new("local://m0").with_members(["local://m0"]);
        let mut ctx = StateContext::new(config, Box::new(MemoryLog::new()), None).unwrap();
        ctx.set_consumer(Box::new(|_, payload| Ok(payload)));
        ctx.set_query_consumer(Box::new(|payload| Ok(payload)));

        let client = protocol.client("local://m0").unwrap();
        let outbound = Arc::new(ClientOutbound::new(7, client));
        let handle = skiff_raft::spawn(ctx, outbound).unwrap();

        let mux = TopicMux::new();
        let router = Router::new(7, Arc::clone(&mux));
        router.create_routes(&handle);

        let server = protocol.server("local://m0").unwrap();
        server.handler(mux.server_handler());
        server.listen().await.unwrap();

        (network, handle)
    }

    #[tokio::test]
    async fn test_inbound_routing() {
        let (network, _handle) = single_node_routed().await;
        let client = network.protocol().client("local://m9").unwrap();

        // A poll over the wire reaches the resource and is answered.
        let request = Request::Poll(PollRequest {
            term: 1,
            candidate: "local://m9".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        let payload = rpc::encode_request(&request).unwrap();
        let framed = frame::encode_topic(7, request.topic(), &payload);
        let raw = client.send("local://m0", framed).await.unwrap();
        let response = rpc::decode_response(&raw).unwrap();
        assert!(matches!(response, Response::Poll(_)));
    }

    #[tokio::test]
    async fn test_wrong_address_rejected() {
        let (network, _handle) = single_node_routed().await;
        let client = network.protocol().client("local://m9").unwrap();

        let request = Request::Query(QueryRequest {
            consistency: Consistency::Weak,
            payload: Bytes::from("q"),
        });
        let payload = rpc::encode_request(&request).unwrap();
        let framed = frame::encode_topic(8, request.topic(), &payload);
        assert!(client.send("local://m0", framed).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_routes() {
        let network = LocalNetwork::shared();
        let protocol = network.protocol();

        let config = ClusterConfig::new("local://m0").with_members(["local://m0"]);
        let ctx = StateContext::new(config, Box::new(MemoryLog::new()), None).unwrap();
        let client = protocol.client("local://m0").unwrap();
        let handle = skiff_raft::spawn(ctx, Arc::new(ClientOutbound::new(7, client))).unwrap();

        let mux = TopicMux::new();
        let router = Router::new(7, Arc::clone(&mux));
        router.create_routes(&handle);

        let server = protocol.server("local://m0").unwrap();
        server.handler(mux.server_handler());
        server.listen().await.unwrap();

        router.destroy_routes();

        let client = protocol.client("local://m9").unwrap();
        let request = Request::Poll(PollRequest {
            term: 1,
            candidate: "local://m9".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        let payload = rpc::encode_request(&request).unwrap();
        let framed = frame::encode_topic(7, request.topic(), &payload);
        assert!(client.send("local://m0", framed).await.is_err());
    }
}
