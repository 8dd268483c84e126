//! Shared node state and the `Cdn` service wiring.
//!
//! One struct holds the shared collaborators; the generated server
//! trait delegates each RPC to its own module (`publish`, `subscribe`,
//! `traverse`, `resolve`).

use std::sync::Arc;

use swarmcast_core::directory::Directory;
use swarmcast_core::registry::LocalTrackRegistry;
use swarmcast_core::resolver::RelayResolver;
use swarmcast_core::rpc_client::GrpcTraverseClient;
use swarmcast_core::subscribers::SubscriberBook;
use tonic::{Request, Response, Status};
use webrtc::ice_transport::ice_server::RTCIceServer;

use swarmcast_proto::cdn_server::Cdn;
use swarmcast_proto::{
    PublishRequest, PublishResponse, ResolveResponse, SubscribeRequest, SubscribeResponse,
    TraverseRequest, TraverseResponse,
};

pub struct NodeState {
    pub registry: Arc<LocalTrackRegistry>,
    pub directory: Arc<dyn Directory>,
    pub subscribers: Arc<SubscriberBook>,
    pub resolver: Arc<RelayResolver<GrpcTraverseClient>>,
    pub ice_servers: Vec<RTCIceServer>,
    pub inbound_address: String,
    /// Serializes relay setup per key so concurrent subscribers for a
    /// stream this node doesn't yet carry share one upstream leech
    /// instead of each dialing independently.
    pub relay_locks: dashmap::DashMap<swarmcast_core::types::StreamKey, Arc<tokio::sync::Mutex<()>>>,
}

pub struct NodeService {
    pub state: Arc<NodeState>,
}

#[tonic::async_trait]
impl Cdn for NodeService {
    type PublishStream = crate::publish::PublishStream;
    type SubscribeStream = crate::subscribe::SubscribeStream;

    async fn publish(
        &self,
        request: Request<tonic::Streaming<PublishRequest>>,
    ) -> Result<Response<Self::PublishStream>, Status> {
        crate::publish::handle(self.state.clone(), request.into_inner()).await
    }

    async fn subscribe(
        &self,
        request: Request<tonic::Streaming<SubscribeRequest>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let peer_addr = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown-peer".to_string());
        crate::subscribe::handle(self.state.clone(), peer_addr, request.into_inner()).await
    }

    async fn traverse(
        &self,
        request: Request<TraverseRequest>,
    ) -> Result<Response<TraverseResponse>, Status> {
        crate::traverse::handle(self.state.clone(), request.into_inner()).await
    }

    async fn resolve(
        &self,
        request: Request<prost_types::Empty>,
    ) -> Result<Response<ResolveResponse>, Status> {
        crate::resolve::handle(self.state.clone(), request.into_inner()).await
    }
}
