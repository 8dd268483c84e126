//! Outbound gRPC client used by the relay resolver to call `Traverse`
//! and `Resolve` on other nodes.
//!
//! Connecting a `tonic::transport::Channel` per node is expensive enough
//! to be worth caching with a TTL, so repeated resolver descents into
//! the same node reuse the connection.

use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use swarmcast_proto::cdn_client::CdnClient;
use swarmcast_proto::{ResolveResponse, TraverseRequest, TraverseResponse};
use tonic::transport::Channel;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::NodeAddress;

const CHANNEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CHANNEL_CACHE_CAPACITY: u64 = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait TraverseClient: Send + Sync {
    async fn traverse(&self, node: &NodeAddress, stream_id: String) -> Result<TraverseResponse>;
    async fn resolve(&self, node: &NodeAddress) -> Result<ResolveResponse>;
}

pub struct GrpcTraverseClient {
    channels: Cache<NodeAddress, Channel>,
}

impl Default for GrpcTraverseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcTraverseClient {
    pub fn new() -> Self {
        Self {
            channels: Cache::builder()
                .max_capacity(CHANNEL_CACHE_CAPACITY)
                .time_to_live(CHANNEL_CACHE_TTL)
                .build(),
        }
    }

    async fn channel_for(&self, node: &NodeAddress) -> Result<Channel> {
        if let Some(channel) = self.channels.get(node) {
            return Ok(channel);
        }

        debug!(node = %node, "dialing node, channel not cached");
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{node}"))
            .map_err(|e| Error::Protocol(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint.connect().await?;
        self.channels.insert(node.clone(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl TraverseClient for GrpcTraverseClient {
    async fn traverse(&self, node: &NodeAddress, stream_id: String) -> Result<TraverseResponse> {
        let channel = self.channel_for(node).await?;
        let mut client = CdnClient::new(channel);
        let response = client
            .traverse(TraverseRequest { stream_id })
            .await?
            .into_inner();
        Ok(response)
    }

    async fn resolve(&self, node: &NodeAddress) -> Result<ResolveResponse> {
        let channel = self.channel_for(node).await?;
        let mut client = CdnClient::new(channel);
        let response = client
            .resolve(())
            .await?
            .into_inner();
        Ok(response)
    }
}
