mod config;
mod publish;
mod resolve;
mod server;
mod subscribe;
mod traverse;

use std::sync::Arc;

use clap::Parser;
use dashmap::DashMap;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_server::RTCIceServer;

use swarmcast_core::directory::{Directory, InMemoryDirectory, MainlineDirectory};
use swarmcast_core::registry::LocalTrackRegistry;
use swarmcast_core::resolver::RelayResolver;
use swarmcast_core::rpc_client::{GrpcTraverseClient, TraverseClient};
use swarmcast_core::subscribers::SubscriberBook;
use swarmcast_proto::cdn_server::CdnServer;

use crate::config::Args;
use crate::server::{NodeService, NodeState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::new(args.log_filter.clone()))
        .compact()
        .init();

    let directory: Arc<dyn Directory> = if args.in_memory_directory {
        info!("using in-memory directory, no DHT bootstrap");
        Arc::new(InMemoryDirectory::new())
    } else {
        if !args.bootstrap.is_empty() {
            info!(peers = ?args.bootstrap, "seeding DHT bootstrap with configured peers");
        }
        Arc::new(MainlineDirectory::bootstrap(&args.bootstrap)?)
    };

    let ice_servers = args
        .ice_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let rpc_client = Arc::new(GrpcTraverseClient::new());

    let inbound_address = if let Some(probe) = &args.probe {
        match rpc_client.resolve(&probe.clone().into()).await {
            Ok(response) => {
                info!(probe = %probe, reachable_as = %response.cname, "learned reachable address from probe peer");
                response.cname
            }
            Err(err) => {
                warn!(probe = %probe, error = %err, "probe failed, falling back to configured inbound address");
                args.inbound_address()
            }
        }
    } else {
        args.inbound_address()
    };

    let state = Arc::new(NodeState {
        registry: Arc::new(LocalTrackRegistry::new()),
        directory,
        subscribers: Arc::new(SubscriberBook::new()),
        resolver: Arc::new(RelayResolver::new(rpc_client)),
        ice_servers,
        inbound_address,
        relay_locks: DashMap::new(),
    });

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<CdnServer<NodeService>>()
        .await;

    let addr = args.listen_address.parse()?;
    info!(%addr, inbound_address = %state.inbound_address, "starting swarmcast node");

    let service = NodeService { state };

    Server::builder()
        .add_service(health_service)
        .add_service(CdnServer::new(service))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl_c handler");
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
