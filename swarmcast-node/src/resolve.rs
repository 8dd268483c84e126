//! `Resolve`: tells a caller what address to reach this node at.
//!
//! Tells a caller what address to reach this node at. Used by liveness
//! probes to confirm a dialed peer is alive and learn its canonical
//! address before trusting a directory entry.

use std::sync::Arc;

use tonic::{Response, Status};

use crate::server::NodeState;
use swarmcast_proto::ResolveResponse;

pub async fn handle(
    state: Arc<NodeState>,
    _request: prost_types::Empty,
) -> Result<Response<ResolveResponse>, Status> {
    Ok(Response::new(ResolveResponse {
        cname: state.inbound_address.clone(),
    }))
}
