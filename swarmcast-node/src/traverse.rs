//! `Traverse`: reports this node's own latency to a stream plus the
//! subscribers it has already handed the stream onward to, so a remote
//! resolver can decide whether to leech here or descend further.

use std::sync::Arc;

use tonic::{Response, Status};

use crate::server::NodeState;
use swarmcast_core::types::StreamKey;
use swarmcast_core::Error;
use swarmcast_proto::{Subscriber, TraverseRequest, TraverseResponse};

pub async fn handle(
    state: Arc<NodeState>,
    request: TraverseRequest,
) -> Result<Response<TraverseResponse>, Status> {
    let key = StreamKey::from_wire(request.stream_id.clone());
    let stream_id = request.stream_id.into();
    let inbound_latency = state
        .registry
        .get_latency(&key)
        .ok_or_else(|| Error::NotFound(key.to_string()))?;

    let subscribers = state
        .subscribers
        .list(&stream_id, inbound_latency)
        .into_iter()
        .map(|s| Subscriber {
            cname: s.cname.to_string(),
            latency: Some(prost_types::Duration {
                seconds: s.latency.as_secs() as i64,
                nanos: s.latency.subsec_nanos() as i32,
            }),
        })
        .collect();

    Ok(Response::new(TraverseResponse {
        requested_max_subscribers: swarmcast_core::subscribers::MAX_SUBSCRIBERS_PER_STREAM,
        subscribers,
    }))
}
