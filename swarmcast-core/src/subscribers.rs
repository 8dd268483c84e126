//! Downstream subscriber bookkeeping used to answer `Traverse` requests.
//!
//! Kept separate from `registry.rs`'s ingress fan-out: this tracks who
//! this node has handed a stream *onward* to (each with the latency
//! they reported back), not who is consuming a locally-owned ingress
//! track. A `Traverse` caller sums each subscriber's own latency with
//! this node's inbound latency to estimate the cost of leeching through
//! it versus descending further.
//!
//! `RequestedMaxSubscribers` is a fixed cap rather than a load-adaptive
//! figure; nothing about current fan-out width or host load feeds back
//! into it yet.

use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{NodeAddress, StreamId};

pub const MAX_SUBSCRIBERS_PER_STREAM: u32 = 10;

#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub cname: NodeAddress,
    pub latency: Duration,
}

#[derive(Default)]
pub struct SubscriberBook {
    by_stream: DashMap<StreamId, DashMap<Uuid, SubscriberInfo>>,
}

impl SubscriberBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: StreamId, cname: NodeAddress, latency: Duration) -> Uuid {
        let id = Uuid::new_v4();
        self.by_stream
            .entry(stream_id)
            .or_default()
            .insert(id, SubscriberInfo { cname, latency });
        id
    }

    pub fn deregister(&self, stream_id: &StreamId, id: Uuid) {
        if let Some(subscribers) = self.by_stream.get(stream_id) {
            subscribers.remove(&id);
        }
    }

    /// Subscribers of `stream_id`, with `inbound_latency` folded into
    /// each entry's reported latency.
    pub fn list(&self, stream_id: &StreamId, inbound_latency: Duration) -> Vec<SubscriberInfo> {
        self.by_stream
            .get(stream_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|entry| SubscriberInfo {
                        cname: entry.value().cname.clone(),
                        latency: entry.value().latency + inbound_latency,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, stream_id: &StreamId) -> usize {
        self.by_stream
            .get(stream_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn has_capacity(&self, stream_id: &StreamId) -> bool {
        self.count(stream_id) < MAX_SUBSCRIBERS_PER_STREAM as usize
    }
}
