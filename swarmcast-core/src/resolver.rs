//! Relay Resolver: finds the cheapest node a subscriber should leech
//! from for a given stream, descending the subscriber tree built by
//! every node's `Traverse` responses.
//!
//! At each node call `Traverse`. If the node still has room for another
//! subscriber, leech from it directly. Otherwise it's full: recurse
//! into every one of its existing subscribers, and of the branches that
//! succeed, pick the one with the lowest `incremental_latency +
//! cumulative_latency`. A node with no capacity and no successful
//! branch fails the whole resolution rather than silently attaching
//! somewhere already full.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rpc_client::TraverseClient;
use crate::types::NodeAddress;

#[derive(Debug, Clone)]
pub struct LeechTarget {
    pub node: NodeAddress,
    /// Round-trip latency of this resolver's own `Traverse` call to
    /// `node`, measured directly rather than inferred from any hop
    /// report.
    pub incremental_latency: Duration,
    /// Cumulative latency from the publisher down to `node`. A
    /// subscriber's reported latency is already cumulative from that
    /// node's own `Traverse` response, so descending into one replaces
    /// this value rather than adding to it.
    pub cumulative_latency: Duration,
    /// Nodes visited on the path from the publisher to `node`, in
    /// order; appended to a subscriber's own route trace on success.
    pub trace: Vec<NodeAddress>,
}

pub struct RelayResolver<C> {
    client: Arc<C>,
}

impl<C: TraverseClient> RelayResolver<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Resolve the best node to leech `stream_id` from, starting the
    /// descent at `publisher`.
    pub async fn resolve(&self, publisher: NodeAddress, stream_id: String) -> Result<LeechTarget> {
        let visited = HashSet::new();
        self.descend(publisher, stream_id, Duration::ZERO, Vec::new(), visited)
            .await
    }

    #[async_recursion]
    async fn descend(
        &self,
        node: NodeAddress,
        stream_id: String,
        cumulative_so_far: Duration,
        trace_so_far: Vec<NodeAddress>,
        mut visited: HashSet<NodeAddress>,
    ) -> Result<LeechTarget> {
        if !visited.insert(node.clone()) {
            return Err(Error::Protocol(format!("cycle detected revisiting {node}")));
        }

        let mut trace = trace_so_far;
        trace.push(node.clone());

        let started = Instant::now();
        let response = self.client.traverse(&node, stream_id.clone()).await?;
        let incremental_latency = started.elapsed();

        let has_capacity = (response.subscribers.len() as u32) < response.requested_max_subscribers;
        if has_capacity {
            return Ok(LeechTarget {
                node,
                incremental_latency,
                cumulative_latency: cumulative_so_far,
                trace,
            });
        }

        debug!(node = %node, "node at subscriber capacity, descending into subscribers");
        let mut branches = Vec::new();
        for subscriber in &response.subscribers {
            let next_node: NodeAddress = subscriber.cname.clone().into();
            if visited.contains(&next_node) {
                continue;
            }
            // The subscriber's reported latency is already cumulative
            // from the publisher through this node to it, so it
            // replaces `cumulative_so_far` rather than adding to it.
            let next_cumulative = duration_from_proto(subscriber.latency.as_ref());
            match self
                .descend(
                    next_node,
                    stream_id.clone(),
                    next_cumulative,
                    trace.clone(),
                    visited.clone(),
                )
                .await
            {
                Ok(target) => branches.push(target),
                Err(_) => continue,
            }
        }

        branches
            .into_iter()
            .min_by_key(|t| t.incremental_latency + t.cumulative_latency)
            .ok_or_else(|| Error::Unavailable(format!("no reachable leech target for {stream_id}")))
    }
}

fn duration_from_proto(d: Option<&prost_types::Duration>) -> Duration {
    match d {
        Some(d) => Duration::new(d.seconds.max(0) as u64, (d.nanos.max(0)) as u32),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use swarmcast_proto::{ResolveResponse, Subscriber, TraverseResponse};

    mock! {
        Client {}

        #[async_trait]
        impl TraverseClient for Client {
            async fn traverse(&self, node: &NodeAddress, stream_id: String) -> Result<TraverseResponse>;
            async fn resolve(&self, node: &NodeAddress) -> Result<ResolveResponse>;
        }
    }

    fn proto_duration(ms: i64) -> prost_types::Duration {
        prost_types::Duration {
            seconds: ms / 1000,
            nanos: ((ms % 1000) * 1_000_000) as i32,
        }
    }

    #[tokio::test]
    async fn leeches_directly_from_publisher_with_no_subscribers() {
        let mut client = MockClient::new();
        client
            .expect_traverse()
            .returning(|_, _| {
                Ok(TraverseResponse {
                    requested_max_subscribers: 10,
                    subscribers: vec![],
                })
            });

        let resolver = RelayResolver::new(Arc::new(client));
        let target = resolver
            .resolve("publisher".into(), "stream-1".to_string())
            .await
            .unwrap();

        assert_eq!(target.node, "publisher".into());
        assert_eq!(target.trace, vec!["publisher".into()]);
    }

    #[tokio::test]
    async fn descends_into_cheapest_subscriber_when_publisher_is_full() {
        let mut client = MockClient::new();
        client.expect_traverse().returning(|node, _| {
            if node.as_str() == "publisher" {
                Ok(TraverseResponse {
                    requested_max_subscribers: 2,
                    subscribers: vec![
                        Subscriber {
                            cname: "cheap".to_string(),
                            latency: Some(proto_duration(5)),
                        },
                        Subscriber {
                            cname: "expensive".to_string(),
                            latency: Some(proto_duration(50)),
                        },
                    ],
                })
            } else {
                Ok(TraverseResponse {
                    requested_max_subscribers: 10,
                    subscribers: vec![],
                })
            }
        });

        let resolver = RelayResolver::new(Arc::new(client));
        let target = resolver
            .resolve("publisher".into(), "stream-1".to_string())
            .await
            .unwrap();

        assert_eq!(target.node, "cheap".into());
        assert_eq!(target.cumulative_latency, Duration::from_millis(5));
        assert_eq!(target.trace, vec!["publisher".into(), "cheap".into()]);
    }

    #[tokio::test]
    async fn leeches_directly_when_node_is_at_capacity() {
        let mut client = MockClient::new();
        client.expect_traverse().returning(|_, _| {
            Ok(TraverseResponse {
                requested_max_subscribers: 1,
                subscribers: vec![Subscriber {
                    cname: "cheap".to_string(),
                    latency: Some(proto_duration(1)),
                }],
            })
        });

        let resolver = RelayResolver::new(Arc::new(client));
        let err = resolver
            .resolve("publisher".into(), "stream-1".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn all_branches_failing_returns_unavailable() {
        let mut client = MockClient::new();
        client.expect_traverse().returning(|node, _| {
            if node.as_str() == "publisher" {
                Ok(TraverseResponse {
                    requested_max_subscribers: 1,
                    subscribers: vec![Subscriber {
                        cname: "unreachable".to_string(),
                        latency: Some(proto_duration(1)),
                    }],
                })
            } else {
                Err(Error::Unavailable("dial failed".into()))
            }
        });

        let resolver = RelayResolver::new(Arc::new(client));
        let err = resolver
            .resolve("publisher".into(), "stream-1".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)));
    }
}
