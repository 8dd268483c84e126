//! Exercises the directory and relay resolver together: a publisher
//! announces a stream, a resolver descends through two levels of
//! subscribers, and the chosen leech target is the cheapest reachable
//! node that still has capacity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use swarmcast_core::directory::{Directory, InMemoryDirectory};
use swarmcast_core::resolver::RelayResolver;
use swarmcast_core::rpc_client::TraverseClient;
use swarmcast_core::types::StreamKey;
use swarmcast_core::Result;
use swarmcast_proto::{ResolveResponse, Subscriber, TraverseResponse};

mock! {
    Client {}

    #[async_trait]
    impl TraverseClient for Client {
        async fn traverse(&self, node: &swarmcast_core::types::NodeAddress, stream_id: String) -> Result<TraverseResponse>;
        async fn resolve(&self, node: &swarmcast_core::types::NodeAddress) -> Result<ResolveResponse>;
    }
}

fn proto_duration(ms: i64) -> prost_types::Duration {
    prost_types::Duration {
        seconds: ms / 1000,
        nanos: ((ms % 1000) * 1_000_000) as i32,
    }
}

#[tokio::test]
async fn directory_lookup_feeds_resolver_descent() {
    let directory = InMemoryDirectory::new();
    let key = StreamKey::derive(&"live-1".into(), &"video".into(), "");
    directory.put(&key, &"publisher:50051".into()).await.unwrap();

    let mut client = MockClient::new();
    client.expect_traverse().returning(|node, _| {
        let response = match node.as_str() {
            "publisher:50051" => TraverseResponse {
                requested_max_subscribers: 1,
                subscribers: vec![Subscriber {
                    cname: "relay-a:50051".to_string(),
                    latency: Some(proto_duration(8)),
                }],
            },
            "relay-a:50051" => TraverseResponse {
                requested_max_subscribers: 10,
                subscribers: vec![],
            },
            other => panic!("unexpected traverse target {other}"),
        };
        Ok(response)
    });

    let resolver = RelayResolver::new(Arc::new(client));
    let publisher = directory.get(&key).await.unwrap().expect("published");
    let target = resolver
        .resolve(publisher, key.to_string())
        .await
        .unwrap();

    assert_eq!(target.node, "relay-a:50051".into());
    assert_eq!(target.cumulative_latency, Duration::from_millis(8));
    assert_eq!(
        target.trace,
        vec!["publisher:50051".into(), "relay-a:50051".into()]
    );
}

#[tokio::test]
async fn unknown_key_fails_before_any_traverse_call() {
    let directory = InMemoryDirectory::new();
    let key = StreamKey::derive(&"missing".into(), &"video".into(), "");
    assert!(directory.get(&key).await.unwrap().is_none());
}
