//! `Subscribe`: attaches a new downstream peer to a stream, resolving a
//! relay chain through the directory and other nodes' `Traverse`
//! responses when this node doesn't already carry the stream locally.
//!
//! State machine: `Idle` until the first `Subscription` arrives,
//! `Attaching` while a local track is being resolved (locally present,
//! or leeched from a remote node chosen by the relay resolver),
//! `Streaming` once this node is forwarding packets to at least one
//! subscribed track, `Closed` once the inbound stream ends. Local-store
//! lookup is tried first; only a miss triggers a directory lookup and a
//! resolver descent. A single RPC can carry more than one `Subscription`
//! message, one per component track (video, audio, ...) the peer wants;
//! each is resolved and attached independently as it arrives.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use swarmcast_core::signalling::SignallingBridge;
use swarmcast_core::sink::TrackLocalSink;
use swarmcast_core::track::RemotePacketSource;
use swarmcast_core::types::StreamKey;

use crate::server::NodeState;
use swarmcast_proto::cdn_client::CdnClient;
use swarmcast_proto::subscribe_request::Operation as ReqOp;
use swarmcast_proto::subscribe_response::Operation as RespOp;
use swarmcast_proto::{SubscribeRequest, SubscribeResponse, Subscription, Track};

pub type SubscribeStream = Pin<Box<dyn Stream<Item = Result<SubscribeResponse, Status>> + Send>>;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
enum SubscribeState {
    Idle,
    Attaching,
    Streaming,
    Closed,
}

pub async fn handle(
    state: Arc<NodeState>,
    peer_addr: String,
    mut inbound: Streaming<SubscribeRequest>,
) -> Result<Response<SubscribeStream>, Status> {
    let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Status::internal(e.to_string()))?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let config = RTCConfiguration {
        ice_servers: state.ice_servers.clone(),
        ..Default::default()
    };
    let peer_connection = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| Status::internal(e.to_string()))?,
    );

    let mut bridge = SignallingBridge::wire(peer_connection.clone());
    let mut outbound_signals = bridge
        .take_outbound()
        .expect("outbound channel taken exactly once");

    let signal_tx = response_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = outbound_signals.recv().await {
            let message = SubscribeResponse {
                operation: Some(RespOp::Signal(signal)),
            };
            if signal_tx.send(Ok(message)).await.is_err() {
                break;
            }
        }
    });

    let subscribe_state = Arc::new(parking_lot::Mutex::new(SubscribeState::Idle));
    let cancel = CancellationToken::new();

    tokio::spawn(async move {
        let registry = state.registry.clone();
        let mut attached = Vec::new();
        let mut subscriber_handles = Vec::new();

        loop {
            let request = match inbound.message().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(status) => {
                    warn!(error = %status, "subscribe inbound stream error");
                    break;
                }
            };

            match request.operation {
                Some(ReqOp::Subscription(Subscription { key })) => {
                    let key = StreamKey::from_wire(key);
                    *subscribe_state.lock() = SubscribeState::Attaching;
                    debug!(key = %key, "subscribe attaching");

                    let attach_started = Instant::now();
                    let trace = match ensure_local(state.clone(), key.clone()).await {
                        Ok(trace) => trace,
                        Err(err) => {
                            warn!(error = %err, key = %key, "failed to resolve subscribed track");
                            continue;
                        }
                    };

                    let local_track = Arc::new(TrackLocalStaticRTP::new(
                        RTCRtpCodecCapability {
                            mime_type: "video/H264".to_string(),
                            ..Default::default()
                        },
                        "swarmcast".to_string(),
                        key.to_string(),
                    ));
                    if let Err(err) = peer_connection
                        .add_track(local_track.clone()
                            as Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>)
                        .await
                    {
                        warn!(error = %err, key = %key, "failed to add local track");
                        continue;
                    }

                    let subscription = match registry
                        .subscribe_when_ready(&key, Arc::new(TrackLocalSink::new(local_track)), &cancel)
                        .await
                    {
                        Ok(subscription) => subscription,
                        Err(err) => {
                            warn!(error = %err, key = %key, "failed to attach to local track");
                            continue;
                        }
                    };
                    attached.push(subscription);

                    // Real negotiation/leech cost for this subscriber,
                    // not a placeholder: the relay resolver's cheapest-
                    // leech-target heuristic depends on this being the
                    // actual delay a downstream node would see.
                    let attach_latency = attach_started.elapsed();
                    let subscriber_handle = state.subscribers.register(
                        key.to_string().into(),
                        peer_addr.clone().into(),
                        attach_latency,
                    );
                    subscriber_handles.push((key.clone(), subscriber_handle));

                    let announcement = SubscribeResponse {
                        operation: Some(RespOp::Track(Track {
                            id: "swarmcast".to_string(),
                            stream_id: String::new(),
                            rtp_stream_id: key.to_string(),
                            key: key.to_string(),
                            trace,
                        })),
                    };
                    if response_tx.send(Ok(announcement)).await.is_err() {
                        debug!("subscribe response channel closed before announcement delivered");
                        break;
                    }
                    *subscribe_state.lock() = SubscribeState::Streaming;
                }
                Some(ReqOp::Signal(signal)) => {
                    if let Err(err) = bridge.apply(signal).await {
                        warn!(error = %err, "failed to apply inbound signal");
                    }
                }
                None => {}
            }
        }

        cancel.cancel();
        *subscribe_state.lock() = SubscribeState::Closed;
        for subscription in attached {
            registry.unsubscribe(&subscription);
        }
        for (key, handle) in subscriber_handles {
            state.subscribers.deregister(&key.to_string().into(), handle);
        }
        if let Err(err) = peer_connection.close().await {
            warn!(error = %err, "error closing peer connection");
        }
        info!("subscribe session closed");
    });

    Ok(Response::new(
        Box::pin(ReceiverStream::new(response_rx)) as SubscribeStream
    ))
}

/// Ensure `key` is available in this node's local registry, leeching it
/// from a remote node chosen by the relay resolver if it isn't already.
/// Returns the route trace accumulated by the time the track became
/// locally available.
async fn ensure_local(state: Arc<NodeState>, key: StreamKey) -> swarmcast_core::Result<Vec<String>> {
    if state.registry.contains(&key) {
        return Ok(vec![state.inbound_address.clone()]);
    }

    let lock = state
        .relay_locks
        .entry(key.clone())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone();
    let _guard = lock.lock().await;

    if state.registry.contains(&key) {
        return Ok(vec![state.inbound_address.clone()]);
    }

    let publisher = state
        .directory
        .get(&key)
        .await?
        .ok_or_else(|| swarmcast_core::Error::NotFound(key.to_string()))?;

    let target = state.resolver.resolve(publisher, key.to_string()).await?;
    leech_from(state.clone(), &key, &target.node).await?;

    let mut trace = target.trace.into_iter().map(|n| n.to_string()).collect::<Vec<_>>();
    trace.push(state.inbound_address.clone());
    Ok(trace)
}

/// Dial `upstream`'s `Subscribe` RPC as a client, negotiate a WebRTC
/// session to receive the track, and register the inbound packets as a
/// new local ingress track so this node itself becomes a relay for it.
async fn leech_from(
    state: Arc<NodeState>,
    key: &StreamKey,
    upstream: &swarmcast_core::types::NodeAddress,
) -> swarmcast_core::Result<()> {
    let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{upstream}"))
        .map_err(|e| swarmcast_core::Error::Protocol(e.to_string()))?;
    let channel = endpoint.connect().await?;
    let mut client = CdnClient::new(channel);

    let (request_tx, request_rx) = mpsc::channel::<SubscribeRequest>(RESPONSE_CHANNEL_CAPACITY);
    request_tx
        .send(SubscribeRequest {
            operation: Some(ReqOp::Subscription(Subscription {
                key: key.to_string(),
            })),
        })
        .await
        .map_err(|_| swarmcast_core::Error::Transport("upstream request channel closed".into()))?;

    let outbound = ReceiverStream::new(request_rx);
    let mut inbound = client
        .subscribe(Request::new(outbound))
        .await?
        .into_inner();

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| swarmcast_core::Error::Fatal(e.to_string()))?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let config = RTCConfiguration {
        ice_servers: state.ice_servers.clone(),
        ..Default::default()
    };
    let peer_connection = Arc::new(api.new_peer_connection(config).await?);

    let registry = state.registry.clone();
    let key_for_track = key.clone();
    let (registered_tx, mut registered_rx) = mpsc::channel::<()>(1);
    peer_connection.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
        let registry = registry.clone();
        let key = key_for_track.clone();
        let registered_tx = registered_tx.clone();
        Box::pin(async move {
            let source = Arc::new(RemotePacketSource::new(remote));
            if let Err(err) = registry.insert(key, source) {
                warn!(error = %err, "failed to register leeched track locally");
            }
            let _ = registered_tx.send(()).await;
        })
    }));

    let mut bridge = SignallingBridge::wire(peer_connection.clone());
    let mut outbound_signals = bridge
        .take_outbound()
        .expect("outbound channel taken exactly once");

    let forward_tx = request_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = outbound_signals.recv().await {
            if forward_tx
                .send(SubscribeRequest {
                    operation: Some(ReqOp::Signal(signal)),
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(message) = inbound.next().await {
            match message {
                Ok(SubscribeResponse {
                    operation: Some(RespOp::Signal(signal)),
                }) => {
                    if let Err(err) = bridge.apply(signal).await {
                        warn!(error = %err, "failed to apply upstream signal");
                    }
                }
                Ok(_) => {}
                Err(status) => {
                    warn!(error = %status, "upstream subscribe stream error");
                    break;
                }
            }
        }
    });

    let _ = registered_rx.recv().await;
    Ok(())
}
