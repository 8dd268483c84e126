//! `Publish`: accepts an inbound WebRTC offer/answer/trickle exchange
//! from a publisher, registers each track it sends as it arrives, and
//! advertises it in the shared directory.
//!
//! State machine: `Negotiating` while the peer connection is still
//! being set up, `Active` once at least one track has been registered,
//! `Closed` once the inbound stream ends or the peer connection fails.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Response, Status, Streaming};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::track::track_remote::TrackRemote;

use swarmcast_core::signalling::SignallingBridge;
use swarmcast_core::track::RemotePacketSource;
use swarmcast_core::types::{StreamKey, TrackId};

use crate::server::NodeState;
use swarmcast_proto::{publish_response::Operation as Op, PublishRequest, PublishResponse, Track};

pub type PublishStream = Pin<Box<dyn Stream<Item = Result<PublishResponse, Status>> + Send>>;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishState {
    Negotiating,
    Active,
    Closed,
}

pub async fn handle(
    state: Arc<NodeState>,
    mut inbound: Streaming<PublishRequest>,
) -> Result<Response<PublishStream>, Status> {
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

    let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
    let publish_state = Arc::new(Mutex::new(PublishState::Negotiating));
    let track_count = Arc::new(AtomicU32::new(0));
    let published_keys: Arc<Mutex<Vec<StreamKey>>> = Arc::new(Mutex::new(Vec::new()));

    let track_tx = response_tx.clone();
    let track_state = state.clone();
    let track_publish_state = publish_state.clone();
    let track_count_for_cb = track_count.clone();
    let track_published_keys = published_keys.clone();
    peer_connection.on_track(Box::new(move |remote: Arc<TrackRemote>, _receiver, _| {
        let tx = track_tx.clone();
        let node_state = track_state.clone();
        let publish_state = track_publish_state.clone();
        let track_count = track_count_for_cb.clone();
        let published_keys = track_published_keys.clone();
        Box::pin(async move {
            let track_id: TrackId = remote.id().into();
            let rid = remote.rid().to_string();
            let stream_id = remote.stream_id().to_string().into();
            let key = StreamKey::derive(&stream_id, &track_id, &rid);

            let source = Arc::new(RemotePacketSource::new(remote));
            if let Err(err) = node_state.registry.insert(key.clone(), source) {
                warn!(error = %err, "failed to register ingress track");
                return;
            }
            if let Err(err) = node_state
                .directory
                .put(&key, &node_state.inbound_address.clone().into())
                .await
            {
                warn!(error = %err, "failed to announce track in directory, undoing registration");
                node_state.registry.remove(&key);
                return;
            }
            published_keys.lock().push(key.clone());

            track_count.fetch_add(1, Ordering::Relaxed);
            *publish_state.lock() = PublishState::Active;

            let announcement = PublishResponse {
                operation: Some(Op::Track(Track {
                    id: track_id.to_string(),
                    stream_id: stream_id.to_string(),
                    rtp_stream_id: rid,
                    key: key.to_string(),
                    trace: vec![],
                })),
            };
            if tx.send(Ok(announcement)).await.is_err() {
                debug!("publish response channel closed before track announcement delivered");
            }
        })
    }));

    tokio::spawn(async move {
        while let Some(signal) = outbound_signals.recv().await {
            let message = PublishResponse {
                operation: Some(Op::Signal(signal)),
            };
            if response_tx.send(Ok(message)).await.is_err() {
                break;
            }
        }
    });

    let close_state = state.clone();
    tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(request)) => {
                    if let Some(signal) = request.signal {
                        if let Err(err) = bridge.apply(signal).await {
                            warn!(error = %err, "failed to apply inbound signal");
                        }
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    warn!(error = %status, "publish inbound stream error");
                    break;
                }
            }
        }
        *publish_state.lock() = PublishState::Closed;
        info!(
            tracks = track_count.load(Ordering::Relaxed),
            "publish session closed"
        );
        let keys = std::mem::take(&mut *published_keys.lock());
        for key in keys {
            close_state.registry.remove(&key);
            if let Err(err) = close_state.directory.delete(&key).await {
                warn!(error = %err, key = %key, "failed to remove stale directory entry on disconnect");
            }
        }
        if let Err(err) = peer_connection.close().await {
            warn!(error = %err, "error closing peer connection");
        }
    });

    Ok(Response::new(
        Box::pin(ReceiverStream::new(response_rx)) as PublishStream
    ))
}
