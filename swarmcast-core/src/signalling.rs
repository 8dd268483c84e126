//! Signalling Bridge: wires a `RTCPeerConnection`'s negotiation events
//! onto a single ordered outbound channel of `Signal` messages, and
//! applies inbound `Signal` messages (offer/answer/trickle) back onto
//! the connection.
//!
//! `on_negotiation_needed` and `on_ice_candidate` both push onto the
//! same channel so one task can serialize everything going out over the
//! gRPC stream in the order it was generated.

use std::sync::Arc;

use swarmcast_proto::{SignalPayload as Payload, Signal};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};

pub const OUTBOUND_SIGNAL_CHANNEL_CAPACITY: usize = 32;

/// Bridges one peer connection's negotiation events to an outbound
/// channel, and accepts inbound signals to drive the connection.
pub struct SignallingBridge {
    peer_connection: Arc<RTCPeerConnection>,
    outbound_tx: mpsc::Sender<Signal>,
    outbound_rx: Option<mpsc::Receiver<Signal>>,
}

impl SignallingBridge {
    /// Wire negotiation-needed and ICE-candidate callbacks onto a fresh
    /// outbound channel. Call `take_outbound` once to drain it into the
    /// gRPC stream.
    pub fn wire(peer_connection: Arc<RTCPeerConnection>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_SIGNAL_CHANNEL_CAPACITY);

        let negotiate_pc = peer_connection.clone();
        let negotiate_tx = tx.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let pc = negotiate_pc.clone();
            let tx = negotiate_tx.clone();
            Box::pin(async move {
                match make_offer(&pc).await {
                    Ok(sdp) => {
                        if tx.send(Signal {
                            payload: Some(Payload::OfferSdp(sdp)),
                        })
                        .await
                        .is_err()
                        {
                            warn!("outbound signal channel closed, dropping offer");
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to create offer"),
                }
            })
        }));

        let candidate_tx = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let Ok(init) = candidate.to_json() else {
                    return;
                };
                let Ok(json) = serde_json::to_string(&init) else {
                    return;
                };
                if tx
                    .send(Signal {
                        payload: Some(Payload::Trickle(json)),
                    })
                    .await
                    .is_err()
                {
                    debug!("outbound signal channel closed, dropping trickle candidate");
                }
            })
        }));

        Self {
            peer_connection,
            outbound_tx: tx,
            outbound_rx: Some(rx),
        }
    }

    /// Takes ownership of the outbound channel's receiving half. Only
    /// meaningful once; subsequent calls return `None`.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Signal>> {
        self.outbound_rx.take()
    }

    /// Apply an inbound `Signal` from the remote peer.
    pub async fn apply(&self, signal: Signal) -> Result<()> {
        match signal.payload {
            Some(Payload::OfferSdp(sdp)) => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                self.peer_connection.set_remote_description(offer).await?;
                let answer = self.peer_connection.create_answer(None).await?;
                self.peer_connection
                    .set_local_description(answer)
                    .await?;
                let description = self
                    .peer_connection
                    .local_description()
                    .await
                    .ok_or_else(|| Error::Fatal("local description missing after set".into()))?;
                if self
                    .outbound_tx
                    .send(Signal {
                        payload: Some(Payload::AnswerSdp(description.sdp)),
                    })
                    .await
                    .is_err()
                {
                    warn!("outbound signal channel closed, dropping answer");
                }
                Ok(())
            }
            Some(Payload::AnswerSdp(sdp)) => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                self.peer_connection.set_remote_description(answer).await?;
                Ok(())
            }
            Some(Payload::Trickle(json)) => {
                let init: RTCIceCandidateInit = serde_json::from_str(&json)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                self.peer_connection.add_ice_candidate(init).await?;
                Ok(())
            }
            None => Err(Error::Protocol("signal with no payload".into())),
        }
    }
}

async fn make_offer(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    let description = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Fatal("local description missing after set".into()))?;
    Ok(description.sdp)
}
