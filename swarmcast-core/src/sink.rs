//! Downstream packet sinks for the local track registry.
//!
//! A `Sink` is anything an ingress track can fan its RTP packets out to:
//! a live WebRTC `TrackLocalStaticRTP` for a subscriber, or (in tests) an
//! in-memory recorder. Abstracting it behind a trait lets the fan-out
//! logic in `registry.rs` be exercised without a live peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::error::Result;

#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<()>;
}

pub struct TrackLocalSink {
    track: Arc<TrackLocalStaticRTP>,
}

impl TrackLocalSink {
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl Sink for TrackLocalSink {
    async fn write_rtp(&self, packet: &Packet) -> Result<()> {
        self.track.write_rtp(packet).await.map(|_| ()).map_err(Into::into)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub received: Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write_rtp(&self, packet: &Packet) -> Result<()> {
            self.received.lock().push(packet.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn write_rtp(&self, _packet: &Packet) -> Result<()> {
            Err(crate::error::Error::Transport("sink closed".into()))
        }
    }
}
