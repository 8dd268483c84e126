//! Ingress track reading and fan-out to registered sinks.
//!
//! A background reader task pulls packets off the source and forwards
//! them to every sink currently subscribed via a bounded channel,
//! dropping on backpressure rather than blocking the reader.
//!
//! `PacketSource` lets `IngressTrack` be driven from a canned packet
//! sequence in tests instead of a live `TrackRemote`, which has no
//! in-process way to synthesize RTP without a real ICE session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rtp::packet::Packet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::track::track_remote::TrackRemote;

pub const RTP_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait PacketSource: Send + Sync + 'static {
    /// Read the next packet, or `None` once the source is exhausted/closed.
    async fn read(&self) -> Option<Packet>;
}

pub struct RemotePacketSource {
    track: Arc<TrackRemote>,
}

impl RemotePacketSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl PacketSource for RemotePacketSource {
    async fn read(&self) -> Option<Packet> {
        match self.track.read_rtp().await {
            Ok((packet, _attrs)) => Some(packet),
            Err(_) => None,
        }
    }
}

#[derive(Default)]
pub struct TrackStats {
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

impl TrackStats {
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

/// An ingress track: reads packets from a `PacketSource` and forwards
/// them onto one outbound channel per current subscriber.
pub struct IngressTrack {
    stats: Arc<TrackStats>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl IngressTrack {
    /// Spawn the reader loop. `senders` is a live view the reader
    /// consults on every packet; `registry.rs` owns mutation of it.
    pub fn spawn(
        source: Arc<dyn PacketSource>,
        senders: Arc<dashmap::DashMap<uuid::Uuid, mpsc::Sender<Packet>>>,
    ) -> Self {
        let stats = Arc::new(TrackStats::default());
        let cancel = CancellationToken::new();

        let task_stats = stats.clone();
        let task_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    packet = source.read() => packet,
                };
                let Some(packet) = packet else {
                    break;
                };
                task_stats.packets_received.fetch_add(1, Ordering::Relaxed);

                for entry in senders.iter() {
                    match entry.value().try_send(packet.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            task_stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(sink = %entry.key(), "dropping rtp packet, sink backpressured");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            // Reader keeps running; registry.rs deregisters closed sinks.
                        }
                    }
                }
            }
        });

        Self {
            stats,
            cancel,
            reader: Some(reader),
        }
    }

    pub fn stats(&self) -> Arc<TrackStats> {
        self.stats.clone()
    }
}

impl Drop for IngressTrack {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        packets: StdMutex<std::vec::IntoIter<Packet>>,
    }

    impl ScriptedSource {
        fn new(packets: Vec<Packet>) -> Self {
            Self {
                packets: StdMutex::new(packets.into_iter()),
            }
        }
    }

    #[async_trait]
    impl PacketSource for ScriptedSource {
        async fn read(&self) -> Option<Packet> {
            self.packets.lock().unwrap().next()
        }
    }

    fn sample_packet(seq: u16) -> Packet {
        let mut packet = Packet::default();
        packet.header.sequence_number = seq;
        packet
    }

    #[tokio::test]
    async fn forwards_packets_to_registered_sender() {
        let senders = Arc::new(dashmap::DashMap::new());
        let (tx, mut rx) = mpsc::channel(RTP_CHANNEL_CAPACITY);
        senders.insert(uuid::Uuid::new_v4(), tx);

        let source = Arc::new(ScriptedSource::new(vec![sample_packet(1), sample_packet(2)]));
        let track = IngressTrack::spawn(source, senders);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.header.sequence_number, 1);
        assert_eq!(second.header.sequence_number, 2);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(track.stats().packets_received(), 2);
    }

    #[tokio::test]
    async fn drops_on_full_channel_without_blocking() {
        let senders = Arc::new(dashmap::DashMap::new());
        let (tx, mut rx) = mpsc::channel(1);
        senders.insert(uuid::Uuid::new_v4(), tx);

        let packets: Vec<Packet> = (0..4).map(sample_packet).collect();
        let source = Arc::new(ScriptedSource::new(packets));
        let track = IngressTrack::spawn(source, senders);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(track.stats().packets_received() >= 1);
        // Channel holds at most 1 undelivered packet; reader never blocked.
        let _ = rx.try_recv();
    }
}
