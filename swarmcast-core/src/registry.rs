//! Local Track Registry: per-node bookkeeping of ingress tracks and the
//! sinks subscribed to them.
//!
//! Fan-out uses a bounded per-sink channel with a dedicated forwarding
//! task per sink, so a slow sink's `write_rtp` never stalls the reader
//! or other sinks.
//!
//! Removal is explicit-only: a sink is dropped from the fan-out set
//! when `unsubscribe` is called, never implicitly because a single
//! write failed or a channel briefly filled up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sink::Sink;
use crate::track::{IngressTrack, PacketSource, RTP_CHANNEL_CAPACITY};
use crate::types::StreamKey;

const NEW_TRACK_CHANNEL_CAPACITY: usize = 64;

struct IngressEntry {
    track: IngressTrack,
    senders: Arc<DashMap<Uuid, mpsc::Sender<rtp::packet::Packet>>>,
    registered_at: Instant,
}

/// Per-node registry of tracks this node is directly ingesting.
pub struct LocalTrackRegistry {
    entries: DashMap<StreamKey, IngressEntry>,
    /// Broadcasts every key as it's inserted, so `subscribe_when_ready`
    /// can wait for a track that hasn't ingressed yet.
    new_tracks: broadcast::Sender<StreamKey>,
}

impl Default for LocalTrackRegistry {
    fn default() -> Self {
        let (new_tracks, _) = broadcast::channel(NEW_TRACK_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            new_tracks,
        }
    }
}

pub struct Subscription {
    pub key: StreamKey,
    pub id: Uuid,
}

impl LocalTrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new ingress track. Errors if one is already registered
    /// for this key, a set-if-not-exists operation rather than an
    /// overwrite.
    pub fn insert(&self, key: StreamKey, source: Arc<dyn PacketSource>) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let senders = Arc::new(DashMap::new());
        let track = IngressTrack::spawn(source, senders.clone());
        self.entries.insert(
            key.clone(),
            IngressEntry {
                track,
                senders,
                registered_at: Instant::now(),
            },
        );
        let _ = self.new_tracks.send(key);
        Ok(())
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Wall-clock time this node has held the track, used by the relay
    /// resolver as a tiebreaker and by `Traverse` for latency estimates.
    pub fn get_latency(&self, key: &StreamKey) -> Option<Duration> {
        self.entries.get(key).map(|e| e.registered_at.elapsed())
    }

    /// Subscribe `sink` to a track's fan-out. Spawns a dedicated
    /// forwarding task so the sink's own `write_rtp` latency never
    /// blocks the ingress reader or sibling sinks.
    pub fn subscribe(&self, key: &StreamKey, sink: Arc<dyn Sink>) -> Result<Subscription> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(RTP_CHANNEL_CAPACITY);
        entry.senders.insert(id, tx);

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(err) = sink.write_rtp(&packet).await {
                    warn!(error = %err, "sink write failed, continuing fan-out");
                }
            }
        });

        Ok(Subscription {
            key: key.clone(),
            id,
        })
    }

    /// Subscribe `sink` to `key`'s fan-out, waiting for the track to
    /// ingress first if it hasn't yet: a `Subscription` message that
    /// names a track the publisher hasn't sent yet still attaches once
    /// it arrives, instead of failing outright. `cancel` unblocks the
    /// wait if the subscribing RPC ends first.
    pub async fn subscribe_when_ready(
        &self,
        key: &StreamKey,
        sink: Arc<dyn Sink>,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        loop {
            if self.entries.contains_key(key) {
                return self.subscribe(key, sink);
            }
            // Subscribe to the broadcast before re-checking, so an
            // insert racing with the check above isn't missed.
            let mut new_tracks = self.new_tracks.subscribe();
            if self.entries.contains_key(key) {
                return self.subscribe(key, sink);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Unavailable(format!(
                        "subscription cancelled before {key} ingressed"
                    )));
                }
                received = new_tracks.recv() => {
                    match received {
                        Ok(inserted) if &inserted == key => return self.subscribe(key, sink),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(Error::Unavailable(format!(
                                "registry closed before {key} ingressed"
                            )));
                        }
                    }
                }
            }
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(entry) = self.entries.get(&subscription.key) {
            entry.senders.remove(&subscription.id);
        }
    }

    pub fn remove(&self, key: &StreamKey) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::{FailingSink, RecordingSink};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        packets: StdMutex<std::vec::IntoIter<rtp::packet::Packet>>,
    }

    impl ScriptedSource {
        fn new(n: u16) -> Self {
            let packets = (0..n)
                .map(|i| {
                    let mut p = rtp::packet::Packet::default();
                    p.header.sequence_number = i;
                    p
                })
                .collect::<Vec<_>>();
            Self {
                packets: StdMutex::new(packets.into_iter()),
            }
        }
    }

    #[async_trait]
    impl PacketSource for ScriptedSource {
        async fn read(&self) -> Option<rtp::packet::Packet> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.packets.lock().unwrap().next()
        }
    }

    #[tokio::test]
    async fn insert_then_insert_again_fails() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        registry
            .insert(key.clone(), Arc::new(ScriptedSource::new(1)))
            .unwrap();
        let err = registry
            .insert(key, Arc::new(ScriptedSource::new(1)))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn subscribe_before_insert_fails() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        let sink = Arc::new(RecordingSink::default());
        assert!(registry.subscribe(&key, sink).is_err());
    }

    #[tokio::test]
    async fn multicasts_to_every_subscribed_sink() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        registry
            .insert(key.clone(), Arc::new(ScriptedSource::new(5)))
            .unwrap();

        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        registry.subscribe(&key, sink_a.clone()).unwrap();
        registry.subscribe(&key, sink_b.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink_a.received.lock().len(), 5);
        assert_eq!(sink_b.received.lock().len(), 5);
    }

    #[tokio::test]
    async fn a_failing_sink_does_not_block_siblings() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        registry
            .insert(key.clone(), Arc::new(ScriptedSource::new(3)))
            .unwrap();

        registry.subscribe(&key, Arc::new(FailingSink)).unwrap();
        let good = Arc::new(RecordingSink::default());
        registry.subscribe(&key, good.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(good.received.lock().len(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_without_removing_track() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        registry
            .insert(key.clone(), Arc::new(ScriptedSource::new(10)))
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let subscription = registry.subscribe(&key, sink.clone()).unwrap();
        registry.unsubscribe(&subscription);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.contains(&key));
    }

    #[tokio::test]
    async fn subscribe_when_ready_attaches_once_the_track_ingresses() {
        let registry = Arc::new(LocalTrackRegistry::new());
        let key = StreamKey::derive(&"s".into(), &"t".into(), "");
        let cancel = CancellationToken::new();

        let waiting_registry = registry.clone();
        let waiting_key = key.clone();
        let sink = Arc::new(RecordingSink::default());
        let waiting_sink = sink.clone();
        let waiting_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiting_registry
                .subscribe_when_ready(&waiting_key, waiting_sink, &waiting_cancel)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .insert(key.clone(), Arc::new(ScriptedSource::new(4)))
            .unwrap();

        let subscription = waiter.await.unwrap().unwrap();
        assert_eq!(subscription.key, key);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.received.lock().len(), 4);
    }

    #[tokio::test]
    async fn subscribe_when_ready_is_cancellable() {
        let registry = LocalTrackRegistry::new();
        let key = StreamKey::derive(&"s".into(), &"never-published".into(), "");
        let cancel = CancellationToken::new();
        let sink = Arc::new(RecordingSink::default());

        cancel.cancel();
        let err = registry
            .subscribe_when_ready(&key, sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
