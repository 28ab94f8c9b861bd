//! Process-wide event bus, publish side
//!
//! Every encoder variant publishes one encode-index event per encoded
//! frame on its own named topic. The transport to other processes is an
//! external collaborator; `LocalBus` is the in-process seam the pipeline
//! publishes into and tests subscribe to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::Codec;

/// Metadata correlating an encoded frame to its segment, position, and
/// source frame identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeIndex {
    /// Segment the frame was encoded into
    pub segment_index: u64,
    /// Position within the segment; shared by all variants of a camera
    /// for the same source frame, contiguous except for recorded gaps
    pub frame_index: u32,
    /// Vision-bus sequence number of the source frame
    pub source_frame_id: u64,
    /// Encoded output size in bytes
    pub encoded_size: u64,
    pub codec: Codec,
}

/// Per-subscriber queue depth. Publishing never blocks; a subscriber
/// that lags past this loses events (counted).
const SUBSCRIBER_DEPTH: usize = 256;

/// Topic-keyed in-process pub/sub.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<EncodeIndex>>>>,
    dropped: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic. Events published after this call are
    /// delivered in publish order.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<EncodeIndex> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber of `topic`.
    ///
    /// Called from encoder threads on the frame path, so it never blocks:
    /// full subscriber queues drop the event, closed subscribers are
    /// pruned.
    pub fn publish(&self, topic: &str, event: EncodeIndex) {
        let mut topics = self.topics.lock().unwrap();
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    debug!(topic, dropped, "subscriber lagging, dropping event");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Events dropped because subscribers lagged.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(frame_index: u32) -> EncodeIndex {
        EncodeIndex {
            segment_index: 0,
            frame_index,
            source_frame_id: frame_index as u64,
            encoded_size: 1024,
            codec: Codec::FullHevc,
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("roadEncodeData");

        for i in 0..5 {
            bus.publish("roadEncodeData", event(i));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().frame_index, i);
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut road = bus.subscribe("roadEncodeData");
        let mut wide = bus.subscribe("wideRoadEncodeData");

        bus.publish("roadEncodeData", event(1));
        assert_eq!(road.recv().await.unwrap().frame_index, 1);
        assert!(wide.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = LocalBus::new();
        bus.publish("driverEncodeData", event(0));
        assert_eq!(bus.dropped(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_not_blocks() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("roadEncodeData");

        for i in 0..(SUBSCRIBER_DEPTH as u32 + 10) {
            bus.publish("roadEncodeData", event(i));
        }
        assert_eq!(bus.dropped(), 10);

        // Oldest events survive, newest were dropped
        assert_eq!(rx.recv().await.unwrap().frame_index, 0);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("roadEncodeData");
        drop(rx);

        bus.publish("roadEncodeData", event(0));
        bus.publish("roadEncodeData", event(1));
        assert_eq!(bus.dropped(), 0);
    }
}
