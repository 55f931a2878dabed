//! Broadcast sink for downstream fan-out.
//!
//! The hub does not manage subscriber membership; it publishes typed
//! events into a `tokio::sync::broadcast` channel and whoever holds a
//! receiver gets them. Publishing with no subscribers is a no-op.

use tokio::sync::broadcast;

use crate::ingest::AlertOutcome;
use crate::listener::DecoderType;
use crate::stats::TimeSeriesResponse;

/// Events pushed to connected consumers.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// One message made it through the ingestion pipeline.
    MessageProcessed {
        decoder: DecoderType,
        outcome: AlertOutcome,
    },
    /// A time-series window was rebuilt.
    TimeSeriesRefreshed {
        window: &'static str,
        response: TimeSeriesResponse,
    },
}

#[derive(Debug, Clone)]
pub struct HubBroadcaster {
    tx: broadcast::Sender<HubEvent>,
}

impl HubBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are their own
    /// problem; the pipeline never blocks on fan-out.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for HubBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = HubBroadcaster::new(8);
        bus.publish(HubEvent::MessageProcessed {
            decoder: DecoderType::Acars,
            outcome: AlertOutcome::default(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = HubBroadcaster::new(8);
        let mut rx = bus.subscribe();

        for decoder in [DecoderType::Acars, DecoderType::Hfdl] {
            bus.publish(HubEvent::MessageProcessed {
                decoder,
                outcome: AlertOutcome::default(),
            });
        }

        match rx.recv().await.unwrap() {
            HubEvent::MessageProcessed { decoder, .. } => {
                assert_eq!(decoder, DecoderType::Acars)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            HubEvent::MessageProcessed { decoder, .. } => {
                assert_eq!(decoder, DecoderType::Hfdl)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
