//! In-process pub/sub bus

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::TransportError;

/// Per-channel broadcast capacity
const CHANNEL_CAPACITY: usize = 4096;

/// Pub/sub bus backed by tokio broadcast channels
#[derive(Debug, Default)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, TransportError> {
        // no subscribers is not an error on a pub/sub bus
        Ok(self.sender(channel).send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();

        let reader = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(channel, rx, Some(reader.abort_handle())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let bus = MemoryBus::new();
        let mut sub_a = bus.subscribe("zone").await.unwrap();
        let mut sub_b = bus.subscribe("zone").await.unwrap();

        assert_eq!(bus.publish("zone", Bytes::from_static(b"1")).await.unwrap(), 2);
        bus.publish("zone", Bytes::from_static(b"2")).await.unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"1"));
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"2"));
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let mut blue = bus.subscribe("blue").await.unwrap();

        bus.publish("red", Bytes::from_static(b"red-only")).await.unwrap();
        bus.publish("blue", Bytes::from_static(b"blue")).await.unwrap();

        assert_eq!(blue.recv().await.unwrap(), Bytes::from_static(b"blue"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish("nobody", Bytes::from_static(b"x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscription_ends() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("zone").await.unwrap();
        sub.close();
        assert!(sub.recv().await.is_none());
    }
}
