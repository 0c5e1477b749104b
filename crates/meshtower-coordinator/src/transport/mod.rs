//! Pub/sub transport abstraction
//!
//! A zone's channel name is the zone name. Delivery is best effort and in
//! order per publisher; nothing here acknowledges or retries.

mod memory;
mod redis;

pub use memory::MemoryBus;
pub use redis::RedisBus;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Buffered messages per subscription before the reader applies backpressure
pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

/// A publish/subscribe bus
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` on `channel`, returning how many subscribers the bus reports
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, TransportError>;

    /// Subscribe to `channel`; messages arrive in bus order
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

/// Ordered stream of payloads from one channel
///
/// Dropping the subscription stops its background reader.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Bytes>,
    reader: Option<AbortHandle>,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        rx: mpsc::Receiver<Bytes>,
        reader: Option<AbortHandle>,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            reader,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the bus side is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Stop receiving and release the underlying connection
    pub fn close(&mut self) {
        self.rx.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the bus described by `config`
///
/// A Redis bus is pinged before it is returned so that an unreachable broker
/// is reported at startup.
pub async fn connect(config: &TransportConfig) -> Result<Arc<dyn PubSub>, TransportError> {
    match config {
        TransportConfig::Memory => Ok(Arc::new(MemoryBus::new())),
        TransportConfig::Redis { address, password } => {
            let bus = RedisBus::new(address.clone(), password.clone());
            bus.ping().await?;
            Ok(Arc::new(bus))
        }
    }
}
