//! In-process broker.
//!
//! One `tokio::sync::broadcast` channel per logical channel name. Receivers
//! that fall more than `buffer` frames behind lose the oldest frames.
//! [`MemoryTransport::disconnect`] drops every channel, which closes all
//! receivers, and refuses traffic until [`MemoryTransport::reconnect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::transport::{BusError, BusFuture, FrameReceiver, Transport};

struct BrokerState {
    connected: bool,
    channels: HashMap<String, broadcast::Sender<String>>,
}

pub struct MemoryTransport {
    buffer: usize,
    password: Option<String>,
    state: Mutex<BrokerState>,
    publish_calls: AtomicU64,
}

impl MemoryTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            password: None,
            state: Mutex::new(BrokerState { connected: true, channels: HashMap::new() }),
            publish_calls: AtomicU64::new(0),
        }
    }

    /// Require `password` from every client.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a broker outage. Open subscriptions observe a closed channel.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.channels.clear();
        info!("memory bus disconnected");
    }

    pub fn reconnect(&self) {
        self.state().connected = true;
        info!("memory bus reconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Number of publish calls seen, successful or not.
    pub fn publish_count(&self) -> u64 {
        self.publish_calls.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map_or(0, |tx| tx.receiver_count())
    }

    fn ensure_connected(state: &BrokerState) -> Result<(), BusError> {
        if state.connected {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus is disconnected".into()))
        }
    }
}

impl Transport for MemoryTransport {
    fn authenticate<'a>(&'a self, password: Option<&'a str>) -> BusFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            Self::ensure_connected(&self.state())?;
            match &self.password {
                Some(expected) if password != Some(expected.as_str()) => Err(BusError::Auth),
                _ => Ok(()),
            }
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, frame: String) -> BusFuture<'a, Result<usize, BusError>> {
        Box::pin(async move {
            self.publish_calls.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state();
            Self::ensure_connected(&state)?;
            let Some(tx) = state.channels.get(channel) else {
                return Ok(0);
            };
            match tx.send(frame) {
                Ok(receivers) => Ok(receivers),
                Err(_) => {
                    debug!(channel, "dropping channel with no subscribers");
                    state.channels.remove(channel);
                    Ok(0)
                }
            }
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BusFuture<'a, Result<FrameReceiver, BusError>> {
        Box::pin(async move {
            let mut state = self.state();
            Self::ensure_connected(&state)?;
            let buffer = self.buffer;
            let tx = state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(buffer).0);
            Ok(tx.subscribe())
        })
    }

    fn ping(&self) -> BusFuture<'_, Result<(), BusError>> {
        Box::pin(async move { Self::ensure_connected(&self.state()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = MemoryTransport::new(8);
        let mut a = bus.subscribe("ch").await.unwrap();
        let mut b = bus.subscribe("ch").await.unwrap();
        assert_eq!(bus.publish("ch", "hello".into()).await.unwrap(), 2);
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_zero() {
        let bus = MemoryTransport::new(8);
        assert_eq!(bus.publish("nobody", "x".into()).await.unwrap(), 0);
        assert_eq!(bus.publish_count(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = MemoryTransport::new(8);
        let rx = bus.subscribe("ch").await.unwrap();
        drop(rx);
        assert_eq!(bus.publish("ch", "x".into()).await.unwrap(), 0);
        assert_eq!(bus.subscriber_count("ch"), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_subscriptions_and_refuses_traffic() {
        let bus = MemoryTransport::new(8);
        let mut rx = bus.subscribe("ch").await.unwrap();
        bus.disconnect();
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(matches!(bus.publish("ch", "x".into()).await, Err(BusError::Unavailable(_))));
        assert!(bus.subscribe("ch").await.is_err());
        assert!(bus.ping().await.is_err());

        bus.reconnect();
        assert!(bus.ping().await.is_ok());
        let mut rx = bus.subscribe("ch").await.unwrap();
        bus.publish("ch", "back".into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "back");
    }

    #[tokio::test]
    async fn password_is_checked() {
        let bus = MemoryTransport::new(8).with_password("s3cret");
        assert_eq!(bus.authenticate(None).await, Err(BusError::Auth));
        assert_eq!(bus.authenticate(Some("wrong")).await, Err(BusError::Auth));
        assert!(bus.authenticate(Some("s3cret")).await.is_ok());
        assert!(MemoryTransport::new(8).authenticate(Some("anything")).await.is_ok());
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = MemoryTransport::new(2);
        let mut rx = bus.subscribe("ch").await.unwrap();
        for i in 0..5 {
            bus.publish("ch", i.to_string()).await.unwrap();
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), "3");
    }
}
