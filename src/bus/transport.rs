//! Broker abstraction.
//!
//! A [`Transport`] moves opaque text frames between named channels. It knows
//! nothing about envelopes; [`BusClient`](super::BusClient) layers encoding,
//! retry and resubscription on top. Delivery is at-most-once: a frame
//! published while a subscriber is disconnected is gone.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Boxed future returned by transport operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receiving half of a channel subscription.
pub type FrameReceiver = broadcast::Receiver<String>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Connection refused, dropped, or not yet re-established.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("bus authentication failed")]
    Auth,
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransportUnavailable
    }

    /// Worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

/// A channel-addressed publish/subscribe broker.
pub trait Transport: Send + Sync {
    /// Present the bus password. Brokers without auth accept anything.
    fn authenticate<'a>(&'a self, password: Option<&'a str>) -> BusFuture<'a, Result<(), BusError>>;

    /// Publish `frame` on `channel`, returning how many subscribers received it.
    fn publish<'a>(&'a self, channel: &'a str, frame: String) -> BusFuture<'a, Result<usize, BusError>>;

    fn subscribe<'a>(&'a self, channel: &'a str) -> BusFuture<'a, Result<FrameReceiver, BusError>>;

    /// Cheap connectivity check.
    fn ping(&self) -> BusFuture<'_, Result<(), BusError>>;
}
