//! Message bus client: envelope-level publish/subscribe.
//!
//! Channel layout:
//!
//! | channel | traffic |
//! |---|---|
//! | `{prefix}:agent:{agent_id}` | task requests for an agent, replies for a dispatcher |
//! | `{prefix}:broadcast` | heartbeats |
//!
//! Publishing retries transient failures with exponential backoff before it
//! surfaces [`BusError::Unavailable`]. A [`Subscription`] survives broker
//! outages by resubscribing on its own; frames published while it was away
//! are lost.

pub mod envelope;
pub mod memory;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::BusConfig;

pub use envelope::{BROADCAST_RECIPIENT, Envelope, EnvelopeError, MessageType, Origin, Payload};
pub use memory::MemoryTransport;
pub use transport::{BusError, BusFuture, FrameReceiver, Transport};

// ── Channel naming ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Inbox of one agent (or dispatcher).
    pub fn agent(&self, agent_id: &str) -> String {
        format!("{}:agent:{agent_id}", self.prefix)
    }

    pub fn broadcast(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    /// Channel an envelope should be published on.
    pub fn for_recipient(&self, recipient_id: &str) -> String {
        if recipient_id == BROADCAST_RECIPIENT {
            self.broadcast()
        } else {
            self.agent(recipient_id)
        }
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration) -> Self {
        Self { attempts: attempts.max(1), initial_backoff, max_backoff: Duration::from_secs(5) }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exp).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

// ── BusClient ────────────────────────────────────────────────────────────────

/// Shared handle to the bus. Clone freely.
#[derive(Clone)]
pub struct BusClient {
    transport: Arc<dyn Transport>,
    channels: ChannelNames,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl BusClient {
    /// Authenticate against `transport` and return a ready client.
    /// Subscriptions end when `shutdown` is cancelled.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: &BusConfig,
        password: Option<&str>,
        shutdown: CancellationToken,
    ) -> Result<Self, BusError> {
        transport.authenticate(password).await?;
        info!(prefix = %config.channel_prefix, "bus connected");
        Ok(Self {
            transport,
            channels: ChannelNames::new(config.channel_prefix.clone()),
            retry: RetryPolicy::new(config.publish_attempts, config.publish_backoff),
            shutdown,
        })
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Publish on an explicit channel, retrying transient failures.
    /// Returns the number of subscribers that received the frame.
    pub async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, BusError> {
        let frame = envelope.to_json();
        let mut failures = 0;
        loop {
            match self.transport.publish(channel, frame.clone()).await {
                Ok(receivers) => {
                    trace!(
                        channel,
                        message_id = %envelope.message_id(),
                        message_type = %envelope.message_type(),
                        receivers,
                        "published"
                    );
                    return Ok(receivers);
                }
                Err(e) if e.is_transient() && failures + 1 < self.retry.attempts => {
                    failures += 1;
                    let delay = self.retry.delay(failures);
                    warn!(
                        channel,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "publish failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            return Err(BusError::Unavailable("shutting down".into()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publish on the channel addressed by the envelope's recipient.
    pub async fn send(&self, envelope: &Envelope) -> Result<usize, BusError> {
        let channel = self.channels.for_recipient(envelope.recipient_id());
        self.publish(&channel, envelope).await
    }

    /// Subscribe to `channel`. The first subscription attempt follows the
    /// publish retry policy; later reconnects retry until shutdown.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut failures = 0;
        let rx = loop {
            match self.transport.subscribe(channel).await {
                Ok(rx) => break rx,
                Err(e) if e.is_transient() && failures + 1 < self.retry.attempts => {
                    failures += 1;
                    tokio::time::sleep(self.retry.delay(failures)).await;
                }
                Err(e) => return Err(e),
            }
        };
        debug!(channel, "subscribed");
        Ok(Subscription {
            channel: channel.to_string(),
            transport: self.transport.clone(),
            rx: Some(rx),
            retry: self.retry,
            failures: 0,
            stop: self.shutdown.child_token(),
        })
    }

    /// Connectivity probe for health reporting.
    pub async fn probe(&self) -> Result<(), BusError> {
        self.transport.ping().await
    }
}

// ── Subscription ─────────────────────────────────────────────────────────────

/// Restartable stream of envelopes from one channel.
pub struct Subscription {
    channel: String,
    transport: Arc<dyn Transport>,
    rx: Option<FrameReceiver>,
    retry: RetryPolicy,
    failures: u32,
    stop: CancellationToken,
}

enum Frame {
    Stopped,
    Received(Result<String, RecvError>),
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// End this subscription; pending and future `recv` calls return `None`.
    pub fn unsubscribe(&self) {
        self.stop.cancel();
    }

    /// Next valid envelope. Returns `None` only after [`unsubscribe`] or
    /// shutdown; connection loss is handled internally. Cancel-safe.
    ///
    /// [`unsubscribe`]: Subscription::unsubscribe
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }

            if self.rx.is_none() {
                self.resubscribe().await;
                continue;
            }
            let Some(rx) = self.rx.as_mut() else {
                continue;
            };

            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Frame::Stopped,
                r = rx.recv() => Frame::Received(r),
            };

            match frame {
                Frame::Stopped => return None,
                Frame::Received(Ok(text)) => match Envelope::from_json(&text) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => warn!(channel = %self.channel, error = %e, "discarding undecodable frame"),
                },
                Frame::Received(Err(RecvError::Lagged(skipped))) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged; frames dropped");
                }
                Frame::Received(Err(RecvError::Closed)) => {
                    warn!(channel = %self.channel, "bus connection lost; resubscribing");
                    self.rx = None;
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        let attempt = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return,
            r = self.transport.subscribe(&self.channel) => r,
        };
        match attempt {
            Ok(rx) => {
                info!(channel = %self.channel, after_failures = self.failures, "resubscribed");
                self.rx = Some(rx);
                self.failures = 0;
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                let delay = self.retry.delay(self.failures);
                debug!(channel = %self.channel, error = %e, delay_ms = delay.as_millis() as u64, "resubscribe failed");
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
