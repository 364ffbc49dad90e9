//! Message envelope: the immutable unit of agent-to-agent communication.
//!
//! Envelopes travel as JSON objects:
//!
//! ```json
//! {"message_id": "0192…", "correlation_id": null, "sender_id": "api-server",
//!  "recipient_id": "api-calculator-001", "message_type": "TASK_REQUEST",
//!  "task_type": "multiply", "payload": {"a": 6, "b": 7},
//!  "timestamp": "2026-01-01T00:00:00Z", "ttl_seconds": 30.0, "signature": "…"}
//! ```
//!
//! Every constructor and the decoder run the same validation, so an
//! [`Envelope`] value in hand is always well-formed. Envelopes are built by
//! an [`Origin`], which owns the sender id, keeps per-sender timestamps
//! non-decreasing, and signs with the sender's identity when it has one.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::identity::{Identity, SignatureError, verify_signature};

/// Task arguments or results: an insertion-ordered JSON object.
pub type Payload = Map<String, Value>;

/// Recipient id used by heartbeats and other broadcast envelopes.
pub const BROADCAST_RECIPIENT: &str = "*";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A field violates the envelope invariants.
    #[error("invalid envelope: {0}")]
    Validation(String),

    /// The frame is not a JSON envelope at all.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope from '{0}' is not signed")]
    Unsigned(String),

    #[error("bad signature from '{sender_id}': {source}")]
    Signature {
        sender_id: String,
        #[source]
        source: SignatureError,
    },
}

impl EnvelopeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::General
    }
}

// ── MessageType ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    TaskError,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskResponse => "TASK_RESPONSE",
            MessageType::TaskError => "TASK_ERROR",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TASK_REQUEST" => Some(MessageType::TaskRequest),
            "TASK_RESPONSE" => Some(MessageType::TaskResponse),
            "TASK_ERROR" => Some(MessageType::TaskError),
            "HEARTBEAT" => Some(MessageType::Heartbeat),
            _ => None,
        }
    }

    /// `TASK_RESPONSE` or `TASK_ERROR`.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::TaskResponse | MessageType::TaskError)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    message_id: String,
    correlation_id: Option<String>,
    sender_id: String,
    recipient_id: String,
    message_type: MessageType,
    task_type: Option<String>,
    payload: Payload,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Decoding target: `message_type` stays a string so an unknown value is a
/// validation failure rather than a parse failure.
#[derive(Deserialize)]
struct WireEnvelope {
    message_id: String,
    #[serde(default)]
    correlation_id: Option<String>,
    sender_id: String,
    recipient_id: String,
    message_type: String,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    payload: Payload,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    ttl_seconds: Option<f64>,
    #[serde(default)]
    signature: Option<String>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(w: WireEnvelope) -> Result<Self, Self::Error> {
        let message_type = MessageType::parse(&w.message_type).ok_or_else(|| {
            EnvelopeError::Validation(format!("unrecognized message_type '{}'", w.message_type))
        })?;
        let envelope = Envelope {
            message_id: w.message_id,
            correlation_id: w.correlation_id,
            sender_id: w.sender_id,
            recipient_id: w.recipient_id,
            message_type,
            task_type: w.task_type,
            payload: w.payload,
            timestamp: w.timestamp,
            ttl_seconds: w.ttl_seconds,
            signature: w.signature,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

/// The signed portion of an envelope: every field except `signature`, in
/// wire order.
#[derive(Serialize)]
struct SignedFields<'a> {
    message_id: &'a str,
    correlation_id: &'a Option<String>,
    sender_id: &'a str,
    recipient_id: &'a str,
    message_type: MessageType,
    task_type: &'a Option<String>,
    payload: &'a Payload,
    timestamp: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<f64>,
}

impl Envelope {
    /// Decode and validate one wire frame.
    pub fn from_json(frame: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope =
            serde_json::from_str(frame).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Envelope::try_from(wire)
    }

    pub fn to_json(&self) -> String {
        // Serializing a map of `Value`s with string keys cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let blank = |s: &str| s.trim().is_empty();
        if blank(&self.message_id) {
            return Err(EnvelopeError::Validation("message_id must not be empty".into()));
        }
        if blank(&self.sender_id) {
            return Err(EnvelopeError::Validation("sender_id must not be empty".into()));
        }
        if blank(&self.recipient_id) {
            return Err(EnvelopeError::Validation("recipient_id must not be empty".into()));
        }
        if self.message_type == MessageType::TaskRequest
            && self.task_type.as_deref().is_none_or(blank)
        {
            return Err(EnvelopeError::Validation(
                "task_type is required for TASK_REQUEST".into(),
            ));
        }
        if self.message_type.is_reply() && self.correlation_id.as_deref().is_none_or(blank) {
            return Err(EnvelopeError::Validation(format!(
                "correlation_id is required for {}",
                self.message_type
            )));
        }
        if let Some(ttl) = self.ttl_seconds {
            if !(ttl.is_finite() && ttl > 0.0) {
                return Err(EnvelopeError::Validation(format!(
                    "ttl_seconds must be positive, got {ttl}"
                )));
            }
        }
        Ok(())
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let fields = SignedFields {
            message_id: &self.message_id,
            correlation_id: &self.correlation_id,
            sender_id: &self.sender_id,
            recipient_id: &self.recipient_id,
            message_type: self.message_type,
            task_type: &self.task_type,
            payload: &self.payload,
            timestamp: &self.timestamp,
            ttl_seconds: self.ttl_seconds,
        };
        serde_json::to_vec(&fields).unwrap_or_default()
    }

    /// Check the signature against the sender's hex public key.
    pub fn verify(&self, public_key_hex: &str) -> Result<(), EnvelopeError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| EnvelopeError::Unsigned(self.sender_id.clone()))?;
        verify_signature(public_key_hex, &self.signing_bytes(), signature).map_err(|source| {
            EnvelopeError::Signature { sender_id: self.sender_id.clone(), source }
        })
    }

    /// `true` once `timestamp + ttl_seconds` lies before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl_seconds else {
            return false;
        };
        TimeDelta::try_milliseconds((ttl * 1000.0) as i64)
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl))
            .is_some_and(|deadline| now > deadline)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn task_type(&self) -> Option<&str> {
        self.task_type.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ttl_seconds(&self) -> Option<f64> {
        self.ttl_seconds
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

// ── Origin ───────────────────────────────────────────────────────────────────

/// Envelope factory for one sender.
pub struct Origin {
    sender_id: String,
    identity: Option<Identity>,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl Origin {
    pub fn new(sender_id: impl Into<String>) -> Result<Self, EnvelopeError> {
        let sender_id = sender_id.into();
        if sender_id.trim().is_empty() {
            return Err(EnvelopeError::Validation("sender_id must not be empty".into()));
        }
        Ok(Self {
            sender_id,
            identity: None,
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    /// Sign every envelope built from here on.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().max(*last);
        *last = now;
        now
    }

    fn seal(
        &self,
        message_type: MessageType,
        recipient_id: &str,
        correlation_id: Option<String>,
        task_type: Option<String>,
        payload: Payload,
        ttl_seconds: Option<f64>,
    ) -> Result<Envelope, EnvelopeError> {
        let mut envelope = Envelope {
            message_id: Uuid::now_v7().to_string(),
            correlation_id,
            sender_id: self.sender_id.clone(),
            recipient_id: recipient_id.to_string(),
            message_type,
            task_type,
            payload,
            timestamp: self.next_timestamp(),
            ttl_seconds,
            signature: None,
        };
        envelope.validate()?;
        if let Some(identity) = &self.identity {
            envelope.signature = Some(identity.sign(&envelope.signing_bytes()));
        }
        Ok(envelope)
    }

    pub fn request(
        &self,
        recipient_id: &str,
        task_type: &str,
        payload: Payload,
        ttl_seconds: Option<f64>,
    ) -> Result<Envelope, EnvelopeError> {
        self.seal(
            MessageType::TaskRequest,
            recipient_id,
            None,
            Some(task_type.to_string()),
            payload,
            ttl_seconds,
        )
    }

    /// `TASK_RESPONSE` addressed back to the request's sender.
    pub fn response(&self, request: &Envelope, payload: Payload) -> Result<Envelope, EnvelopeError> {
        self.reply(MessageType::TaskResponse, request, payload)
    }

    /// `TASK_ERROR` addressed back to the request's sender.
    pub fn error(&self, request: &Envelope, payload: Payload) -> Result<Envelope, EnvelopeError> {
        self.reply(MessageType::TaskError, request, payload)
    }

    fn reply(
        &self,
        message_type: MessageType,
        request: &Envelope,
        payload: Payload,
    ) -> Result<Envelope, EnvelopeError> {
        self.seal(
            message_type,
            request.sender_id(),
            Some(request.message_id().to_string()),
            request.task_type.clone(),
            payload,
            None,
        )
    }

    pub fn heartbeat(&self, payload: Payload) -> Result<Envelope, EnvelopeError> {
        self.seal(MessageType::Heartbeat, BROADCAST_RECIPIENT, None, None, payload, None)
    }
}
