//! # Event Bus Implementation
//!
//! The EventBus is the inbound side of the transport: every message the external
//! agents produce is published here and fanned out to subscribers.
//!
//! ## Features
//!
//! - **Broadcast Channel**: Efficiently delivers events to multiple subscribers
//! - **Arrival Stamping**: Each published event carries its local arrival instant
//! - **Lag Reporting**: Slow subscribers learn how many events they missed
//!
//! ## Design Decisions
//!
//! The implementation uses Tokio's broadcast channel rather than MPSC channels to:
//!
//! 1. Allow multiple subscribers to receive the same event
//! 2. Efficiently handle backpressure through the channel capacity
//! 3. Support non-blocking publish operations
//!
//! The bus gives no request/response framing. Inbound events are not tagged with
//! anything that references an outgoing request, which is why the correlator has to
//! match replies by predicate.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// Content classification of an inbound event.
///
/// Predicates use it to tell e.g. a video reply apart from an acknowledgement
/// text sent by the same agent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Text,
    Photo,
    Video,
    Animation,
    Audio,
    Voice,
    Document,
    Sticker,
    Location,
    Contact,
    Poll,
    Service,
    Other,
}

impl ContentKind {
    /// Anything that carries a media attachment.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            ContentKind::Photo
                | ContentKind::Video
                | ContentKind::Animation
                | ContentKind::Audio
                | ContentKind::Voice
                | ContentKind::Document
                | ContentKind::Sticker
        )
    }
}

/// Opaque token embedded in an outbound request and echoed back by agents that
/// support exact correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyToken(String);

impl ReplyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// # InboundEvent
///
/// A single message delivered by the transport.
///
/// ## Structure
///
/// * `sender`: identity of the originator (the external agent, or anyone else)
/// * `sent_at`: timestamp supplied by the originator
/// * `kind`: content-kind classification
/// * `text`: optional text body or caption
/// * `reply_token`: echoed correlation token, when the agent supports one
/// * `parameters`: any further payload as key-value pairs
///
/// ## Example
///
/// ```rust,no_run
/// # use reply_correlator::event_bus::{ContentKind, InboundEvent, Value};
/// let event = InboundEvent::builder("render_bot", ContentKind::Video)
///     .text("here is your clip")
///     .parameter("duration_secs", Value::Integer(12))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub id: Uuid,
    pub sender: String,
    pub sent_at: DateTime<Utc>,
    pub kind: ContentKind,
    pub text: Option<String>,
    pub reply_token: Option<ReplyToken>,
    pub parameters: HashMap<String, Value>,
    received_at: Instant,
}

impl InboundEvent {
    pub fn builder(sender: &str, kind: ContentKind) -> InboundEventBuilder {
        InboundEventBuilder::new(sender, kind)
    }

    /// Local arrival instant. Set by [`EventBus::publish`], or at build time for
    /// events injected directly.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub(crate) fn stamp_arrival(&mut self, at: Instant) {
        self.received_at = at;
    }

    pub fn is_from(&self, sender: &str) -> bool {
        self.sender == sender
    }
}

#[derive(Clone)]
pub struct InboundEventBuilder {
    sender: String,
    kind: ContentKind,
    sent_at: Option<DateTime<Utc>>,
    text: Option<String>,
    reply_token: Option<ReplyToken>,
    parameters: HashMap<String, Value>,
}

impl InboundEventBuilder {
    pub fn new(sender: &str, kind: ContentKind) -> Self {
        Self {
            sender: sender.to_string(),
            kind,
            sent_at: None,
            text: None,
            reply_token: None,
            parameters: HashMap::new(),
        }
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn reply_token(mut self, token: ReplyToken) -> Self {
        self.reply_token = Some(token);
        self
    }

    pub fn parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> EventResult<InboundEvent> {
        if self.sender.trim().is_empty() {
            return Err(EventError::BuilderFailed(
                "sender is required".to_string(),
            ));
        }
        Ok(InboundEvent {
            id: Uuid::new_v4(),
            sender: self.sender,
            sent_at: self.sent_at.unwrap_or_else(Utc::now),
            kind: self.kind,
            text: self.text,
            reply_token: self.reply_token,
            parameters: self.parameters,
            received_at: Instant::now(),
        })
    }
}

// 値の型
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Duration(Duration),
    Map(HashMap<String, Value>),
    Null,
}

impl<T: Into<String>> From<T> for Value
where
    T: AsRef<str>,
{
    fn from(value: T) -> Self {
        Value::String(value.into())
    }
}

/// # EventBus
///
/// Central hub for inbound events. Provides a broadcast-based publish-subscribe
/// mechanism; each subscriber sees every event published after it subscribed.
///
/// ## Capacity and Backpressure
///
/// If a subscriber falls more than `capacity` events behind, it skips ahead and
/// receives [`EventError::Lagged`] once.
pub struct EventBus {
    /// Broadcast sender for inbound events
    event_sender: broadcast::Sender<InboundEvent>,
    /// Maximum number of events that can be buffered
    capacity: usize,
    /// Internal receiver to keep the broadcast channel active
    _internal_receiver: broadcast::Receiver<InboundEvent>,
}

impl EventBus {
    /// Creates a new EventBus with the specified buffer capacity.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use reply_correlator::event_bus::EventBus;
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (event_sender, event_receiver) = broadcast::channel(capacity);
        Self {
            event_sender,
            capacity,
            _internal_receiver: event_receiver,
        }
    }

    /// Subscribes to inbound events.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use reply_correlator::event_bus::EventBus;
    /// # fn example() {
    /// let event_bus = EventBus::new(100);
    /// let mut event_rx = event_bus.subscribe();
    ///
    /// tokio::spawn(async move {
    ///     while let Ok(event) = event_rx.recv().await {
    ///         // Process event
    ///     }
    /// });
    /// # }
    /// ```
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.event_sender.subscribe())
    }

    /// Stamps the arrival instant and publishes the event to all subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be sent, typically because
    /// the channel is closed.
    pub async fn publish(&self, event: InboundEvent) -> EventResult<()> {
        self.sync_publish(event)
    }

    /// Same as [`EventBus::publish`], usable from a synchronous context.
    pub fn sync_publish(&self, mut event: InboundEvent) -> EventResult<()> {
        event.stamp_arrival(Instant::now());
        debug_event("Publishing", &event);
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Number of live subscriptions, not counting the bus's own keep-alive receiver.
    pub fn subscribers_size(&self) -> usize {
        self.event_sender.receiver_count().saturating_sub(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub fn debug_event(prefix: &str, event: &InboundEvent) {
    match event.kind {
        ContentKind::Service => trace!("{} Event: {:?}", prefix, event),
        _ => debug!(
            "{} Event: id={} sender={} kind={}",
            prefix, event.id, event.sender, event.kind
        ),
    }
}

pub struct EventReceiver {
    pub receiver: broadcast::Receiver<InboundEvent>,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<InboundEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. On lag the receiver skips to the newest events and
    /// reports how many were dropped; call `recv` again promptly to keep up.
    pub async fn recv(&mut self) -> EventResult<InboundEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event Send failed: {message}")]
    SendFailed { message: String },

    #[error("Event stream closed")]
    Closed,

    #[error("Event lagged: {count}")]
    Lagged { count: u64 },

    #[error("Subscription failed: {message}")]
    SubscribeFailed { message: String },

    #[error("event builder failed: {0}")]
    BuilderFailed(String),
}

pub type EventResult<T> = Result<T, EventError>;
