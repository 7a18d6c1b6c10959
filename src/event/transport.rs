//! Transport boundary.
//!
//! The messaging transport itself (connection, authentication, delivery) lives
//! outside this crate. The correlator only needs two primitives from it: a way to
//! subscribe to inbound events and a way to dispatch an outbound request. Dropping
//! an [`EventReceiver`] is the unsubscribe primitive.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::event_bus::{EventBus, EventError, EventReceiver, EventResult, ReplyToken, Value};

/// Subscription primitive: every call installs a fresh handler on the inbound stream.
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> EventResult<EventReceiver>;
}

impl EventSource for EventBus {
    fn subscribe(&self) -> EventResult<EventReceiver> {
        Ok(EventBus::subscribe(self))
    }
}

/// Action primitive: hands an outbound request to the external agent.
#[async_trait]
pub trait Transport: EventSource {
    async fn dispatch(&self, request: OutboundRequest) -> EventResult<()>;
}

/// A triggering request addressed to an external agent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub target: String,
    pub text: String,
    pub reply_token: Option<ReplyToken>,
    pub parameters: HashMap<String, Value>,
}

impl OutboundRequest {
    pub fn new(target: &str, text: &str) -> Self {
        Self {
            target: target.to_string(),
            text: text.to_string(),
            reply_token: None,
            parameters: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: ReplyToken) -> Self {
        self.reply_token = Some(token);
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

/// In-process transport: inbound events go through an [`EventBus`], outbound
/// requests through a broadcast channel that simulated agents listen on.
pub struct LocalTransport {
    inbound: EventBus,
    outbound: broadcast::Sender<OutboundRequest>,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        let (outbound, _) = broadcast::channel(capacity);
        Self {
            inbound: EventBus::new(capacity),
            outbound,
        }
    }

    /// The inbound side, where agents publish their messages.
    pub fn inbound(&self) -> &EventBus {
        &self.inbound
    }

    /// Stream of dispatched requests, for whoever plays the external agent.
    pub fn outbound_requests(&self) -> broadcast::Receiver<OutboundRequest> {
        self.outbound.subscribe()
    }
}

impl EventSource for LocalTransport {
    fn subscribe(&self) -> EventResult<EventReceiver> {
        Ok(self.inbound.subscribe())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn dispatch(&self, request: OutboundRequest) -> EventResult<()> {
        debug!(target_agent = %request.target, "Dispatching outbound request");
        self.outbound
            .send(request)
            .map(|_| ())
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{ContentKind, InboundEvent};

    #[tokio::test]
    async fn test_dispatch_without_agent_fails() {
        let transport = LocalTransport::new(8);
        let result = transport
            .dispatch(OutboundRequest::new("render_bot", "/render"))
            .await;
        assert!(matches!(result, Err(EventError::SendFailed { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_agent_and_inbound_reaches_subscriber() {
        let transport = LocalTransport::new(8);
        let mut requests = transport.outbound_requests();
        let mut inbound = EventSource::subscribe(&transport).unwrap();

        let token = ReplyToken::generate();
        transport
            .dispatch(OutboundRequest::new("render_bot", "/render").with_token(token.clone()))
            .await
            .unwrap();
        let request = requests.recv().await.unwrap();
        assert_eq!(request.reply_token, Some(token));

        transport
            .inbound()
            .publish(
                InboundEvent::builder("render_bot", ContentKind::Video)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap().kind, ContentKind::Video);
    }
}
