//! # Request/Reply Correlation
//!
//! Sends a triggering request to an external agent and recognizes, among all
//! unrelated traffic on the shared inbound stream, the one event that is the
//! reply. Exactly once, within a bounded window, with cleanup on every path.
//!
//! ## Components
//!
//! - [`predicate`]: acceptance tests for inbound events
//! - [`registry`]: pending waiters keyed by an internal handle
//! - [`dispatch`]: the correlator proper, one pass per inbound event
//! - [`lifecycle`]: timeouts, exactly-once resolution, detach and subscription
//! - [`facade`]: `await_reply` and friends, what most callers use
//!
//! ## Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use reply_correlator::config::CorrelatorConfig;
//! # use reply_correlator::correlator::{ReplyCorrelator, ReplyMatcher, ReplyTimeout};
//! # use reply_correlator::event_bus::ContentKind;
//! # use reply_correlator::transport::{LocalTransport, OutboundRequest};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(LocalTransport::new(64));
//! let correlator = ReplyCorrelator::with_transport(transport, &CorrelatorConfig::default());
//!
//! let reply = correlator
//!     .request(
//!         OutboundRequest::new("render_bot", "/render cat.gif"),
//!         ReplyMatcher::new()
//!             .from_sender("render_bot")
//!             .sent_after(chrono::Utc::now())
//!             .kind(ContentKind::Video),
//!         ReplyTimeout::from_millis(5_000)?,
//!     )
//!     .await?;
//!
//! match reply {
//!     Some(event) => println!("got {:?}", event.kind),
//!     None => println!("no reply within the window"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod facade;
pub mod lifecycle;
pub mod outcome;
pub mod predicate;
pub mod registry;

use thiserror::Error;

pub use dispatch::Dispatch;
pub use facade::{PendingReply, ReplyCorrelator, SendOrder};
pub use outcome::{CancelReason, ReplyOutcome, ReplyTimeout, WaiterState, MAX_REPLY_TIMEOUT};
pub use predicate::{Predicate, PredicateFault, ReplyMatcher};
pub use registry::{CompletionSink, DeliveryFault, RequestHandle};

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("Invalid reply timeout: {millis}ms (must be positive and at most one week)")]
    InvalidTimeout { millis: u128 },

    #[error("Too many pending requests (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Send action failed: {0}")]
    SendAction(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("No transport configured for outbound requests")]
    NoTransport,

    #[error("Not running inside a Tokio runtime")]
    NoRuntime,
}

impl CorrelatorError {
    pub fn send_action<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CorrelatorError::SendAction(error.into())
    }
}

pub type CorrelatorResult<T> = Result<T, CorrelatorError>;
