//! # Inbound Event Stream
//!
//! The transport side of the system as the correlator sees it: one shared,
//! multiplexed stream of inbound events plus an action primitive for outbound
//! requests.
//!
//! ## Architecture Overview
//!
//! - **EventBus**: broadcast hub that fans inbound events out to subscribers
//! - **EventSource / Transport**: the subscribe and dispatch primitives
//! - **LocalTransport**: in-process loopback used by simulations and tests
//!
//! ## Request-Reply Flow
//!
//! ```text
//! ┌─────────┐  OutboundRequest  ┌──────────┐
//! │Requester│──────────────────▶│ External │
//! └────▲────┘                   │  Agent   │
//!      │                        └────┬─────┘
//!      │ matched reply               │ InboundEvent (untagged)
//! ┌────┴──────┐   ┌──────────┐       │
//! │Correlator │◀──│ EventBus │◀──────┘
//! └───────────┘   └──────────┘
//! ```
//!
//! Replies come back on the same stream as all unrelated traffic and carry no
//! request identifier, so the [`crate::correlator`] has to pick them out.

pub mod event_bus;
pub mod transport;
