//! # Reply Correlator
//!
//! Asynchronous request/reply correlation over a transport that has no native
//! request/response framing.
//!
//! A caller dispatches a triggering request to an independently-operating
//! external agent, then has to recognize the one inbound event that is the reply,
//! among all unrelated events on the same shared stream. The reply carries no
//! identifier referencing the request, so matching is done by predicate
//! (sender identity, arrival window, content kind, or an echoed token), against a
//! registry of concurrently outstanding requests.
//!
//! ## Layers
//!
//! - Inbound stream and transport boundary ([`event`])
//! - Correlation engine ([`correlator`]): predicates, registry, dispatch,
//!   lifecycle and the `await_reply` façade
//! - Configuration ([`config`]) and errors ([`error`])
//!
//! ## Guarantees
//!
//! - Every waiter has a bounded deadline and is removed on match, timeout,
//!   cancel or subscription loss.
//! - A waiter resolves at most once; a removed waiter is never matched again.
//! - One inbound event resolves at most one waiter, the earliest registered
//!   among those that accept it.

pub mod config;
pub mod correlator;
pub mod error;
pub mod event;

// Re-exports
pub use error::*;
pub use event::*;

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        // テストの前に一度だけ実行したい処理
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
