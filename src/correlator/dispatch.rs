//! # Correlator
//!
//! The single inbound dispatch point. For every event it walks the active
//! waiters in registration order and resolves the first one whose predicate
//! accepts the event; one event resolves at most one waiter.
//!
//! Dispatching a single event never awaits, so the next event is not looked at
//! until the current one has been fully handled. That is what makes
//! first-registered-first-served deterministic.

use std::{ops::ControlFlow, sync::Weak};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{trace, warn};

use crate::event_bus::{EventError, EventReceiver, InboundEvent};

use super::{
    lifecycle::LifecycleManager,
    outcome::ReplyOutcome,
    predicate::evaluate,
    registry::RequestHandle,
};

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The event resolved this waiter.
    Resolved(RequestHandle),
    /// Waiters were active but none accepted the event.
    Unmatched,
    /// Nothing was waiting.
    Idle,
}

/// Evaluates `event` against every active waiter.
///
/// Waiters whose window the event misses are skipped: arrived before the waiter
/// registered, or at/after its deadline. The latter also expires the waiter right
/// away rather than waiting for its timer. A predicate fault, or a match that
/// cannot be delivered to the waiter's sink, is logged and counts as a non-match
/// for that waiter only.
pub fn dispatch(lifecycle: &LifecycleManager, event: &InboundEvent) -> Dispatch {
    let registry = lifecycle.registry();
    if registry.is_empty() {
        trace!(event_id = %event.id, "No waiters, event ignored");
        return Dispatch::Idle;
    }

    let arrived = event.received_at();
    let mut result = Dispatch::Unmatched;
    registry.for_each_active(|waiter| {
        if arrived >= waiter.deadline {
            lifecycle.expire(waiter.handle);
            return ControlFlow::Continue(());
        }
        if !waiter.accepts_arrival(arrived) {
            return ControlFlow::Continue(());
        }
        match evaluate(waiter.predicate.as_ref(), event) {
            Ok(true) => {
                if lifecycle.resolve(waiter.handle, ReplyOutcome::Matched(event.clone())) {
                    result = Dispatch::Resolved(waiter.handle);
                    ControlFlow::Break(())
                } else {
                    // settled concurrently, or the match could not be delivered
                    ControlFlow::Continue(())
                }
            }
            Ok(false) => ControlFlow::Continue(()),
            Err(fault) => {
                warn!(
                    handle = %waiter.handle,
                    event_id = %event.id,
                    error = %fault,
                    "Predicate fault, treating as non-match"
                );
                ControlFlow::Continue(())
            }
        }
    });

    trace!(event_id = %event.id, sender = %event.sender, result = ?result, "Event dispatched");
    result
}

/// Runs the inbound subscription: receives events one at a time and dispatches
/// each to completion before receiving the next. Holds only a weak reference, so
/// it never keeps the correlator alive.
pub(crate) fn spawn_subscription(
    runtime: &Handle,
    mut receiver: EventReceiver,
    lifecycle: Weak<LifecycleManager>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Some(manager) = lifecycle.upgrade() else {
                        break;
                    };
                    dispatch(&manager, &event);
                }
                Err(EventError::Lagged { count }) => {
                    warn!(count, "Inbound subscription lagged, events skipped");
                }
                Err(e) => {
                    warn!(error = %e, "Inbound subscription failed");
                    if let Some(manager) = lifecycle.upgrade() {
                        manager.subscription_lost();
                    }
                    break;
                }
            }
        }
    })
}
