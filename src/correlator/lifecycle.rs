//! # Lifecycle Manager
//!
//! Owns everything that has to happen around a waiter besides matching:
//! arming its timeout, resolving it exactly once, and detaching it (timer
//! cancelled, registry entry removed, inbound subscription dropped when the last
//! waiter goes away). Every exit path, whether match, timeout, cancel or
//! subscription loss, goes through [`LifecycleManager::resolve`].

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use crate::event::transport::EventSource;

use super::{
    dispatch,
    outcome::{CancelReason, ReplyOutcome, ReplyTimeout},
    predicate::Predicate,
    registry::{CompletionSink, PendingRegistry, RequestHandle, Resolution},
    CorrelatorError, CorrelatorResult,
};

/// The live inbound subscription (the dispatch loop task).
struct Subscription {
    task: JoinHandle<()>,
}

pub struct LifecycleManager {
    registry: PendingRegistry,
    source: Arc<dyn EventSource>,
    // Serializes subscription install/uninstall with the registry emptiness check.
    subscription: Mutex<Option<Subscription>>,
    max_pending: usize,
    this: Weak<LifecycleManager>,
}

impl LifecycleManager {
    pub fn new(source: Arc<dyn EventSource>, max_pending: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry: PendingRegistry::new(),
            source,
            subscription: Mutex::new(None),
            max_pending,
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription_slot().is_some()
    }

    /// Registers a waiter, installs the inbound subscription if this is the first
    /// one, and arms its timeout.
    ///
    /// If the subscription cannot be installed the waiter is resolved right away
    /// as `Cancelled(SubscriptionLost)`: nothing could ever reach it.
    ///
    /// # Errors
    ///
    /// * `CorrelatorError::NoRuntime` - called outside a Tokio runtime
    /// * `CorrelatorError::CapacityExceeded` - `max_pending` waiters already active
    /// * `CorrelatorError::InvalidTimeout` - the deadline is not representable
    pub fn register(
        &self,
        predicate: Arc<dyn Predicate>,
        timeout: ReplyTimeout,
        sink: CompletionSink,
    ) -> CorrelatorResult<RequestHandle> {
        let runtime = Handle::try_current().map_err(|_| CorrelatorError::NoRuntime)?;

        let (handle, subscribed) = {
            let mut slot = self.subscription_slot();
            if self.registry.len() >= self.max_pending {
                return Err(CorrelatorError::CapacityExceeded {
                    limit: self.max_pending,
                });
            }
            let handle = self.registry.register(predicate.clone(), timeout, sink)?;
            let subscribed = slot.is_some()
                || match self.source.subscribe() {
                    Ok(receiver) => {
                        debug!("Installing inbound subscription");
                        *slot = Some(Subscription {
                            task: dispatch::spawn_subscription(
                                &runtime,
                                receiver,
                                self.this.clone(),
                            ),
                        });
                        true
                    }
                    Err(e) => {
                        warn!(handle = %handle, error = %e, "Failed to install inbound subscription");
                        false
                    }
                };
            (handle, subscribed)
        };

        if !subscribed {
            self.cancel(handle, CancelReason::SubscriptionLost);
            return Ok(handle);
        }

        debug!(
            handle = %handle,
            timeout_ms = %timeout.as_millis(),
            predicate = %predicate.describe(),
            "Waiter registered"
        );
        self.arm_timeout(&runtime, handle, timeout.as_duration());
        Ok(handle)
    }

    /// Schedules the timeout for a waiter. When it fires and the waiter is still
    /// pending, the waiter resolves to `TimedOut`.
    fn arm_timeout(&self, runtime: &Handle, handle: RequestHandle, duration: Duration) {
        let this = self.this.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(manager) = this.upgrade() {
                manager.expire(handle);
            }
        });
        self.registry.attach_timer(handle, timer.abort_handle());
    }

    /// Resolves a waiter with `outcome` and detaches it. Returns `true` only for the
    /// call that actually performed the resolution.
    ///
    /// A matched event that cannot be delivered leaves the waiter active and
    /// returns `false`, so the event can go on to the next waiter.
    pub fn resolve(&self, handle: RequestHandle, outcome: ReplyOutcome) -> bool {
        let state = outcome.state();
        let resolution = self.registry.resolve(handle, outcome);
        match &resolution {
            Resolution::Resolved(delivery) => {
                debug!(handle = %handle, state = %state, "Waiter resolved");
                if let Err(fault) = delivery {
                    warn!(handle = %handle, error = %fault, "Failed to deliver outcome");
                }
                self.release_subscription_if_idle();
            }
            Resolution::Faulted(fault) => {
                warn!(handle = %handle, error = %fault, "Failed to deliver match, waiter stays active");
                // a timeout deferred during the delivery may have removed it
                self.release_subscription_if_idle();
            }
            Resolution::AlreadySettled => {}
        }
        resolution.performed()
    }

    /// Timeout path: resolves to `TimedOut` if still pending.
    pub fn expire(&self, handle: RequestHandle) -> bool {
        self.resolve(handle, ReplyOutcome::TimedOut)
    }

    /// Safe at any time; a no-op returning `false` once the waiter has settled.
    pub fn cancel(&self, handle: RequestHandle, reason: CancelReason) -> bool {
        self.resolve(handle, ReplyOutcome::Cancelled(reason))
    }

    /// Removes a waiter without delivering anything. The completion sink is
    /// dropped, which an awaiting receiver observes as a closed channel.
    pub fn detach(&self, handle: RequestHandle) -> bool {
        let removed = self.registry.remove(handle).is_some();
        if removed {
            self.release_subscription_if_idle();
        }
        removed
    }

    /// Cancels every pending waiter. Returns how many were resolved by this call.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        self.cancel_each(self.registry.handles(), reason)
    }

    fn cancel_each(&self, handles: Vec<RequestHandle>, reason: CancelReason) -> usize {
        handles
            .into_iter()
            .filter(|handle| self.cancel(*handle, reason))
            .count()
    }

    /// Called by the dispatch loop when the inbound stream is gone for good.
    ///
    /// Only the waiters registered while that stream was installed are cancelled.
    /// A registration racing with this call installs a fresh subscription and
    /// keeps it.
    pub(crate) fn subscription_lost(&self) {
        let orphaned = {
            let mut slot = self.subscription_slot();
            let orphaned = self.registry.handles();
            // The loop is exiting on its own; clear it so the next registration
            // installs a fresh subscription.
            if let Some(subscription) = slot.take() {
                subscription.task.abort();
            }
            orphaned
        };
        warn!(
            pending = orphaned.len(),
            "Inbound subscription lost, cancelling pending waiters"
        );
        self.cancel_each(orphaned, CancelReason::SubscriptionLost);
    }

    /// Cancels all waiters and drops the subscription.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.cancel_all(CancelReason::Shutdown);
        if let Some(subscription) = self.subscription_slot().take() {
            subscription.task.abort();
        }
        debug!(cancelled, "Correlator shut down");
        cancelled
    }

    fn release_subscription_if_idle(&self) {
        let mut slot = self.subscription_slot();
        if self.registry.is_empty() {
            if let Some(subscription) = slot.take() {
                debug!("No pending waiters, dropping inbound subscription");
                subscription.task.abort();
            }
        }
    }

    fn subscription_slot(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
