//! # Pending Request Registry
//!
//! Maps request handles to waiter state. Handles are allocated from a monotonic
//! counter, so handle order is registration order.
//!
//! Resolution is claim, deliver, commit. The claim takes the completion sink out
//! of the entry under the map lock, so only one path can be delivering at a time.
//! A delivered outcome removes the entry for good. A matched event whose delivery
//! faults puts the sink back and the waiter stays active, as if the event had not
//! matched.

use std::{
    fmt,
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};

use super::{
    outcome::{ReplyOutcome, ReplyTimeout},
    predicate::{panic_message, Predicate},
    CorrelatorError, CorrelatorResult,
};

/// Opaque identifier of a waiter. Internal only; never sent over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryFault {
    #[error("reply receiver dropped")]
    ReceiverDropped,
    #[error("completion callback panicked: {0}")]
    CallbackPanicked(String),
}

type Callback = Box<dyn FnMut(ReplyOutcome) + Send + Sync>;

/// Where a waiter's outcome goes.
pub enum CompletionSink {
    Channel(oneshot::Sender<ReplyOutcome>),
    Callback(Callback),
}

impl CompletionSink {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnMut(ReplyOutcome) + Send + Sync + 'static,
    {
        CompletionSink::Callback(Box::new(f))
    }

    /// Hands `outcome` over. On a fault the sink comes back with the error when it
    /// is still usable.
    pub fn deliver(self, outcome: ReplyOutcome) -> Result<(), (DeliveryFault, Option<Self>)> {
        match self {
            CompletionSink::Channel(sender) => {
                if sender.is_closed() {
                    return Err((
                        DeliveryFault::ReceiverDropped,
                        Some(CompletionSink::Channel(sender)),
                    ));
                }
                sender
                    .send(outcome)
                    .map_err(|_| (DeliveryFault::ReceiverDropped, None))
            }
            CompletionSink::Callback(mut callback) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                    Ok(()) => Ok(()),
                    Err(payload) => Err((
                        DeliveryFault::CallbackPanicked(panic_message(payload.as_ref())),
                        Some(CompletionSink::Callback(callback)),
                    )),
                }
            }
        }
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionSink::Channel(_) => f.write_str("CompletionSink::Channel"),
            CompletionSink::Callback(_) => f.write_str("CompletionSink::Callback"),
        }
    }
}

/// An outstanding registration.
pub struct Waiter {
    pub handle: RequestHandle,
    pub predicate: Arc<dyn Predicate>,
    /// Wall-clock registration time.
    pub created_at: DateTime<Utc>,
    pub registered_at: Instant,
    pub deadline: Instant,
    sink: Option<CompletionSink>,
    timer: Option<AbortHandle>,
    // 配信中 (sink は取り出し済み)
    delivering: bool,
    /// Timeout or cancel that came in while a match was being delivered.
    deferred: Option<ReplyOutcome>,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("handle", &self.handle)
            .field("predicate", &self.predicate.describe())
            .field("created_at", &self.created_at)
            .field("deadline", &self.deadline)
            .field("sink", &self.sink)
            .field("delivering", &self.delivering)
            .finish()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Read-only view of an active waiter, taken for one dispatch pass.
#[derive(Clone)]
pub struct WaiterSnapshot {
    pub handle: RequestHandle,
    pub predicate: Arc<dyn Predicate>,
    pub registered_at: Instant,
    pub deadline: Instant,
}

impl WaiterSnapshot {
    /// Whether an event that arrived at `at` falls inside this waiter's window.
    pub fn accepts_arrival(&self, at: Instant) -> bool {
        at >= self.registered_at && at < self.deadline
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This call resolved and removed the waiter; carries the delivery result.
    Resolved(Result<(), DeliveryFault>),
    /// Delivering a match failed. The waiter is still active.
    Faulted(DeliveryFault),
    /// Already resolved, removed, or claimed by a delivery in flight.
    AlreadySettled,
}

impl Resolution {
    pub fn performed(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

#[derive(Default)]
pub struct PendingRegistry {
    waiters: DashMap<RequestHandle, Waiter>,
    next_handle: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a waiter and returns its handle. O(1).
    ///
    /// # Errors
    ///
    /// * `CorrelatorError::InvalidTimeout` - the deadline is not representable
    pub fn register(
        &self,
        predicate: Arc<dyn Predicate>,
        timeout: ReplyTimeout,
        sink: CompletionSink,
    ) -> CorrelatorResult<RequestHandle> {
        let registered_at = Instant::now();
        let deadline =
            timeout
                .deadline_from(registered_at)
                .ok_or(CorrelatorError::InvalidTimeout {
                    millis: timeout.as_millis(),
                })?;
        let handle = RequestHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.waiters.insert(
            handle,
            Waiter {
                handle,
                predicate,
                created_at: Utc::now(),
                registered_at,
                deadline,
                sink: Some(sink),
                timer: None,
                delivering: false,
                deferred: None,
            },
        );
        Ok(handle)
    }

    /// Attaches the timeout task to a waiter. If the waiter is already gone the
    /// timer is aborted on the spot and `false` is returned.
    pub fn attach_timer(&self, handle: RequestHandle, timer: AbortHandle) -> bool {
        match self.waiters.get_mut(&handle) {
            Some(mut waiter) => {
                if let Some(previous) = waiter.timer.replace(timer) {
                    previous.abort();
                }
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Resolves the waiter with `outcome`.
    ///
    /// Delivery runs outside the map lock, so a callback sink may call back into
    /// the registry. A timeout or cancel that arrives meanwhile is deferred and
    /// applied if the match turns out to be undeliverable.
    pub fn resolve(&self, handle: RequestHandle, outcome: ReplyOutcome) -> Resolution {
        let Some(sink) = self.claim(handle, &outcome) else {
            return Resolution::AlreadySettled;
        };

        let is_match = outcome.is_match();
        match sink.deliver(outcome) {
            Ok(()) => {
                self.remove(handle);
                Resolution::Resolved(Ok(()))
            }
            Err((fault, Some(sink))) if is_match => {
                self.restore(handle, sink);
                Resolution::Faulted(fault)
            }
            Err((fault, _)) => {
                self.remove(handle);
                Resolution::Resolved(Err(fault))
            }
        }
    }

    fn claim(&self, handle: RequestHandle, outcome: &ReplyOutcome) -> Option<CompletionSink> {
        let mut waiter = self.waiters.get_mut(&handle)?;
        if waiter.delivering {
            if !outcome.is_match() && waiter.deferred.is_none() {
                waiter.deferred = Some(outcome.clone());
            }
            return None;
        }
        let sink = waiter.sink.take()?;
        waiter.delivering = true;
        Some(sink)
    }

    fn restore(&self, handle: RequestHandle, sink: CompletionSink) {
        let deferred = match self.waiters.get_mut(&handle) {
            Some(mut waiter) => {
                waiter.sink = Some(sink);
                waiter.delivering = false;
                waiter.deferred.take()
            }
            None => None,
        };
        if let Some(outcome) = deferred {
            self.resolve(handle, outcome);
        }
    }

    /// Takes the waiter out without completing it.
    pub fn remove(&self, handle: RequestHandle) -> Option<Waiter> {
        self.waiters.remove(&handle).map(|(_, waiter)| waiter)
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.waiters.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Active waiters in registration order. No map lock is held once this returns.
    pub fn snapshot(&self) -> Vec<WaiterSnapshot> {
        let mut snapshot: Vec<WaiterSnapshot> = self
            .waiters
            .iter()
            .map(|entry| WaiterSnapshot {
                handle: entry.handle,
                predicate: entry.predicate.clone(),
                registered_at: entry.registered_at,
                deadline: entry.deadline,
            })
            .collect();
        snapshot.sort_by_key(|waiter| waiter.handle);
        snapshot
    }

    /// Walks a snapshot of active waiters in registration order. Entries removed
    /// while walking are skipped rather than visited.
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&WaiterSnapshot) -> ControlFlow<()>,
    {
        for waiter in self.snapshot() {
            if !self.contains(waiter.handle) {
                continue;
            }
            if f(&waiter).is_break() {
                break;
            }
        }
    }

    pub fn handles(&self) -> Vec<RequestHandle> {
        self.snapshot().into_iter().map(|w| w.handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{outcome::CancelReason, predicate::from_fn};
    use crate::event_bus::{ContentKind, InboundEvent};
    use std::{
        sync::{atomic::AtomicUsize, Mutex},
        time::Duration,
    };

    fn any() -> Arc<dyn Predicate> {
        Arc::new(from_fn(|_: &InboundEvent| true))
    }

    fn secs(n: u64) -> ReplyTimeout {
        ReplyTimeout::try_from(Duration::from_secs(n)).unwrap()
    }

    fn counting_sink(counter: &Arc<AtomicUsize>) -> CompletionSink {
        let counter = counter.clone();
        CompletionSink::callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn matched() -> ReplyOutcome {
        ReplyOutcome::Matched(InboundEvent::builder("x", ContentKind::Text).build().unwrap())
    }

    fn channel(registry: &PendingRegistry) -> (RequestHandle, oneshot::Receiver<ReplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = registry
            .register(any(), secs(1), CompletionSink::Channel(tx))
            .unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_handles_follow_registration_order() {
        let registry = PendingRegistry::new();
        let (first, _rx1) = channel(&registry);
        let (second, _rx2) = channel(&registry);

        assert!(first < second);
        assert_eq!(registry.handles(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_resolve_happens_once() {
        let registry = PendingRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = registry
            .register(any(), secs(1), counting_sink(&counter))
            .unwrap();

        assert!(registry.resolve(handle, ReplyOutcome::TimedOut).performed());
        assert_eq!(
            registry.resolve(handle, ReplyOutcome::Cancelled(CancelReason::Caller)),
            Resolution::AlreadySettled
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_receives_outcome() {
        let registry = PendingRegistry::new();
        let (handle, rx) = channel(&registry);

        registry.resolve(handle, ReplyOutcome::TimedOut);
        assert_eq!(rx.await.unwrap(), ReplyOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_terminal_delivery_faults_detach() {
        let registry = PendingRegistry::new();
        let (dropped, rx) = channel(&registry);
        drop(rx);
        let panicking = registry
            .register(
                any(),
                secs(1),
                CompletionSink::callback(|_| panic!("sink exploded")),
            )
            .unwrap();

        assert_eq!(
            registry.resolve(dropped, ReplyOutcome::TimedOut),
            Resolution::Resolved(Err(DeliveryFault::ReceiverDropped))
        );
        assert_eq!(
            registry.resolve(panicking, ReplyOutcome::TimedOut),
            Resolution::Resolved(Err(DeliveryFault::CallbackPanicked(
                "sink exploded".to_string()
            )))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_match_delivery_keeps_waiter() {
        let registry = PendingRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = registry
            .register(
                any(),
                secs(1),
                CompletionSink::callback(move |outcome| {
                    // 最初の配信だけ失敗させる
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("not ready for {}", outcome);
                    }
                }),
            )
            .unwrap();

        assert!(matches!(
            registry.resolve(handle, matched()),
            Resolution::Faulted(DeliveryFault::CallbackPanicked(_))
        ));
        assert!(registry.contains(handle));

        assert_eq!(
            registry.resolve(handle, ReplyOutcome::TimedOut),
            Resolution::Resolved(Ok(()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_during_delivery_is_deferred() {
        let registry = Arc::new(PendingRegistry::new());
        let handle_slot = Arc::new(Mutex::new(None));
        let inner = registry.clone();
        let slot = handle_slot.clone();
        let outcomes = Arc::new(Mutex::new(vec![]));
        let log = outcomes.clone();
        let handle = registry
            .register(
                any(),
                secs(1),
                CompletionSink::callback(move |outcome: ReplyOutcome| {
                    let is_match = outcome.is_match();
                    log.lock().unwrap().push(outcome.state());
                    if is_match {
                        let handle = slot.lock().unwrap().unwrap();
                        // a timeout lands while the match is being delivered
                        assert_eq!(
                            inner.resolve(handle, ReplyOutcome::TimedOut),
                            Resolution::AlreadySettled
                        );
                        panic!("delivery failed");
                    }
                }),
            )
            .unwrap();
        *handle_slot.lock().unwrap() = Some(handle);

        assert!(matches!(
            registry.resolve(handle, matched()),
            Resolution::Faulted(_)
        ));
        assert!(registry.is_empty());
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![
                crate::correlator::WaiterState::Matched,
                crate::correlator::WaiterState::TimedOut
            ]
        );
    }

    #[tokio::test]
    async fn test_for_each_active_tolerates_removal() {
        let registry = PendingRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                registry
                    .register(any(), secs(1), counting_sink(&counter))
                    .unwrap()
            })
            .collect();

        let visited = Mutex::new(vec![]);
        registry.for_each_active(|waiter| {
            visited.lock().unwrap().push(waiter.handle);
            // resolving the next entry mid-walk must not visit it
            if waiter.handle == handles[0] {
                registry.resolve(handles[1], ReplyOutcome::TimedOut);
            }
            ControlFlow::Continue(())
        });

        assert_eq!(
            visited.into_inner().unwrap(),
            vec![handles[0], handles[2], handles[3]]
        );
    }

    #[tokio::test]
    async fn test_attach_timer_after_removal_aborts_it() {
        let registry = PendingRegistry::new();
        let (handle, _rx) = channel(&registry);
        registry.resolve(handle, ReplyOutcome::TimedOut);

        let task = tokio::spawn(std::future::pending::<()>());
        assert!(!registry.attach_timer(handle, task.abort_handle()));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window() {
        let registry = PendingRegistry::new();
        let (tx, _rx) = oneshot::channel();
        let handle = registry
            .register(
                any(),
                ReplyTimeout::from_millis(100).unwrap(),
                CompletionSink::Channel(tx),
            )
            .unwrap();
        let waiter = registry.snapshot().pop().unwrap();
        assert_eq!(waiter.handle, handle);

        assert!(waiter.accepts_arrival(waiter.registered_at));
        assert!(waiter.accepts_arrival(waiter.registered_at + Duration::from_millis(99)));
        assert!(!waiter.accepts_arrival(waiter.deadline));
    }

    #[tokio::test]
    async fn test_longest_timeout_registers() {
        let registry = PendingRegistry::new();
        let (tx, _rx) = oneshot::channel();
        let timeout = ReplyTimeout::try_from(crate::correlator::MAX_REPLY_TIMEOUT).unwrap();
        let handle = registry
            .register(any(), timeout, CompletionSink::Channel(tx))
            .unwrap();
        assert!(registry.contains(handle));
    }
}
