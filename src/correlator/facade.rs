//! # Request/Reply Façade
//!
//! `await_reply` is the one operation most callers need: register a waiter,
//! run the send action, await the outcome. Registry, timer and subscription
//! wiring stay hidden behind it.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::{
    config::CorrelatorConfig,
    event::transport::{EventSource, OutboundRequest, Transport},
    event_bus::{InboundEvent, ReplyToken},
};

use super::{
    dispatch::{self, Dispatch},
    lifecycle::LifecycleManager,
    outcome::{CancelReason, ReplyOutcome, ReplyTimeout, WaiterState},
    predicate::{Predicate, ReplyMatcher},
    registry::{CompletionSink, RequestHandle},
    CorrelatorError, CorrelatorResult,
};

/// Whether the waiter is registered before or after the send action runs.
///
/// `RegisterFirst` is the default: with `SendFirst` a reply that arrives before
/// registration is missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendOrder {
    #[default]
    RegisterFirst,
    SendFirst,
}

/// # ReplyCorrelator
///
/// Process-wide correlation state with an explicit lifetime: created empty,
/// torn down by [`ReplyCorrelator::shutdown`] or when the last clone is dropped.
/// Every pending request is lost on teardown and resolves as cancelled.
#[derive(Clone)]
pub struct ReplyCorrelator {
    lifecycle: Arc<LifecycleManager>,
    transport: Option<Arc<dyn Transport>>,
}

impl ReplyCorrelator {
    /// Listen-only correlator. Outbound requests are sent by the caller's own
    /// send action.
    pub fn new(source: Arc<dyn EventSource>, config: &CorrelatorConfig) -> Self {
        Self {
            lifecycle: LifecycleManager::new(source, config.max_pending),
            transport: None,
        }
    }

    /// Correlator that can also dispatch requests through `transport`.
    pub fn with_transport<T>(transport: Arc<T>, config: &CorrelatorConfig) -> Self
    where
        T: Transport + 'static,
    {
        let source: Arc<dyn EventSource> = transport.clone();
        let transport: Arc<dyn Transport> = transport;
        Self {
            lifecycle: LifecycleManager::new(source, config.max_pending),
            transport: Some(transport),
        }
    }

    /// Registers a waiter and returns a future for its outcome.
    ///
    /// Dropping the returned [`PendingReply`] before it settles cancels the waiter.
    pub fn register<P>(&self, predicate: P, timeout: ReplyTimeout) -> CorrelatorResult<PendingReply>
    where
        P: Predicate + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle =
            self.lifecycle
                .register(Arc::new(predicate), timeout, CompletionSink::Channel(tx))?;
        Ok(PendingReply {
            handle,
            receiver: rx,
            lifecycle: Arc::downgrade(&self.lifecycle),
            settled: false,
            outcome: None,
        })
    }

    /// Registers a waiter whose outcome is handed to `on_resolve`.
    ///
    /// `on_resolve` runs once per waiter. If it panics while receiving a match, the
    /// event counts as unmatched and the waiter keeps waiting, so it may run again.
    pub fn register_callback<P, F>(
        &self,
        predicate: P,
        timeout: ReplyTimeout,
        on_resolve: F,
    ) -> CorrelatorResult<RequestHandle>
    where
        P: Predicate + 'static,
        F: FnMut(ReplyOutcome) + Send + Sync + 'static,
    {
        self.lifecycle.register(
            Arc::new(predicate),
            timeout,
            CompletionSink::callback(on_resolve),
        )
    }

    /// Registers a waiter, runs `send_action`, and awaits the reply.
    ///
    /// Returns `Ok(None)` when no reply arrived within `timeout` (or the waiter was
    /// cancelled); that is an expected outcome, not an error.
    ///
    /// # Errors
    ///
    /// * `CorrelatorError::SendAction` - the send action failed; the waiter is cancelled
    /// * `CorrelatorError::CapacityExceeded` / `InvalidTimeout` / `NoRuntime` - registration failed
    pub async fn await_reply<P, Fut, T, E>(
        &self,
        send_action: Fut,
        predicate: P,
        timeout: ReplyTimeout,
    ) -> CorrelatorResult<Option<InboundEvent>>
    where
        P: Predicate + 'static,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.await_reply_ordered(SendOrder::RegisterFirst, send_action, predicate, timeout)
            .await
    }

    pub async fn await_reply_ordered<P, Fut, T, E>(
        &self,
        order: SendOrder,
        send_action: Fut,
        predicate: P,
        timeout: ReplyTimeout,
    ) -> CorrelatorResult<Option<InboundEvent>>
    where
        P: Predicate + 'static,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.await_outcome(order, send_action, predicate, timeout)
            .await
            .map(ReplyOutcome::into_event)
    }

    /// Like [`ReplyCorrelator::await_reply_ordered`] but keeps the full outcome,
    /// for callers that care why there was no reply.
    #[instrument(skip(self, send_action, predicate))]
    pub async fn await_outcome<P, Fut, T, E>(
        &self,
        order: SendOrder,
        send_action: Fut,
        predicate: P,
        timeout: ReplyTimeout,
    ) -> CorrelatorResult<ReplyOutcome>
    where
        P: Predicate + 'static,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let pending = match order {
            SendOrder::RegisterFirst => {
                let pending = self.register(predicate, timeout)?;
                if let Err(e) = send_action.await {
                    pending.cancel();
                    return Err(CorrelatorError::send_action(e));
                }
                pending
            }
            SendOrder::SendFirst => {
                send_action.await.map_err(CorrelatorError::send_action)?;
                self.register(predicate, timeout)?
            }
        };

        let handle = pending.handle();
        let outcome = pending.await;
        debug!(handle = %handle, outcome = %outcome, "Reply awaited");
        Ok(outcome)
    }

    /// Dispatches `request` through the transport and awaits the reply matched by
    /// `predicate`.
    #[instrument(skip(self, predicate), fields(target_agent = %request.target))]
    pub async fn request<P>(
        &self,
        request: OutboundRequest,
        predicate: P,
        timeout: ReplyTimeout,
    ) -> CorrelatorResult<Option<InboundEvent>>
    where
        P: Predicate + 'static,
    {
        let transport = self.transport.clone().ok_or(CorrelatorError::NoTransport)?;
        self.await_reply(transport.dispatch(request), predicate, timeout)
            .await
    }

    /// Exact-token variant: embeds a fresh [`ReplyToken`] in the request and
    /// accepts only an event from the target that echoes it back.
    pub async fn request_with_token(
        &self,
        request: OutboundRequest,
        timeout: ReplyTimeout,
    ) -> CorrelatorResult<Option<InboundEvent>> {
        let token = ReplyToken::generate();
        let predicate = ReplyMatcher::new()
            .from_sender(&request.target)
            .reply_token(token.clone());
        self.request(request.with_token(token), predicate, timeout)
            .await
    }

    /// Runs one event through the correlator directly, for transports that push
    /// events instead of being subscribed to.
    pub fn dispatch(&self, event: &InboundEvent) -> Dispatch {
        dispatch::dispatch(&self.lifecycle, event)
    }

    /// Cancels a pending waiter. Returns `false` if it had already settled.
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        self.lifecycle.cancel(handle, CancelReason::Caller)
    }

    pub fn pending_count(&self) -> usize {
        self.lifecycle.pending_count()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lifecycle.is_subscribed()
    }

    /// Cancels every pending waiter and drops the inbound subscription. Returns the
    /// number of waiters cancelled. The correlator stays usable afterwards.
    pub fn shutdown(&self) -> usize {
        self.lifecycle.shutdown()
    }
}

/// Outcome of one registered waiter. Resolves exactly once.
pub struct PendingReply {
    handle: RequestHandle,
    receiver: oneshot::Receiver<ReplyOutcome>,
    lifecycle: Weak<LifecycleManager>,
    settled: bool,
    outcome: Option<ReplyOutcome>,
}

impl PendingReply {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Current state without waiting. Once terminal, the outcome is kept and
    /// returned when the future is awaited.
    pub fn state(&mut self) -> WaiterState {
        if self.outcome.is_none() {
            match self.receiver.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return WaiterState::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.outcome = Some(ReplyOutcome::Cancelled(CancelReason::Shutdown))
                }
            }
            self.settled = true;
        }
        self.outcome
            .as_ref()
            .map(ReplyOutcome::state)
            .unwrap_or(WaiterState::Pending)
    }

    /// Cancels the waiter; awaiting afterwards yields `Cancelled(Caller)`.
    pub fn cancel(&self) -> bool {
        self.lifecycle
            .upgrade()
            .map(|manager| manager.cancel(self.handle, CancelReason::Caller))
            .unwrap_or(false)
    }
}

impl Future for PendingReply {
    type Output = ReplyOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.outcome.take() {
            return Poll::Ready(outcome);
        }
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.settled = true;
                // the sender only goes away unsent when the correlator is torn down
                Poll::Ready(result.unwrap_or(ReplyOutcome::Cancelled(CancelReason::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(manager) = self.lifecycle.upgrade() {
            manager.cancel(self.handle, CancelReason::Abandoned);
        }
    }
}
