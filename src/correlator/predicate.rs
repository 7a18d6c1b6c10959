//! # Reply Predicates
//!
//! A predicate decides whether an inbound event is the awaited reply. It is a
//! pure function of the event: no side effects, no access to the registry.
//!
//! Two strategies are supported:
//!
//! - **Heuristic**: originator identity, a `sent_at` lower bound and a content-kind
//!   classifier. Best effort only; two concurrent requests to the same agent with
//!   the same predicate shape cannot be told apart.
//! - **Exact token**: when the agent echoes an opaque token from the request,
//!   match on it. Prefer this whenever the agent's protocol allows it.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::event_bus::{ContentKind, InboundEvent, ReplyToken};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredicateFault {
    #[error("predicate failed: {0}")]
    Failed(String),
    #[error("predicate panicked: {0}")]
    Panicked(String),
}

pub type PredicateResult<T> = Result<T, PredicateFault>;

/// Acceptance test applied to every inbound event while a waiter is active.
pub trait Predicate: Send + Sync {
    fn matches(&self, event: &InboundEvent) -> PredicateResult<bool>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "custom predicate".to_string()
    }
}

/// Runs a predicate, folding panics into [`PredicateFault::Panicked`] so that a
/// misbehaving predicate cannot take the dispatch loop down with it.
pub fn evaluate(predicate: &dyn Predicate, event: &InboundEvent) -> PredicateResult<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| predicate.matches(event))) {
        Ok(result) => result,
        Err(payload) => Err(PredicateFault::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Declarative matcher covering the usual reply criteria. Every configured
/// criterion must hold; an empty matcher accepts everything.
///
/// ```rust,no_run
/// # use reply_correlator::correlator::ReplyMatcher;
/// # use reply_correlator::event_bus::ContentKind;
/// let matcher = ReplyMatcher::new()
///     .from_sender("render_bot")
///     .sent_after(chrono::Utc::now())
///     .kind(ContentKind::Video);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReplyMatcher {
    sender: Option<String>,
    sent_after: Option<DateTime<Utc>>,
    kinds: Vec<ContentKind>,
    reply_token: Option<ReplyToken>,
    text_pattern: Option<Regex>,
}

impl ReplyMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    /// Inclusive lower bound on the originator's timestamp.
    pub fn sent_after(mut self, since: DateTime<Utc>) -> Self {
        self.sent_after = Some(since);
        self
    }

    pub fn kind(mut self, kind: ContentKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ContentKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn reply_token(mut self, token: ReplyToken) -> Self {
        self.reply_token = Some(token);
        self
    }

    pub fn text_matches(mut self, pattern: Regex) -> Self {
        self.text_pattern = Some(pattern);
        self
    }
}

impl Predicate for ReplyMatcher {
    fn matches(&self, event: &InboundEvent) -> PredicateResult<bool> {
        if let Some(sender) = &self.sender {
            if !event.is_from(sender) {
                return Ok(false);
            }
        }
        if let Some(since) = &self.sent_after {
            if event.sent_at < *since {
                return Ok(false);
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return Ok(false);
        }
        if let Some(token) = &self.reply_token {
            if event.reply_token.as_ref() != Some(token) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.text_pattern {
            match event.text.as_deref() {
                Some(text) if pattern.is_match(text) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn describe(&self) -> String {
        let mut parts = vec![];
        if let Some(sender) = &self.sender {
            parts.push(format!("sender={}", sender));
        }
        if let Some(since) = &self.sent_after {
            parts.push(format!("sent_after={}", since.to_rfc3339()));
        }
        if !self.kinds.is_empty() {
            let kinds: Vec<String> = self.kinds.iter().map(ToString::to_string).collect();
            parts.push(format!("kind in [{}]", kinds.join(",")));
        }
        if let Some(token) = &self.reply_token {
            parts.push(format!("token={}", token));
        }
        if let Some(pattern) = &self.text_pattern {
            parts.push(format!("text~/{}/", pattern.as_str()));
        }
        if parts.is_empty() {
            "any event".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Infallible closure predicate, see [`from_fn`].
pub struct FnPredicate<F> {
    f: F,
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&InboundEvent) -> bool + Send + Sync,
{
    fn matches(&self, event: &InboundEvent) -> PredicateResult<bool> {
        Ok((self.f)(event))
    }
}

impl<F> fmt::Debug for FnPredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnPredicate")
    }
}

/// Fallible closure predicate, see [`try_from_fn`].
pub struct TryFnPredicate<F> {
    f: F,
}

impl<F> Predicate for TryFnPredicate<F>
where
    F: Fn(&InboundEvent) -> PredicateResult<bool> + Send + Sync,
{
    fn matches(&self, event: &InboundEvent) -> PredicateResult<bool> {
        (self.f)(event)
    }
}

pub fn from_fn<F>(f: F) -> FnPredicate<F>
where
    F: Fn(&InboundEvent) -> bool + Send + Sync,
{
    FnPredicate { f }
}

pub fn try_from_fn<F>(f: F) -> TryFnPredicate<F>
where
    F: Fn(&InboundEvent) -> PredicateResult<bool> + Send + Sync,
{
    TryFnPredicate { f }
}
