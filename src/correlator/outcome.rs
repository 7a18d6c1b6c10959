use std::{fmt, time::Duration};

use tokio::time::Instant;

use crate::event_bus::InboundEvent;

use super::{CorrelatorError, CorrelatorResult};

/// Per-request state machine: `Pending → {Matched, TimedOut, Cancelled}`.
/// All three outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WaiterState {
    Pending,
    Matched,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CancelReason {
    /// Explicit `cancel` by the caller.
    Caller,
    /// The awaiting future was dropped before it settled.
    Abandoned,
    /// The inbound subscription closed; nothing more can arrive.
    SubscriptionLost,
    /// The correlator was shut down or dropped.
    Shutdown,
}

/// What a waiter resolves to. Only `Matched` carries an event; the rest are the
/// "no reply" sentinel seen through [`ReplyOutcome::into_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Matched(InboundEvent),
    TimedOut,
    Cancelled(CancelReason),
}

impl ReplyOutcome {
    pub fn state(&self) -> WaiterState {
        match self {
            ReplyOutcome::Matched(_) => WaiterState::Matched,
            ReplyOutcome::TimedOut => WaiterState::TimedOut,
            ReplyOutcome::Cancelled(_) => WaiterState::Cancelled,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, ReplyOutcome::Matched(_))
    }

    pub fn event(&self) -> Option<&InboundEvent> {
        match self {
            ReplyOutcome::Matched(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_event(self) -> Option<InboundEvent> {
        match self {
            ReplyOutcome::Matched(event) => Some(event),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyOutcome::Matched(event) => write!(f, "matched event {} from {}", event.id, event.sender),
            ReplyOutcome::TimedOut => f.write_str("no reply (timed out)"),
            ReplyOutcome::Cancelled(reason) => write!(f, "no reply (cancelled: {})", reason),
        }
    }
}

/// Longest accepted reply window.
pub const MAX_REPLY_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A bounded reply window, in `(0, MAX_REPLY_TIMEOUT]`. There is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyTimeout(Duration);

impl ReplyTimeout {
    /// Deadline of a window opened at `start`, or `None` if it is not
    /// representable.
    pub fn deadline_from(&self, start: Instant) -> Option<Instant> {
        start.checked_add(self.0)
    }

    pub fn from_millis(millis: u64) -> CorrelatorResult<Self> {
        Self::try_from(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }
}

impl TryFrom<Duration> for ReplyTimeout {
    type Error = CorrelatorError;

    fn try_from(duration: Duration) -> CorrelatorResult<Self> {
        if duration.is_zero() || duration > MAX_REPLY_TIMEOUT {
            return Err(CorrelatorError::InvalidTimeout {
                millis: duration.as_millis(),
            });
        }
        Ok(Self(duration))
    }
}

impl From<ReplyTimeout> for Duration {
    fn from(timeout: ReplyTimeout) -> Self {
        timeout.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            ReplyTimeout::from_millis(0),
            Err(CorrelatorError::InvalidTimeout { millis: 0 })
        ));
        assert!(ReplyTimeout::try_from(Duration::ZERO).is_err());
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        assert!(matches!(
            ReplyTimeout::try_from(Duration::MAX),
            Err(CorrelatorError::InvalidTimeout { .. })
        ));
        assert!(ReplyTimeout::try_from(MAX_REPLY_TIMEOUT + Duration::from_millis(1)).is_err());

        let longest = ReplyTimeout::try_from(MAX_REPLY_TIMEOUT).unwrap();
        let start = Instant::now();
        assert_eq!(longest.deadline_from(start), Some(start + MAX_REPLY_TIMEOUT));
    }

    #[test]
    fn test_timeout_roundtrip() {
        let timeout = ReplyTimeout::from_millis(1500).unwrap();
        assert_eq!(Duration::from(timeout), Duration::from_millis(1500));
        assert_eq!(timeout.as_millis(), 1500);
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(ReplyOutcome::TimedOut.state(), WaiterState::TimedOut);
        assert_eq!(
            ReplyOutcome::Cancelled(CancelReason::Caller).state(),
            WaiterState::Cancelled
        );
        assert_eq!(ReplyOutcome::TimedOut.into_event(), None);
        assert_eq!(WaiterState::TimedOut.to_string(), "TIMED_OUT");
    }
}
