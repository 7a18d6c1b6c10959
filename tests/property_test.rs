mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{event, setup, timeout};
use proptest::{prelude::*, sample::Index};
use reply_correlator::{
    correlator::{CancelReason, Dispatch, ReplyMatcher, ReplyOutcome, RequestHandle},
    event_bus::ContentKind,
};
use tokio::time::{sleep, Instant};

const SENDERS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum Op {
    Register { sender: usize, timeout_ms: u64 },
    Event { sender: usize },
    Cancel { target: Index },
    Sleep { ms: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SENDERS.len(), 1u64..=500)
            .prop_map(|(sender, timeout_ms)| Op::Register { sender, timeout_ms }),
        3 => (0..SENDERS.len()).prop_map(|sender| Op::Event { sender }),
        1 => any::<Index>().prop_map(|target| Op::Cancel { target }),
        2 => (0u64..=300).prop_map(|ms| Op::Sleep { ms }),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expected {
    Pending,
    Matched,
    Cancelled,
    TimedOut,
}

struct Tracked {
    handle: RequestHandle,
    sender: usize,
    deadline: Instant,
    expected: Expected,
    log: Arc<Mutex<Vec<ReplyOutcome>>>,
}

async fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let (_bus, correlator) = setup();
    let mut tracked: Vec<Tracked> = vec![];

    for op in ops {
        let now = Instant::now();
        match op {
            Op::Register { sender, timeout_ms } => {
                let log = Arc::new(Mutex::new(vec![]));
                let sink = log.clone();
                let handle = correlator
                    .register_callback(
                        ReplyMatcher::new().from_sender(SENDERS[sender]),
                        timeout(timeout_ms),
                        move |outcome| sink.lock().unwrap().push(outcome),
                    )
                    .unwrap();
                tracked.push(Tracked {
                    handle,
                    sender,
                    deadline: now + Duration::from_millis(timeout_ms),
                    expected: Expected::Pending,
                    log,
                });
            }
            Op::Event { sender } => {
                // handles are monotonic, so the first candidate in vec order is the
                // earliest registered one
                let expected = tracked.iter_mut().find(|t| {
                    t.expected == Expected::Pending && t.sender == sender && now < t.deadline
                });
                let result = correlator.dispatch(&event(SENDERS[sender], ContentKind::Text));
                match expected {
                    Some(t) => {
                        prop_assert_eq!(result, Dispatch::Resolved(t.handle));
                        t.expected = Expected::Matched;
                    }
                    None => prop_assert!(!matches!(result, Dispatch::Resolved(_))),
                }
            }
            Op::Cancel { target } => {
                if tracked.is_empty() {
                    continue;
                }
                let t = target.get_mut(tracked.as_mut_slice());
                let cancelled = correlator.cancel(t.handle);
                if t.expected == Expected::Pending {
                    if now < t.deadline {
                        prop_assert!(cancelled);
                    }
                    // at the deadline the timer may or may not have fired yet
                    t.expected = if cancelled {
                        Expected::Cancelled
                    } else {
                        Expected::TimedOut
                    };
                } else {
                    prop_assert!(!cancelled);
                }
            }
            Op::Sleep { ms } => sleep(Duration::from_millis(ms)).await,
        }

        for t in &tracked {
            prop_assert!(t.log.lock().unwrap().len() <= 1);
        }
    }

    sleep(Duration::from_millis(1000)).await;

    prop_assert_eq!(correlator.pending_count(), 0);
    prop_assert!(!correlator.is_subscribed());
    for t in &tracked {
        let log = t.log.lock().unwrap();
        prop_assert_eq!(log.len(), 1, "{} resolved {} times", t.handle, log.len());
        let outcome = &log[0];
        match t.expected {
            Expected::Matched => {
                prop_assert_eq!(
                    outcome.event().map(|e| e.sender.as_str()),
                    Some(SENDERS[t.sender])
                );
            }
            Expected::Cancelled => {
                prop_assert_eq!(outcome, &ReplyOutcome::Cancelled(CancelReason::Caller));
            }
            Expected::Pending | Expected::TimedOut => {
                prop_assert_eq!(outcome, &ReplyOutcome::TimedOut);
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_each_waiter_resolves_exactly_once(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops))?;
    }
}
