#![allow(dead_code)]

use std::sync::Arc;

use reply_correlator::{
    config::CorrelatorConfig,
    correlator::{ReplyCorrelator, ReplyTimeout},
    event_bus::{ContentKind, EventBus, InboundEvent},
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ実行したい処理
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub fn setup() -> (Arc<EventBus>, ReplyCorrelator) {
    let bus = Arc::new(EventBus::new(64));
    let correlator = ReplyCorrelator::new(bus.clone(), &CorrelatorConfig::default());
    (bus, correlator)
}

pub fn event(sender: &str, kind: ContentKind) -> InboundEvent {
    InboundEvent::builder(sender, kind).build().unwrap()
}

pub fn timeout(ms: u64) -> ReplyTimeout {
    ReplyTimeout::from_millis(ms).unwrap()
}
