//! Shared fixtures: a poller wired to the in-memory controller

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahc_protocol::{
    BusTiming, Channel, EngineConfig, Request, SimChannel, SimulatedController, Transceiver,
    TransactionEngine,
};
use ufhsrv::{CacheSnapshot, PollerSettings, ZonePoller};

pub fn ch(number: u8) -> Channel {
    Channel::new(number).unwrap()
}

/// One attempt per transaction, short timeouts
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        receive_timeout: Duration::from_millis(30),
        attempts: 1,
        retry_backoff: Duration::from_millis(1),
        poll_interval: Duration::from_millis(2),
        ..Default::default()
    }
}

/// One channel per invocation, no guard window, no budget
pub fn test_settings(active: &[u8]) -> PollerSettings {
    PollerSettings {
        channels_per_cycle: 1,
        steps_per_visit: 2,
        write_guard: Duration::ZERO,
        active_channels: active.iter().map(|n| ch(*n)).collect(),
        ..Default::default()
    }
}

pub fn build_poller(sim: &SimulatedController, settings: PollerSettings) -> ZonePoller {
    let transceiver = Transceiver::new(Box::new(sim.clone()), BusTiming::immediate());
    let engine = TransactionEngine::new(transceiver, fast_engine_config());
    ZonePoller::new(engine, settings, HashMap::new())
}

/// Controller with every listed channel seeded from the default fixture
pub fn seeded_controller(active: &[u8]) -> SimulatedController {
    let sim = SimulatedController::new();
    for n in active {
        sim.seed_channel(
            ch(*n),
            &SimChannel {
                primary_element: *n,
                ..Default::default()
            },
        );
    }
    sim
}

/// Counts observer callbacks
pub fn publish_counter(poller: &mut ZonePoller) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    poller.register_observer(Box::new(move |_: &CacheSnapshot| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    counter
}

pub fn published(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Requests touching the given channel page (element blocks excluded)
pub fn requests_for(sim: &SimulatedController, channel: Channel) -> Vec<Request> {
    sim.requests()
        .into_iter()
        .filter(|r| {
            r.address().page == channel.page()
                && r.address().category != ahc_protocol::Category::Elements
        })
        .collect()
}
