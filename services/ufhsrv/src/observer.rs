//! Cache publication
//!
//! Consumers register a `ChannelObserver` with the poller and receive one
//! snapshot per scheduler invocation.

use tracing::debug;

use crate::cache::CacheSnapshot;

pub trait ChannelObserver: Send {
    fn on_update(&mut self, snapshot: &CacheSnapshot);
}

/// Logs a one-line summary per channel at debug level
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ChannelObserver for LoggingObserver {
    fn on_update(&mut self, snapshot: &CacheSnapshot) {
        for entry in &snapshot.channels {
            let state = &entry.state;
            debug!(
                "{}: temp={:?} set={:?} mode={} action={:?} lock={}",
                entry.channel,
                state.current_temp_c,
                state.setpoint_c,
                state.mode,
                state.action,
                state.child_lock
            );
        }
    }
}

impl<F> ChannelObserver for F
where
    F: FnMut(&CacheSnapshot) + Send,
{
    fn on_update(&mut self, snapshot: &CacheSnapshot) {
        self(snapshot)
    }
}
