//! Per-channel state cache
//!
//! Owned by the poller. Entries are created lazily on first access and only
//! change when a read decodes successfully.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use ahc_protocol::{Channel, ChannelState};

#[derive(Debug, Default)]
pub struct ChannelCache {
    states: BTreeMap<Channel, ChannelState>,
    names: HashMap<Channel, String>,
    updated_at: BTreeMap<Channel, DateTime<Utc>>,
}

impl ChannelCache {
    pub fn new(names: HashMap<Channel, String>) -> Self {
        Self {
            names,
            ..Default::default()
        }
    }

    /// Read-only view; `None` until the channel is first touched
    pub fn get(&self, channel: Channel) -> Option<&ChannelState> {
        self.states.get(&channel)
    }

    /// Mutable entry, created on first access
    pub fn entry(&mut self, channel: Channel) -> &mut ChannelState {
        self.states.entry(channel).or_default()
    }

    /// Apply a decoded update and stamp the channel
    pub fn update(&mut self, channel: Channel, apply: impl FnOnce(&mut ChannelState)) {
        apply(self.entry(channel));
        self.updated_at.insert(channel, Utc::now());
    }

    pub fn name(&self, channel: Channel) -> Option<&str> {
        self.names.get(&channel).map(String::as_str)
    }

    /// Display label: friendly name when configured, else `chNN`
    pub fn label(&self, channel: Channel) -> String {
        match self.name(channel) {
            Some(name) => format!("{channel} ({name})"),
            None => channel.to_string(),
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            taken_at: Utc::now(),
            channels: self
                .states
                .iter()
                .map(|(channel, state)| ChannelSnapshot {
                    channel: *channel,
                    name: self.names.get(channel).cloned(),
                    updated_at: self.updated_at.get(channel).copied(),
                    state: state.clone(),
                })
                .collect(),
        }
    }
}

/// Copy of one channel's cached values
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub name: Option<String>,
    /// Last successful decode, `None` if never read
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: ChannelState,
}

/// Copy of the whole cache handed to observers
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub taken_at: DateTime<Utc>,
    pub channels: Vec<ChannelSnapshot>,
}

impl CacheSnapshot {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_entries_created_lazily() {
        let mut cache = ChannelCache::default();
        let ch = Channel::new(3).unwrap();
        assert!(cache.get(ch).is_none());

        cache.entry(ch);
        assert_eq!(cache.get(ch), Some(&ChannelState::default()));
        assert!(cache.snapshot().channel(ch).unwrap().updated_at.is_none());
    }

    #[test]
    fn test_snapshot_carries_names_and_values() {
        let ch = Channel::new(1).unwrap();
        let mut cache = ChannelCache::new(HashMap::from([(ch, "Bathroom".to_string())]));
        cache.update(ch, |s| s.setpoint_c = Some(22.0));

        let snapshot = cache.snapshot();
        let entry = snapshot.channel(ch).unwrap();
        assert_eq!(entry.name.as_deref(), Some("Bathroom"));
        assert_eq!(entry.state.setpoint_c, Some(22.0));
        assert!(entry.updated_at.is_some());
        assert_eq!(cache.label(ch), "ch01 (Bathroom)");
    }
}
