//! Channel domain model
//!
//! Channels are the unit of addressing (1..=16). Each one owns a
//! `ChannelState` holding the last successfully decoded values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Number of independently addressable channels
pub const CHANNEL_COUNT: u8 = 16;

/// Validated channel number (1..=16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    pub fn new(number: u8) -> Result<Self> {
        if (1..=CHANNEL_COUNT).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ProtocolError::InvalidChannel(number))
        }
    }

    /// 1-based channel number
    pub fn number(self) -> u8 {
        self.0
    }

    /// 0-based page used in register addresses
    pub fn page(self) -> u8 {
        self.0 - 1
    }

    /// Iterator over channels 1..=16
    pub fn all() -> impl Iterator<Item = Channel> {
        (1..=CHANNEL_COUNT).map(Channel)
    }
}

impl TryFrom<u8> for Channel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Channel::new(value)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> u8 {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{:02}", self.0)
    }
}

/// Operating mode as exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Heat,
    Off,
}

impl FromStr for ChannelMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heat" | "on" | "manual" => Ok(ChannelMode::Heat),
            "off" | "standby" => Ok(ChannelMode::Off),
            other => Err(format!("unknown mode '{other}' (expected heat|off)")),
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Heat => write!(f, "heat"),
            ChannelMode::Off => write!(f, "off"),
        }
    }
}

/// Derived heating action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAction {
    Heating,
    #[default]
    Idle,
}

/// Floor limits in °C, each possibly unknown
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FloorLimits {
    pub min_c: Option<f32>,
    pub max_c: Option<f32>,
}

/// Cached per-channel state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub current_temp_c: Option<f32>,
    pub setpoint_c: Option<f32>,
    pub standby_setpoint_c: Option<f32>,
    pub floor_limits: FloorLimits,
    pub floor_temp_c: Option<f32>,
    pub has_floor_sensor: bool,
    pub mode: ChannelMode,
    pub action: ChannelAction,
    /// 1-based primary element index, 0 = none configured
    pub primary_element: u8,
    pub all_sensors_lost: bool,
    /// 0..=100, `None` when the element reports no battery
    pub battery_pct: Option<u8>,
    pub child_lock: bool,
    /// Raw configuration word from the last successful read
    pub config_word: Option<u16>,
}

impl ChannelState {
    /// True when the channel cannot trust any element for its temperature
    pub fn temperature_unavailable(&self) -> bool {
        self.all_sensors_lost || self.primary_element == 0
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_channel_bounds() {
        assert!(Channel::new(1).is_ok());
        assert!(Channel::new(16).is_ok());
        assert_eq!(Channel::new(0), Err(ProtocolError::InvalidChannel(0)));
        assert_eq!(Channel::new(17), Err(ProtocolError::InvalidChannel(17)));
    }

    #[test]
    fn test_channel_page_is_zero_based() {
        assert_eq!(Channel::new(1).unwrap().page(), 0);
        assert_eq!(Channel::new(16).unwrap().page(), 15);
        assert_eq!(Channel::all().count(), 16);
    }

    #[test]
    fn test_channel_deserialize_validates() {
        let ok: Channel = serde_json::from_str("5").unwrap();
        assert_eq!(ok.number(), 5);
        assert!(serde_json::from_str::<Channel>("42").is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("HEAT".parse::<ChannelMode>().unwrap(), ChannelMode::Heat);
        assert_eq!("off".parse::<ChannelMode>().unwrap(), ChannelMode::Off);
        assert!("cool".parse::<ChannelMode>().is_err());
    }

    #[test]
    fn test_fresh_state_reports_unknowns() {
        let state = ChannelState::default();
        assert_eq!(state.current_temp_c, None);
        assert_eq!(state.battery_pct, None);
        assert_eq!(state.mode, ChannelMode::Heat);
        assert_eq!(state.action, ChannelAction::Idle);
        assert!(state.temperature_unavailable());
    }
}
