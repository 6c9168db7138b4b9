//! Channel register map
//!
//! Pure decode/encode functions between raw register words and the channel
//! domain model. No I/O happens here.

use serde::{Deserialize, Serialize};

use crate::frame::{Category, RegisterAddress};
use crate::model::{Channel, ChannelAction, ChannelMode, FloorLimits};

/// CHANNELS category: per-channel status block
pub mod channels {
    /// Timer event / status word, carries the output bit
    pub const TIMER_EVENT: u8 = 0x00;
    pub const TIMER_EVENT_OUTPUT_ON_MASK: u16 = 0x0010;
    /// Primary element selector
    pub const PRIMARY_ELEMENT: u8 = 0x02;
    pub const PRIMARY_ELEMENT_INDEX_MASK: u16 = 0x003F;
    pub const PRIMARY_ELEMENT_ALL_TP_LOST_MASK: u16 = 0x0400;
}

/// ELEMENTS category: per-sensor status block
pub mod elements {
    pub const BLOCK_START: u8 = 0x00;
    pub const BLOCK_WORDS: u8 = 11;
    pub const AIR_TEMPERATURE: usize = 0x04;
    pub const FLOOR_TEMPERATURE: usize = 0x05;
    pub const BATTERY_STATUS: usize = 0x0A;
}

/// PACKED category: per-channel settings
pub mod packed {
    /// Comfort setpoint
    pub const MANUAL_TEMPERATURE: u8 = 0x00;
    pub const STANDBY_TEMPERATURE: u8 = 0x04;
    /// Words read from MANUAL_TEMPERATURE to cover both setpoints
    pub const SETPOINT_BLOCK_WORDS: u8 = 5;
    pub const FLOOR_MIN_TEMPERATURE: u8 = 0x05;
    pub const FLOOR_MAX_TEMPERATURE: u8 = 0x06;
    pub const CONFIGURATION: u8 = 0x07;

    pub const CONFIGURATION_MODE_MASK: u16 = 0x0007;
    pub const CONFIGURATION_MODE_MANUAL: u16 = 0x0000;
    pub const CONFIGURATION_MODE_STANDBY: u16 = 0x0001;
    pub const CONFIGURATION_MODE_STANDBY_ALT: u16 = 0x0005;
    pub const CONFIGURATION_CHILD_LOCK_MASK: u16 = 0x0800;
    /// Program/override flags cleared by an extended repair
    pub const CONFIGURATION_OVERRIDE_FLAGS_MASK: u16 = 0x0030;
}

/// Floor readings outside (FLOOR_PLAUSIBLE_MIN_C, FLOOR_PLAUSIBLE_MAX_C) are discarded
pub const FLOOR_PLAUSIBLE_MIN_C: f32 = 1.0;
pub const FLOOR_PLAUSIBLE_MAX_C: f32 = 90.0;
/// A plausible floor reading at or above this is evidence of a real probe
pub const FLOOR_PRESENT_THRESHOLD_C: f32 = 15.0;
/// Minimum air/floor divergence that counts as a separate probe
pub const FLOOR_DIVERGENCE_C: f32 = 0.2;

/// Raw ↔ °C conversion with a configurable divisor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempScale {
    divisor: f32,
}

impl Default for TempScale {
    fn default() -> Self {
        Self { divisor: 10.0 }
    }
}

impl TempScale {
    /// Non-positive or non-finite divisors fall back to 10.0
    pub fn new(divisor: f32) -> Self {
        if divisor.is_finite() && divisor > 0.0 {
            Self { divisor }
        } else {
            Self::default()
        }
    }

    pub fn divisor(&self) -> f32 {
        self.divisor
    }

    /// Raw words are signed tenths (or 1/divisor) of a degree
    pub fn raw_to_c(&self, raw: u16) -> f32 {
        f32::from(raw as i16) / self.divisor
    }

    pub fn c_to_raw(&self, celsius: f32) -> u16 {
        let scaled = (celsius * self.divisor).round();
        scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16 as u16
    }
}

// ============================================================================
// Addresses
// ============================================================================

pub fn primary_element_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(Category::Channels, channel.page(), channels::PRIMARY_ELEMENT)
}

pub fn status_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(Category::Channels, channel.page(), channels::TIMER_EVENT)
}

pub fn config_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(Category::Packed, channel.page(), packed::CONFIGURATION)
}

pub fn setpoint_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(Category::Packed, channel.page(), packed::MANUAL_TEMPERATURE)
}

pub fn standby_setpoint_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(Category::Packed, channel.page(), packed::STANDBY_TEMPERATURE)
}

pub fn floor_limits_addr(channel: Channel) -> RegisterAddress {
    RegisterAddress::new(
        Category::Packed,
        channel.page(),
        packed::FLOOR_MIN_TEMPERATURE,
    )
}

/// Element block for a 1-based element index
pub fn element_block_addr(element: u8) -> RegisterAddress {
    RegisterAddress::new(
        Category::Elements,
        element.saturating_sub(1),
        elements::BLOCK_START,
    )
}

// ============================================================================
// Configuration word
// ============================================================================

/// STANDBY (either encoding) is OFF, everything else is HEAT
pub fn decode_mode(config: u16) -> ChannelMode {
    match config & packed::CONFIGURATION_MODE_MASK {
        packed::CONFIGURATION_MODE_STANDBY | packed::CONFIGURATION_MODE_STANDBY_ALT => {
            ChannelMode::Off
        },
        _ => ChannelMode::Heat,
    }
}

/// Mode field bits written by this engine
pub fn encode_mode(mode: ChannelMode) -> u16 {
    match mode {
        ChannelMode::Heat => packed::CONFIGURATION_MODE_MANUAL,
        ChannelMode::Off => packed::CONFIGURATION_MODE_STANDBY,
    }
}

pub fn decode_child_lock(config: u16) -> bool {
    config & packed::CONFIGURATION_CHILD_LOCK_MASK != 0
}

/// Canonical configuration word: mode bits plus the lock bit
pub fn baseline_config(mode: ChannelMode, child_lock: bool) -> u16 {
    let lock = if child_lock {
        packed::CONFIGURATION_CHILD_LOCK_MASK
    } else {
        0
    };
    encode_mode(mode) | lock
}

// ============================================================================
// Channel status
// ============================================================================

/// Decoded primary element selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryElement {
    /// 1-based element index, 0 = none configured
    pub index: u8,
    pub all_sensors_lost: bool,
}

impl PrimaryElement {
    pub fn is_usable(&self) -> bool {
        self.index != 0 && !self.all_sensors_lost
    }
}

pub fn decode_primary_element(word: u16) -> PrimaryElement {
    PrimaryElement {
        index: (word & channels::PRIMARY_ELEMENT_INDEX_MASK) as u8,
        all_sensors_lost: word & channels::PRIMARY_ELEMENT_ALL_TP_LOST_MASK != 0,
    }
}

pub fn decode_action(status: u16) -> ChannelAction {
    if status & channels::TIMER_EVENT_OUTPUT_ON_MASK != 0 {
        ChannelAction::Heating
    } else {
        ChannelAction::Idle
    }
}

pub fn decode_floor_limits(words: &[u16], scale: TempScale) -> FloorLimits {
    FloorLimits {
        min_c: words.first().map(|raw| scale.raw_to_c(*raw)),
        max_c: words.get(1).map(|raw| scale.raw_to_c(*raw)),
    }
}

// ============================================================================
// Element block
// ============================================================================

/// Values taken from one element status block
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ElementReading {
    pub air_c: Option<f32>,
    pub floor_c: Option<f32>,
    pub has_floor_sensor: bool,
    pub battery_pct: Option<u8>,
}

pub fn plausible_floor(celsius: f32) -> bool {
    celsius > FLOOR_PLAUSIBLE_MIN_C && celsius < FLOOR_PLAUSIBLE_MAX_C
}

/// A plausible floor value alone is not enough: it must exceed the
/// threshold or differ from the air reading.
pub fn floor_sensor_present(air_c: Option<f32>, floor_c: f32) -> bool {
    if !plausible_floor(floor_c) {
        return false;
    }
    let diverges = air_c.is_some_and(|air| (floor_c - air).abs() > FLOOR_DIVERGENCE_C);
    floor_c >= FLOOR_PRESENT_THRESHOLD_C || diverges
}

/// 0..=10 steps scaled to percent, anything else unknown
pub fn decode_battery(word: Option<u16>) -> Option<u8> {
    match word {
        Some(step) if step <= 10 => Some((step * 10) as u8),
        _ => None,
    }
}

pub fn decode_element_block(words: &[u16], scale: TempScale) -> ElementReading {
    let air_c = words
        .get(elements::AIR_TEMPERATURE)
        .map(|raw| scale.raw_to_c(*raw));
    let floor_raw = words
        .get(elements::FLOOR_TEMPERATURE)
        .map(|raw| scale.raw_to_c(*raw));

    let (floor_c, has_floor_sensor) = match floor_raw {
        Some(floor) if plausible_floor(floor) => (Some(floor), floor_sensor_present(air_c, floor)),
        _ => (None, false),
    };

    ElementReading {
        air_c,
        floor_c,
        has_floor_sensor,
        battery_pct: decode_battery(words.get(elements::BATTERY_STATUS).copied()),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block(air: u16, floor: u16, battery: u16) -> Vec<u16> {
        let mut words = vec![0u16; elements::BLOCK_WORDS as usize];
        words[elements::AIR_TEMPERATURE] = air;
        words[elements::FLOOR_TEMPERATURE] = floor;
        words[elements::BATTERY_STATUS] = battery;
        words
    }

    #[test]
    fn test_temperature_conversion() {
        let scale = TempScale::default();
        assert_eq!(scale.raw_to_c(215), 21.5);
        assert_eq!(scale.c_to_raw(21.5), 215);
        assert_eq!(scale.raw_to_c(0xFFEC), -2.0);
        assert_eq!(scale.c_to_raw(-2.0), 0xFFEC);
    }

    #[test]
    fn test_invalid_divisor_falls_back() {
        assert_eq!(TempScale::new(0.0).divisor(), 10.0);
        assert_eq!(TempScale::new(-5.0).divisor(), 10.0);
        assert_eq!(TempScale::new(100.0).divisor(), 100.0);
    }

    #[test]
    fn test_mode_decoding() {
        assert_eq!(decode_mode(0x0000), ChannelMode::Heat);
        assert_eq!(decode_mode(0x0001), ChannelMode::Off);
        assert_eq!(decode_mode(0x0005), ChannelMode::Off);
        assert_eq!(decode_mode(0x0802), ChannelMode::Heat);
        assert_eq!(decode_mode(0x0801), ChannelMode::Off);
    }

    #[test]
    fn test_child_lock_shares_config_word() {
        assert!(decode_child_lock(0x0801));
        assert!(!decode_child_lock(0x0001));
        assert_eq!(baseline_config(ChannelMode::Off, true), 0x0801);
        assert_eq!(baseline_config(ChannelMode::Heat, false), 0x0000);
    }

    #[test]
    fn test_primary_element_decoding() {
        let sel = decode_primary_element(0x0003);
        assert_eq!(sel.index, 3);
        assert!(!sel.all_sensors_lost);
        assert!(sel.is_usable());

        let lost = decode_primary_element(0x0403);
        assert!(lost.all_sensors_lost);
        assert!(!lost.is_usable());

        assert!(!decode_primary_element(0x0000).is_usable());
    }

    #[test]
    fn test_action_from_output_bit() {
        assert_eq!(decode_action(0x0010), ChannelAction::Heating);
        assert_eq!(decode_action(0x00EF), ChannelAction::Idle);
    }

    #[test]
    fn test_floor_probe_detected_by_divergence() {
        let reading = decode_element_block(&block(210, 234, 8), TempScale::default());
        assert_eq!(reading.air_c, Some(21.0));
        assert_eq!(reading.floor_c, Some(23.4));
        assert!(reading.has_floor_sensor);
        assert_eq!(reading.battery_pct, Some(80));
    }

    #[test]
    fn test_implausible_floor_rejected() {
        let reading = decode_element_block(&block(210, 3, 8), TempScale::default());
        assert_eq!(reading.floor_c, None);
        assert!(!reading.has_floor_sensor);
    }

    #[test]
    fn test_floor_equal_to_air_below_threshold_is_not_a_probe() {
        let reading = decode_element_block(&block(100, 100, 8), TempScale::default());
        assert_eq!(reading.floor_c, Some(10.0));
        assert!(!reading.has_floor_sensor);
    }

    #[test]
    fn test_battery_absent_is_unknown() {
        assert_eq!(decode_battery(None), None);
        assert_eq!(decode_battery(Some(0)), Some(0));
        assert_eq!(decode_battery(Some(10)), Some(100));
        assert_eq!(decode_battery(Some(0xFF)), None);

        let short = decode_element_block(&[0, 0, 0, 0, 215], TempScale::default());
        assert_eq!(short.air_c, Some(21.5));
        assert_eq!(short.battery_pct, None);
    }

    #[test]
    fn test_addresses_use_zero_based_pages() {
        let ch = Channel::new(4).unwrap();
        assert_eq!(config_addr(ch).page, 3);
        assert_eq!(config_addr(ch).index, packed::CONFIGURATION);
        assert_eq!(element_block_addr(1).page, 0);
        assert_eq!(floor_limits_addr(ch).offset(1).index, packed::FLOOR_MAX_TEMPERATURE);
    }

    proptest! {
        #[test]
        fn prop_celsius_roundtrip(x in -50.0f32..=90.0f32) {
            let scale = TempScale::new(10.0);
            let back = scale.raw_to_c(scale.c_to_raw(x));
            prop_assert!((back - x).abs() <= 1.0 / scale.divisor());
        }
    }
}
