//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `UFHSRV_` environment variables (`__` separates nesting levels, e.g.
//! `UFHSRV_BUS__RECEIVE_TIMEOUT_MS=500`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use ahc_protocol::{
    Channel, EngineConfig, HardwareProfile, SerialParams, TempScale, CHANNEL_COUNT,
};

use crate::error::{Result, UfhSrvError};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/ufhsrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "UFHSRV_";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub bus: BusConfig,
    pub polling: PollingConfig,
    pub writes: WritesConfig,
    /// Channel number (as string key) → per-channel settings
    pub channels: BTreeMap<String, ChannelConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: String,
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 38_400,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub receive_timeout_ms: u64,
    pub attempts: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    /// Drop bytes left over from an unanswered exchange before each request
    pub flush_stale_input: bool,
    pub hardware_profile: HardwareProfile,
    /// Sysfs GPIO driving the transceiver DE/RE pins
    pub tx_enable_gpio: Option<u32>,
    pub flow_control_gpio: Option<u32>,
    pub gpio_base_path: String,
    /// Raw temperature words per °C
    pub temp_divisor: f32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 1000,
            attempts: 3,
            retry_backoff_ms: 20,
            poll_interval_ms: 10,
            flush_stale_input: true,
            hardware_profile: HardwareProfile::Standard,
            tx_enable_gpio: None,
            flow_control_gpio: None,
            gpio_base_path: "/sys/class/gpio".to_string(),
            temp_divisor: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Scheduler invocation period in `run`
    pub interval_ms: u64,
    pub channels_per_cycle: usize,
    /// 0 = unlimited
    pub max_transactions_per_cycle: u32,
    pub steps_per_visit: u8,
    /// Background polling pause after a write
    pub write_guard_ms: u64,
    /// Empty = all channels
    pub active_channels: Vec<u8>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            channels_per_cycle: 2,
            max_transactions_per_cycle: 0,
            steps_per_visit: 2,
            write_guard_ms: 1500,
            active_channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritesConfig {
    pub allow_mode_writes: bool,
    /// Channels whose mode writes stop after the strict write
    pub strict_mode_channels: Vec<u8>,
    pub max_mode_reconcile_attempts: u32,
}

impl Default for WritesConfig {
    fn default() -> Self {
        Self {
            allow_mode_writes: true,
            strict_mode_channels: Vec::new(),
            max_mode_reconcile_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Enables the daily file log when set
    pub dir: Option<String>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

impl Config {
    /// Load defaults + YAML + environment and validate the result
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let yaml = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(UfhSrvError::config(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                Yaml::file(p)
            },
            None => Yaml::file(DEFAULT_CONFIG_PATH),
        };

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(yaml)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, numbers: &[u8]| -> Result<()> {
            for n in numbers {
                Channel::new(*n).map_err(|_| {
                    UfhSrvError::config(format!(
                        "{what}: channel {n} outside 1..={CHANNEL_COUNT}"
                    ))
                })?;
            }
            Ok(())
        };
        check("polling.active_channels", &self.polling.active_channels)?;
        check("writes.strict_mode_channels", &self.writes.strict_mode_channels)?;
        for key in self.channels.keys() {
            parse_channel_key(key)?;
        }

        if !(self.bus.temp_divisor.is_finite() && self.bus.temp_divisor > 0.0) {
            return Err(UfhSrvError::config(format!(
                "bus.temp_divisor must be positive, got {}",
                self.bus.temp_divisor
            )));
        }
        if self.bus.attempts == 0 {
            return Err(UfhSrvError::config("bus.attempts must be at least 1"));
        }
        if self.bus.receive_timeout_ms == 0 {
            return Err(UfhSrvError::config("bus.receive_timeout_ms must be positive"));
        }
        if self.serial.baud_rate == 0 {
            return Err(UfhSrvError::config("serial.baud_rate must be positive"));
        }
        Ok(())
    }

    pub fn serial_params(&self) -> SerialParams {
        SerialParams {
            device: self.serial.device.clone(),
            baud_rate: self.serial.baud_rate,
            data_bits: self.serial.data_bits,
            stop_bits: self.serial.stop_bits,
            parity: self.serial.parity.clone(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            receive_timeout: Duration::from_millis(self.bus.receive_timeout_ms),
            attempts: self.bus.attempts,
            retry_backoff: Duration::from_millis(self.bus.retry_backoff_ms),
            poll_interval: Duration::from_millis(self.bus.poll_interval_ms.max(1)),
            ..Default::default()
        }
    }

    pub fn temp_scale(&self) -> TempScale {
        TempScale::new(self.bus.temp_divisor)
    }

    /// Configured active set, all channels when empty
    pub fn active_channels(&self) -> Vec<Channel> {
        let mut active: Vec<Channel> = self
            .polling
            .active_channels
            .iter()
            .filter_map(|n| Channel::new(*n).ok())
            .collect();
        active.sort();
        active.dedup();
        if active.is_empty() {
            Channel::all().collect()
        } else {
            active
        }
    }

    pub fn strict_mode_channels(&self) -> HashSet<Channel> {
        self.writes
            .strict_mode_channels
            .iter()
            .filter_map(|n| Channel::new(*n).ok())
            .collect()
    }

    pub fn friendly_names(&self) -> HashMap<Channel, String> {
        self.channels
            .iter()
            .filter_map(|(key, cfg)| {
                let channel = parse_channel_key(key).ok()?;
                cfg.friendly_name.clone().map(|name| (channel, name))
            })
            .collect()
    }

    pub fn channels_per_cycle(&self) -> usize {
        self.polling
            .channels_per_cycle
            .clamp(1, CHANNEL_COUNT as usize)
    }

    pub fn steps_per_visit(&self) -> u8 {
        self.polling.steps_per_visit.clamp(1, 5)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| UfhSrvError::config(e.to_string()))
    }
}

fn parse_channel_key(key: &str) -> Result<Channel> {
    let number: u8 = key
        .trim()
        .parse()
        .map_err(|_| UfhSrvError::config(format!("channels: invalid channel key '{key}'")))?;
    Channel::new(number).map_err(|_| {
        UfhSrvError::config(format!(
            "channels: channel {number} outside 1..={CHANNEL_COUNT}"
        ))
    })
}
