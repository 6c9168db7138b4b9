//! Transceiver signal lines
//!
//! Transmit-enable and flow-control outputs for an RS-485 driver chip.
//! Supports sysfs GPIO access on Linux; tests use `RecordingLine`.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// Output signal driving the transceiver
pub trait SignalLine: Send {
    /// Assert (`true`) or deassert (`false`) the line
    fn set(&mut self, active: bool) -> Result<()>;

    /// Human readable name for logs
    fn name(&self) -> String;
}

/// Sysfs GPIO output for Linux
pub struct SysfsGpioLine {
    base_path: String,
    gpio_number: u32,
    /// Drive the pin low when asserted
    active_low: bool,
}

impl SysfsGpioLine {
    /// Export the GPIO (if needed) and configure it as a deasserted output
    pub fn open(base_path: &str, gpio_number: u32, active_low: bool) -> Result<Self> {
        let mut line = Self {
            base_path: base_path.to_string(),
            gpio_number,
            active_low,
        };
        line.setup()?;
        line.set(false)?;
        Ok(line)
    }

    fn gpio_path(&self) -> String {
        format!("{}/gpio{}", self.base_path, self.gpio_number)
    }

    fn setup(&self) -> Result<()> {
        if !Path::new(&self.base_path).exists() {
            return Err(ProtocolError::config(format!(
                "GPIO base path {} not available",
                self.base_path
            )));
        }

        // Export GPIO if not already exported
        let export_path = format!("{}/export", self.base_path);
        let gpio_path = self.gpio_path();

        if !Path::new(&gpio_path).exists() {
            if let Err(e) = std::fs::write(&export_path, self.gpio_number.to_string()) {
                // Ignore "device busy" errors (already exported)
                if !e.to_string().contains("Device or resource busy") {
                    warn!("Failed to export GPIO {}: {}", self.gpio_number, e);
                }
            }
        }

        let direction_path = format!("{}/direction", gpio_path);
        std::fs::write(&direction_path, "out").map_err(|e| {
            ProtocolError::io(format!(
                "GPIO {} direction setup failed: {}",
                self.gpio_number, e
            ))
        })?;

        debug!("GPIO {} configured as output", self.gpio_number);
        Ok(())
    }
}

impl SignalLine for SysfsGpioLine {
    fn set(&mut self, active: bool) -> Result<()> {
        let level = active != self.active_low;
        let path = format!("{}/value", self.gpio_path());
        let content = if level { "1" } else { "0" };
        std::fs::write(&path, content).map_err(|e| {
            ProtocolError::io(format!("GPIO {} write failed: {}", self.gpio_number, e))
        })
    }

    fn name(&self) -> String {
        format!("gpio{}", self.gpio_number)
    }
}

/// In-memory line that records every transition
#[derive(Clone, Default)]
pub struct RecordingLine {
    transitions: Arc<Mutex<Vec<bool>>>,
}

impl RecordingLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// All levels set so far, in order
    pub fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().clone()
    }

    /// Current level (`false` when never set)
    pub fn is_active(&self) -> bool {
        self.transitions.lock().last().copied().unwrap_or(false)
    }
}

impl SignalLine for RecordingLine {
    fn set(&mut self, active: bool) -> Result<()> {
        self.transitions.lock().push(active);
        Ok(())
    }

    fn name(&self) -> String {
        "recording".to_string()
    }
}
