//! Transceiver controller
//!
//! Gates the shared half-duplex line: optional stale-input flush, transmit
//! enable (and flow control) assertion, settle delay, transmission, drain,
//! release, post-transmit guard. The line is back in receive mode on every
//! exit path.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::frame::MAX_REQUEST_LEN;
use crate::hex;
use crate::line::SignalLine;
use crate::transport::BusPort;

/// Bits per character on the wire (start + 8 data + parity/stop + stop)
pub const BITS_PER_CHAR: u64 = 11;

/// Hardware timing profile of the RS-485 adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareProfile {
    /// Native UART with a GPIO-driven transceiver
    #[default]
    Standard,
    /// USB-serial bridge with buffered writes
    UsbAdapter,
    /// Galvanically isolated adapter with slow direction switching
    IsolatedAdapter,
}

impl HardwareProfile {
    /// Delay between asserting transmit enable and the first byte
    pub fn pre_tx_settle(&self) -> Duration {
        match self {
            HardwareProfile::Standard => Duration::from_micros(100),
            HardwareProfile::UsbAdapter => Duration::from_micros(1_000),
            HardwareProfile::IsolatedAdapter => Duration::from_micros(2_000),
        }
    }

    /// Lower bound of the post-transmit guard
    pub fn guard_floor(&self) -> Duration {
        match self {
            HardwareProfile::Standard => Duration::from_micros(2_000),
            HardwareProfile::UsbAdapter => Duration::from_micros(5_000),
            HardwareProfile::IsolatedAdapter => Duration::from_micros(10_000),
        }
    }
}

/// Line timing derived from the baud rate and hardware profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    /// Time to shift one character
    pub char_time: Duration,
    pub pre_tx_settle: Duration,
    pub post_tx_guard: Duration,
}

impl BusTiming {
    /// ceil(11 bits × 1,000,000 / baud) microseconds
    pub fn char_time_us(baud_rate: u32) -> u64 {
        let baud = u64::from(baud_rate.max(1));
        (BITS_PER_CHAR * 1_000_000).div_ceil(baud)
    }

    /// guard = max(profile floor, char_time × longest frame + 2 × char_time)
    pub fn derive(baud_rate: u32, profile: HardwareProfile) -> Result<Self> {
        if baud_rate == 0 {
            return Err(ProtocolError::config("baud rate must be positive"));
        }
        let char_us = Self::char_time_us(baud_rate);
        let frame_guard_us = char_us * MAX_REQUEST_LEN as u64 + 2 * char_us;
        let guard = Duration::from_micros(frame_guard_us).max(profile.guard_floor());

        Ok(Self {
            char_time: Duration::from_micros(char_us),
            pre_tx_settle: profile.pre_tx_settle(),
            post_tx_guard: guard,
        })
    }

    /// No delays at all (simulated buses)
    pub fn immediate() -> Self {
        Self {
            char_time: Duration::ZERO,
            pre_tx_settle: Duration::ZERO,
            post_tx_guard: Duration::ZERO,
        }
    }

    /// Time for `bytes` characters to leave the shift register
    pub fn drain_time(&self, bytes: usize) -> Duration {
        self.char_time * bytes as u32
    }
}

/// Owner of the port and the direction-control lines
pub struct Transceiver {
    port: Box<dyn BusPort>,
    tx_enable: Option<Box<dyn SignalLine>>,
    flow_control: Option<Box<dyn SignalLine>>,
    timing: BusTiming,
    flush_stale_input: bool,
}

impl Transceiver {
    pub fn new(port: Box<dyn BusPort>, timing: BusTiming) -> Self {
        Self {
            port,
            tx_enable: None,
            flow_control: None,
            timing,
            flush_stale_input: true,
        }
    }

    pub fn with_tx_enable(mut self, line: Box<dyn SignalLine>) -> Self {
        self.tx_enable = Some(line);
        self
    }

    pub fn with_flow_control(mut self, line: Box<dyn SignalLine>) -> Self {
        self.flow_control = Some(line);
        self
    }

    pub fn with_flush_stale_input(mut self, flush: bool) -> Self {
        self.flush_stale_input = flush;
        self
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    fn has_direction_control(&self) -> bool {
        self.tx_enable.is_some() || self.flow_control.is_some()
    }

    fn drive(&mut self, active: bool) -> Result<()> {
        if let Some(line) = self.tx_enable.as_mut() {
            line.set(active)?;
        }
        if let Some(line) = self.flow_control.as_mut() {
            line.set(active)?;
        }
        Ok(())
    }

    /// Put one frame on the wire and return the line to receive mode
    pub async fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if self.flush_stale_input {
            let stale = self.port.discard_input()?;
            if stale > 0 {
                debug!("Discarded {} stale RX bytes before TX", stale);
            }
        }

        if let Err(e) = self.drive(true) {
            // Best effort: never leave the driver enabled
            let _ = self.drive(false);
            return Err(e);
        }
        if !self.timing.pre_tx_settle.is_zero() {
            sleep(self.timing.pre_tx_settle).await;
        }

        debug!("TX [{}]", hex::preview(frame));
        let sent = self.port.send(frame).await;

        if sent.is_ok() && self.has_direction_control() {
            sleep(self.timing.drain_time(frame.len())).await;
        }
        let released = self.drive(false);
        if let Err(e) = &released {
            warn!("Failed to release transmit enable: {}", e);
        }

        if !self.timing.post_tx_guard.is_zero() {
            sleep(self.timing.post_tx_guard).await;
        }

        sent?;
        released
    }

    /// Read whatever arrives within `wait`
    pub async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        self.port.receive(buffer, wait).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::line::RecordingLine;
    use crate::simulator::SimulatedController;

    #[test]
    fn test_char_time_rounds_up() {
        // 11_000_000 / 38400 = 286.46
        assert_eq!(BusTiming::char_time_us(38_400), 287);
        assert_eq!(BusTiming::char_time_us(9_600), 1_146);
        assert_eq!(BusTiming::char_time_us(115_200), 96);
    }

    #[test]
    fn test_guard_derivation() {
        // 1146us × 14 chars dominates the 2ms floor at 9600 baud
        let slow = BusTiming::derive(9_600, HardwareProfile::Standard).unwrap();
        assert_eq!(slow.post_tx_guard, Duration::from_micros(1_146 * 14));

        // At 115200 the profile floor wins
        let fast = BusTiming::derive(115_200, HardwareProfile::Standard).unwrap();
        assert_eq!(fast.post_tx_guard, Duration::from_micros(2_000));

        let isolated = BusTiming::derive(115_200, HardwareProfile::IsolatedAdapter).unwrap();
        assert_eq!(isolated.post_tx_guard, Duration::from_micros(10_000));
        assert_eq!(isolated.pre_tx_settle, Duration::from_micros(2_000));
    }

    #[test]
    fn test_zero_baud_rejected() {
        assert!(matches!(
            BusTiming::derive(0, HardwareProfile::Standard),
            Err(ProtocolError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_transmit_toggles_lines_and_releases() {
        let sim = SimulatedController::new();
        let tx = RecordingLine::new();
        let flow = RecordingLine::new();
        let mut transceiver = Transceiver::new(Box::new(sim.clone()), BusTiming::immediate())
            .with_tx_enable(Box::new(tx.clone()))
            .with_flow_control(Box::new(flow.clone()));

        transceiver.transmit(&[0x01, 0x02]).await.unwrap();

        assert_eq!(tx.transitions(), vec![true, false]);
        assert_eq!(flow.transitions(), vec![true, false]);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn test_transmit_flushes_stale_input() {
        let sim = SimulatedController::new();
        sim.inject_stale_bytes(&[0xAA, 0xBB, 0xCC]);
        let mut transceiver = Transceiver::new(Box::new(sim.clone()), BusTiming::immediate());

        transceiver.transmit(&[0x00]).await.unwrap();
        assert_eq!(sim.pending_rx_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_input_kept_when_flush_disabled() {
        let sim = SimulatedController::new();
        sim.inject_stale_bytes(&[0xAA, 0xBB]);
        let mut transceiver = Transceiver::new(Box::new(sim.clone()), BusTiming::immediate())
            .with_flush_stale_input(false);

        transceiver.transmit(&[0x00]).await.unwrap();
        assert_eq!(sim.pending_rx_len(), 2);
    }
}
