//! Serial bus port
//!
//! Byte-level access to the half-duplex line. The transceiver and the
//! transaction engine only see the `BusPort` trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use crate::error::{ProtocolError, Result};

/// Half-duplex byte port
#[async_trait]
pub trait BusPort: Send {
    /// Write the whole frame and flush it to the driver
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever arrives within `wait`; `Ok(0)` when nothing did
    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize>;

    /// Drop bytes already sitting in the receive buffer, returning how many
    fn discard_input(&mut self) -> Result<usize>;
}

/// Serial line parameters
#[derive(Debug, Clone)]
pub struct SerialParams {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 38_400,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
        }
    }
}

/// `BusPort` over a tokio-serial stream
pub struct SerialBusPort {
    port: SerialStream,
}

impl SerialBusPort {
    pub fn open(params: &SerialParams) -> Result<Self> {
        debug!("RTU: {} @{}baud", params.device, params.baud_rate);

        let parity = match params.parity.to_ascii_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let data_bits = match params.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match params.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&params.device, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
        {
            Ok(port) => {
                info!("Serial opened: {}", params.device);
                Ok(Self { port })
            },
            Err(e) => {
                error!("Serial err: {} - {}", params.device, e);
                Err(ProtocolError::io(format!(
                    "Failed to open serial port {}: {e}",
                    params.device
                )))
            },
        }
    }
}

#[async_trait]
impl BusPort for SerialBusPort {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).await.map_err(|e| {
            error!("RTU TX: {}", e);
            ProtocolError::io(format!("Serial send error: {e}"))
        })?;
        self.port.flush().await.map_err(|e| {
            error!("RTU flush: {}", e);
            ProtocolError::io(format!("Serial flush error: {e}"))
        })?;
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        match timeout(wait, self.port.read(buffer)).await {
            Ok(Ok(0)) => Err(ProtocolError::io("Serial connection closed")),
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(ProtocolError::io(format!("Serial read error: {e}"))),
            // Nothing arrived in this slice
            Err(_) => Ok(0),
        }
    }

    fn discard_input(&mut self) -> Result<usize> {
        let pending = self.port.bytes_to_read().unwrap_or(0) as usize;
        self.port.clear(ClearBuffer::Input)?;
        Ok(pending)
    }
}
