//! Underfloor-heating controller register protocol
//!
//! Protocol engine for a 16-channel heating controller on a half-duplex
//! RS-485 bus:
//! - `frame` - request/response framing and CRC16
//! - `transceiver` - transmit-enable gating and bus timing
//! - `engine` - read / write / masked-write transactions with retry
//! - `registers` - register layout and raw word ↔ domain decoding
//! - `simulator` - in-memory controller for tests and dry runs
//!
//! # Architecture
//!
//! Only `TransactionEngine` drives the bus. It talks to a `BusPort`
//! (serial port or simulator) through a `Transceiver`, so every
//! transaction leaves the line in receive mode.

pub mod engine;
pub mod error;
pub mod frame;
pub mod hex;
pub mod line;
pub mod model;
pub mod registers;
pub mod simulator;
pub mod transceiver;
pub mod transport;

// Re-export commonly used types at crate root
pub use engine::{EngineConfig, TransactionEngine, TransactionStats};
pub use error::{ProtocolError, Result};
pub use frame::{Category, FunctionCode, RegisterAddress, Request};
pub use line::{RecordingLine, SignalLine, SysfsGpioLine};
pub use model::{Channel, ChannelAction, ChannelMode, ChannelState, FloorLimits, CHANNEL_COUNT};
pub use registers::TempScale;
pub use simulator::{SimChannel, SimulatedController};
pub use transceiver::{BusTiming, HardwareProfile, Transceiver};
pub use transport::{BusPort, SerialBusPort, SerialParams};
