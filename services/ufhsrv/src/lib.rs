//! Underfloor-heating polling service
//!
//! Keeps a per-channel cache of a 16-channel heating controller fresh over
//! a shared RS-485 bus and routes caller writes through a fallback ladder.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod observer;
pub mod scheduler;
pub mod writes;

pub use cache::{CacheSnapshot, ChannelCache, ChannelSnapshot};
pub use config::Config;
pub use error::{Result, UfhSrvError};
pub use observer::{ChannelObserver, LoggingObserver};
pub use scheduler::{Budget, PollStep, PollerSettings, StepReport, UrgentEntry, ZonePoller};
pub use writes::NormalizeOptions;
