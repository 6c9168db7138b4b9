//! Service assembly
//!
//! Builds the bus stack (serial port or simulator, transceiver lines,
//! transaction engine) and the poller from a validated `Config`.

use tracing::{info, warn};

use ahc_protocol::{
    BusPort, BusTiming, Channel, SerialBusPort, SimChannel, SimulatedController, SysfsGpioLine,
    Transceiver, TransactionEngine,
};

use crate::config::Config;
use crate::error::Result;
use crate::logging::{self, LogConfig};
use crate::scheduler::{PollerSettings, ZonePoller};

/// Initialize logging from the config, with CLI overrides
pub fn initialize_logging(config: &Config, level: Option<&str>, no_color: bool) -> Result<()> {
    logging::init_with_config(LogConfig {
        level: level.unwrap_or(&config.logging.level).to_string(),
        log_dir: config.logging.dir.as_ref().map(Into::into),
        enable_json: config.logging.json,
        ansi: !no_color,
    })
}

/// Poller on the configured serial port
pub fn build_serial_poller(config: &Config) -> Result<ZonePoller> {
    let params = config.serial_params();
    let port = SerialBusPort::open(&params)?;
    let timing = BusTiming::derive(config.serial.baud_rate, config.bus.hardware_profile)?;
    info!(
        "Bus timing: char={}us settle={}us guard={}us ({:?})",
        timing.char_time.as_micros(),
        timing.pre_tx_settle.as_micros(),
        timing.post_tx_guard.as_micros(),
        config.bus.hardware_profile
    );

    let mut transceiver = Transceiver::new(Box::new(port), timing)
        .with_flush_stale_input(config.bus.flush_stale_input);
    if let Some(gpio) = config.bus.tx_enable_gpio {
        let line = SysfsGpioLine::open(&config.bus.gpio_base_path, gpio, false)?;
        transceiver = transceiver.with_tx_enable(Box::new(line));
    }
    if let Some(gpio) = config.bus.flow_control_gpio {
        let line = SysfsGpioLine::open(&config.bus.gpio_base_path, gpio, false)?;
        transceiver = transceiver.with_flow_control(Box::new(line));
    }

    Ok(build_poller(config, transceiver))
}

/// Poller on an in-memory controller seeded with plausible values
pub fn build_simulated_poller(config: &Config) -> (ZonePoller, SimulatedController) {
    let sim = demo_controller(config);
    warn!("Running against the in-memory simulator, no serial I/O");
    let port: Box<dyn BusPort> = Box::new(sim.clone());
    let transceiver = Transceiver::new(port, BusTiming::immediate());
    (build_poller(config, transceiver), sim)
}

fn build_poller(config: &Config, transceiver: Transceiver) -> ZonePoller {
    let engine = TransactionEngine::new(transceiver, config.engine_config());
    ZonePoller::new(
        engine,
        PollerSettings::from_config(config),
        config.friendly_names(),
    )
}

/// One element per channel, temperatures spread across the house
fn demo_controller(config: &Config) -> SimulatedController {
    let sim = SimulatedController::new();
    for channel in config.active_channels() {
        let n = channel.number();
        sim.seed_channel(
            channel,
            &SimChannel {
                primary_element: n,
                air_c: 19.0 + f32::from(n % 5) * 0.5,
                floor_c: if n % 3 == 0 { 24.5 } else { 0.0 },
                setpoint_c: 21.0,
                heating: n % 2 == 0,
                ..Default::default()
            },
        );
    }
    sim
}

/// Convenience for CLI commands taking a raw channel number
pub fn parse_channel(number: u8) -> Result<Channel> {
    Ok(Channel::new(number)?)
}
