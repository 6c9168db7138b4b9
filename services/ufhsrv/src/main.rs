//! ufhsrv - underfloor-heating controller service
//!
//! `run` polls forever; the other subcommands perform one operation against
//! the bus and exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ahc_protocol::ChannelMode;
use ufhsrv::bootstrap;
use ufhsrv::{Config, LoggingObserver, NormalizeOptions, ZonePoller};

#[derive(Parser)]
#[command(name = "ufhsrv")]
#[command(about = "Underfloor-heating controller service (RS-485)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: config/ufhsrv.yaml if present)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the controller until Ctrl-C
    Run {
        /// Use the in-memory simulator instead of the serial port
        #[arg(long)]
        simulate: bool,
    },

    /// Refresh one channel and print it as JSON
    Read {
        /// Channel number (1-16)
        channel: u8,
    },

    /// Set the comfort setpoint
    SetSetpoint {
        channel: u8,
        /// Temperature in °C
        celsius: f32,
    },

    /// Set the standby setpoint
    SetStandby {
        channel: u8,
        /// Temperature in °C
        celsius: f32,
    },

    /// Switch a channel between heat and off
    SetMode {
        channel: u8,
        /// heat | off
        mode: ChannelMode,
    },

    /// Enable or disable the child lock
    SetLock {
        channel: u8,
        /// on | off
        #[arg(value_parser = parse_on_off, action = clap::ArgAction::Set)]
        state: bool,
    },

    /// Repair a channel's configuration word
    Normalize {
        channel: u8,

        /// Also clear child lock and program/override flags
        #[arg(long)]
        extended: bool,

        /// Overwrite the whole configuration word
        #[arg(long)]
        aggressive: bool,

        /// Normalize to standby instead of heat
        #[arg(long)]
        off: bool,
    },

    /// Print the resolved configuration as YAML
    Config,
}

fn parse_on_off(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on|off, got '{other}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    bootstrap::initialize_logging(&config, cli.log_level.as_deref(), cli.no_color)?;

    // Single-threaded: every transaction runs to completion on this thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, config: Config) -> Result<()> {
    if let Commands::Run { simulate } = command {
        let poller = if simulate {
            bootstrap::build_simulated_poller(&config).0
        } else {
            bootstrap::build_serial_poller(&config)?
        };
        return run(poller, Duration::from_millis(config.polling.interval_ms.max(1))).await;
    }

    let mut poller = bootstrap::build_serial_poller(&config)?;
    match command {
        Commands::Read { channel } => {
            let channel = bootstrap::parse_channel(channel)?;
            poller.refresh_channel_now(channel);
            poller.step().await;
            let snapshot = poller.snapshot();
            let entry = snapshot
                .channel(channel)
                .context("Channel not present after refresh")?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        },
        Commands::SetSetpoint { channel, celsius } => {
            let channel = bootstrap::parse_channel(channel)?;
            poller.write_channel_setpoint(channel, celsius).await?;
        },
        Commands::SetStandby { channel, celsius } => {
            let channel = bootstrap::parse_channel(channel)?;
            poller.write_channel_standby_setpoint(channel, celsius).await?;
        },
        Commands::SetMode { channel, mode } => {
            let channel = bootstrap::parse_channel(channel)?;
            poller.write_channel_mode(channel, mode).await?;
        },
        Commands::SetLock { channel, state } => {
            let channel = bootstrap::parse_channel(channel)?;
            poller.write_channel_child_lock(channel, state).await?;
        },
        Commands::Normalize {
            channel,
            extended,
            aggressive,
            off,
        } => {
            let channel = bootstrap::parse_channel(channel)?;
            let options = NormalizeOptions {
                extended,
                aggressive,
                to_off: off,
            };
            poller.normalize_channel(channel, options).await?;
        },
        Commands::Run { .. } | Commands::Config => {},
    }

    let stats = poller.stats();
    info!(
        "Bus: {} requests, {} retries, {} failures",
        stats.requests, stats.retries, stats.failures
    );
    Ok(())
}

async fn run(mut poller: ZonePoller, period: Duration) -> Result<()> {
    poller.register_observer(Box::new(LoggingObserver));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        "Polling {} channels every {:?}",
        poller.settings().active_channels.len(),
        period
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = poller.step().await;
                if report.budget_exhausted {
                    warn!("Transaction budget exhausted ({} used)", report.transactions);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let stats = poller.stats();
    info!(
        "Bus totals: {} requests, {} retries, {} CRC errors, {} timeouts, {} failures",
        stats.requests, stats.retries, stats.crc_errors, stats.timeouts, stats.failures
    );
    Ok(())
}
