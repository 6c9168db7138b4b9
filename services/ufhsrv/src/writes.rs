//! Write operations and the fallback ladder
//!
//! Every write runs the same ladder until one rung succeeds:
//! strict write of the whole word, masked write of the owned bits, then
//! read-modify-write. Channels listed in `strict_mode_channels` stop after
//! the strict write for mode changes. A successful write queues an urgent
//! refresh and opens the guard window; the cache itself only changes when
//! that refresh reads the register back.
//!
//! Every outcome is logged. The returned `Result` is for callers that want
//! it (the CLI); others may ignore it and rely on the cache, which stays the
//! source of truth.

use tracing::{debug, info, warn};

use ahc_protocol::registers::{self, packed};
use ahc_protocol::{Channel, ChannelMode, RegisterAddress};

use crate::error::{Result, UfhSrvError};
use crate::scheduler::{Budget, DesiredMode, UrgentEntry, ZonePoller};

/// Options for the configuration repair action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Also clear child lock and the program/override flags
    pub extended: bool,
    /// Overwrite the whole configuration word instead of masking
    pub aggressive: bool,
    /// Target STANDBY instead of MANUAL
    pub to_off: bool,
}

/// The bits of one register a write owns
#[derive(Debug, Clone, Copy)]
struct FieldWrite {
    addr: RegisterAddress,
    mask: u16,
    /// New bits, within `mask`
    value: u16,
    /// Whole word for the strict rung
    baseline: u16,
}

impl ZonePoller {
    /// Comfort setpoint in °C. Failure is logged; the result may be ignored.
    pub async fn write_channel_setpoint(&mut self, channel: Channel, celsius: f32) -> Result<()> {
        let addr = registers::setpoint_addr(channel);
        self.write_temperature(channel, "setpoint", addr, celsius)
            .await
    }

    /// Standby setpoint in °C. Failure is logged; the result may be ignored.
    pub async fn write_channel_standby_setpoint(
        &mut self,
        channel: Channel,
        celsius: f32,
    ) -> Result<()> {
        let addr = registers::standby_setpoint_addr(channel);
        self.write_temperature(channel, "standby setpoint", addr, celsius)
            .await
    }

    /// Write every valid member; returns how many writes succeeded
    pub async fn write_group_setpoint(&mut self, members: &[u8], celsius: f32) -> usize {
        let mut written = 0;
        for number in members {
            let channel = match Channel::new(*number) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Group setpoint: skipping member: {}", e);
                    continue;
                },
            };
            if self.write_channel_setpoint(channel, celsius).await.is_ok() {
                written += 1;
            }
        }
        written
    }

    /// Records the mode for reconciliation on success. Failure is logged;
    /// the result may be ignored.
    pub async fn write_channel_mode(&mut self, channel: Channel, mode: ChannelMode) -> Result<()> {
        let label = self.cache.label(channel);
        if !self.settings.allow_mode_writes {
            warn!("{}: mode write to {} rejected, mode writes disabled", label, mode);
            return Err(UfhSrvError::rejected("mode writes disabled"));
        }

        match self
            .write_mode_ladder(channel, mode, &mut Budget::unlimited())
            .await
        {
            Ok(()) => {
                info!("{}: mode -> {}", label, mode);
                self.desired_modes.insert(
                    channel,
                    DesiredMode {
                        mode,
                        corrections: 0,
                    },
                );
                self.after_write(channel);
                Ok(())
            },
            Err(e) => {
                warn!("{}: mode write failed: {}", label, e);
                Err(e)
            },
        }
    }

    /// Failure is logged; the result may be ignored.
    pub async fn write_channel_child_lock(&mut self, channel: Channel, locked: bool) -> Result<()> {
        let label = self.cache.label(channel);
        let lock_bits = if locked {
            packed::CONFIGURATION_CHILD_LOCK_MASK
        } else {
            0
        };
        let state = self.cache.get(channel);
        let baseline = match state.and_then(|s| s.config_word) {
            Some(word) => (word & !packed::CONFIGURATION_CHILD_LOCK_MASK) | lock_bits,
            None => registers::baseline_config(state.map(|s| s.mode).unwrap_or_default(), locked),
        };
        let field = FieldWrite {
            addr: registers::config_addr(channel),
            mask: packed::CONFIGURATION_CHILD_LOCK_MASK,
            value: lock_bits,
            baseline,
        };

        match self
            .write_field(channel, "child lock", field, false, &mut Budget::unlimited())
            .await
        {
            Ok(()) => {
                info!("{}: child lock -> {}", label, locked);
                self.after_write(channel);
                Ok(())
            },
            Err(e) => {
                warn!("{}: child lock write failed: {}", label, e);
                Err(e)
            },
        }
    }

    /// Repair a channel's configuration word
    pub async fn normalize_channel(
        &mut self,
        channel: Channel,
        options: NormalizeOptions,
    ) -> Result<()> {
        let label = self.cache.label(channel);
        if !self.settings.allow_mode_writes {
            warn!("{}: normalize rejected, mode writes disabled", label);
            return Err(UfhSrvError::rejected("mode writes disabled"));
        }

        let mode = if options.to_off {
            ChannelMode::Off
        } else {
            ChannelMode::Heat
        };
        let addr = registers::config_addr(channel);

        let result = if options.aggressive {
            let keep_lock = !options.extended
                && self.cache.get(channel).is_some_and(|s| s.child_lock);
            let word = registers::baseline_config(mode, keep_lock);
            debug!("{}: normalize strict write {:04X}", label, word);
            self.engine.write_at(addr, word).await
        } else {
            let mut cleared = packed::CONFIGURATION_MODE_MASK;
            if options.extended {
                cleared |= packed::CONFIGURATION_CHILD_LOCK_MASK
                    | packed::CONFIGURATION_OVERRIDE_FLAGS_MASK;
            }
            self.engine
                .write_masked_at(addr, !cleared, registers::encode_mode(mode))
                .await
        };

        match result {
            Ok(()) => {
                info!("{}: normalized to {} ({:?})", label, mode, options);
                self.desired_modes.insert(
                    channel,
                    DesiredMode {
                        mode,
                        corrections: 0,
                    },
                );
                self.after_write(channel);
                Ok(())
            },
            Err(e) => {
                warn!("{}: normalize failed: {}", label, e);
                Err(e.into())
            },
        }
    }

    /// Mode ladder, shared with reconciliation
    pub(crate) async fn write_mode_ladder(
        &mut self,
        channel: Channel,
        mode: ChannelMode,
        budget: &mut Budget,
    ) -> Result<()> {
        let bits = registers::encode_mode(mode);
        let state = self.cache.get(channel);
        let baseline = match state.and_then(|s| s.config_word) {
            Some(word) => (word & !packed::CONFIGURATION_MODE_MASK) | bits,
            None => registers::baseline_config(mode, state.is_some_and(|s| s.child_lock)),
        };
        let field = FieldWrite {
            addr: registers::config_addr(channel),
            mask: packed::CONFIGURATION_MODE_MASK,
            value: bits,
            baseline,
        };
        let strict = self.settings.strict_mode_channels.contains(&channel);

        self.write_field(channel, "mode", field, strict, budget)
            .await
    }

    async fn write_temperature(
        &mut self,
        channel: Channel,
        what: &str,
        addr: RegisterAddress,
        celsius: f32,
    ) -> Result<()> {
        let label = self.cache.label(channel);
        if !celsius.is_finite() {
            return Err(UfhSrvError::validation(format!(
                "{what} must be a finite temperature"
            )));
        }

        let raw = self.settings.temp_scale.c_to_raw(celsius);
        let field = FieldWrite {
            addr,
            mask: 0xFFFF,
            value: raw,
            baseline: raw,
        };
        match self
            .write_field(channel, what, field, false, &mut Budget::unlimited())
            .await
        {
            Ok(()) => {
                info!("{}: {} -> {:.1}°C", label, what, celsius);
                self.after_write(channel);
                Ok(())
            },
            Err(e) => {
                warn!("{}: {} write failed: {}", label, what, e);
                Err(e)
            },
        }
    }

    /// Strict write → masked write → read-modify-write
    async fn write_field(
        &mut self,
        channel: Channel,
        what: &str,
        field: FieldWrite,
        strict_only: bool,
        budget: &mut Budget,
    ) -> Result<()> {
        let label = self.cache.label(channel);

        if !budget.try_take() {
            return Err(UfhSrvError::BudgetExhausted);
        }
        let strict_err = match self.engine.write_at(field.addr, field.baseline).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if strict_only {
            return Err(strict_err.into());
        }
        debug!("{}: strict {} write failed, trying masked: {}", label, what, strict_err);

        if !budget.try_take() {
            return Err(UfhSrvError::BudgetExhausted);
        }
        let masked_err = match self
            .engine
            .write_masked_at(field.addr, !field.mask, field.value & field.mask)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if field.mask == 0xFFFF {
            // Whole-word field, read-modify-write adds nothing
            return Err(masked_err.into());
        }
        debug!(
            "{}: masked {} write failed, trying read-modify-write: {}",
            label, what, masked_err
        );

        if !budget.try_take() {
            return Err(UfhSrvError::BudgetExhausted);
        }
        let current = self.engine.read_at(field.addr, 1).await?[0];
        if !budget.try_take() {
            return Err(UfhSrvError::BudgetExhausted);
        }
        let next = (current & !field.mask) | (field.value & field.mask);
        self.engine.write_at(field.addr, next).await?;
        Ok(())
    }

    fn after_write(&mut self, channel: Channel) {
        self.urgent.push_back(UrgentEntry::new(channel));
        self.suspend_background();
    }
}
