//! Polling scheduler
//!
//! `ZonePoller::step` is invoked periodically by the host. Each invocation:
//!
//! 1. Returns early (no bus I/O) while a post-write guard window is open.
//! 2. Drains the urgent queue, up to `channels_per_cycle` channels, running
//!    the compact refresh sequence and mode reconciliation for each.
//! 3. Spends the remaining channel slots on round-robin background polling,
//!    `steps_per_visit` steps per channel.
//! 4. Stops early when the transaction budget runs out, pushing an
//!    interrupted urgent channel back to the front of the queue. A pending
//!    mode correction is part of the urgent sequence, so it resumes there.
//!    Every correction attempt counts toward the give-up limit, sent or not.
//! 5. Publishes the cache to every observer exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use ahc_protocol::registers::{self, elements, packed};
use ahc_protocol::{
    Channel, ChannelAction, ChannelMode, FloorLimits, RegisterAddress, TempScale,
    TransactionEngine, TransactionStats,
};

use crate::cache::{CacheSnapshot, ChannelCache};
use crate::config::Config;
use crate::error::UfhSrvError;
use crate::observer::ChannelObserver;

/// Background read sequence, one step per state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PollStep {
    PrimaryElement,
    Configuration,
    Setpoints,
    FloorAndAction,
    ElementBlock,
}

impl PollStep {
    pub const COUNT: u8 = 5;

    pub fn from_index(index: u8) -> Self {
        match index % Self::COUNT {
            0 => PollStep::PrimaryElement,
            1 => PollStep::Configuration,
            2 => PollStep::Setpoints,
            3 => PollStep::FloorAndAction,
            _ => PollStep::ElementBlock,
        }
    }
}

/// Compact refresh run for urgent channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrgentStep {
    Configuration,
    Setpoints,
    FloorLimits,
    Action,
    ElementBlock,
    /// Compare against the desired mode, correct on drift
    ModeReconcile,
}

impl UrgentStep {
    const SEQUENCE: [UrgentStep; 6] = [
        UrgentStep::Configuration,
        UrgentStep::Setpoints,
        UrgentStep::FloorLimits,
        UrgentStep::Action,
        UrgentStep::ElementBlock,
        UrgentStep::ModeReconcile,
    ];
}

/// Queued urgent refresh with its progress through the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrgentEntry {
    pub channel: Channel,
    /// Index of the next `UrgentStep` to run
    pub next_step: usize,
}

impl UrgentEntry {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            next_step: 0,
        }
    }
}

/// Per-invocation transaction allowance
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// 0 = unlimited
    limit: u32,
    used: u32,
}

impl Budget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserve one transaction; `false` once the limit is reached
    pub fn try_take(&mut self) -> bool {
        if self.limit != 0 && self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Outcome of one budgeted read
pub(crate) enum Fetch {
    Words(Vec<u16>),
    /// Transaction failed; the field stays stale
    Failed,
    /// No budget left, nothing sent
    Exhausted,
}

/// Pending mode correction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DesiredMode {
    pub mode: ChannelMode,
    pub corrections: u32,
}

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub channels_per_cycle: usize,
    /// 0 = unlimited
    pub max_transactions_per_cycle: u32,
    pub steps_per_visit: u8,
    pub write_guard: Duration,
    pub active_channels: Vec<Channel>,
    pub allow_mode_writes: bool,
    pub strict_mode_channels: HashSet<Channel>,
    pub max_mode_reconcile_attempts: u32,
    pub temp_scale: TempScale,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            channels_per_cycle: 2,
            max_transactions_per_cycle: 0,
            steps_per_visit: 2,
            write_guard: Duration::from_millis(1500),
            active_channels: Vec::new(),
            allow_mode_writes: true,
            strict_mode_channels: HashSet::new(),
            max_mode_reconcile_attempts: 3,
            temp_scale: TempScale::default(),
        }
    }
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channels_per_cycle: config.channels_per_cycle(),
            max_transactions_per_cycle: config.polling.max_transactions_per_cycle,
            steps_per_visit: config.steps_per_visit(),
            write_guard: Duration::from_millis(config.polling.write_guard_ms),
            active_channels: config.active_channels(),
            allow_mode_writes: config.writes.allow_mode_writes,
            strict_mode_channels: config.strict_mode_channels(),
            max_mode_reconcile_attempts: config.writes.max_mode_reconcile_attempts,
            temp_scale: config.temp_scale(),
        }
    }
}

/// What one invocation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Guard window open, no bus I/O
    pub suspended: bool,
    pub urgent_completed: usize,
    pub background_steps: usize,
    pub transactions: u32,
    pub budget_exhausted: bool,
}

/// Polling scheduler and owner of the channel cache
pub struct ZonePoller {
    pub(crate) engine: TransactionEngine,
    pub(crate) settings: PollerSettings,
    pub(crate) cache: ChannelCache,
    pub(crate) urgent: VecDeque<UrgentEntry>,
    pub(crate) desired_modes: HashMap<Channel, DesiredMode>,
    pub(crate) suspend_until: Option<Instant>,
    /// Next step per channel, 0..5
    step_state: HashMap<Channel, u8>,
    /// Round-robin position in the active set
    cursor: usize,
    observers: Vec<Box<dyn ChannelObserver>>,
}

impl ZonePoller {
    pub fn new(
        engine: TransactionEngine,
        mut settings: PollerSettings,
        names: HashMap<Channel, String>,
    ) -> Self {
        if settings.active_channels.is_empty() {
            settings.active_channels = Channel::all().collect();
        }
        settings.channels_per_cycle = settings.channels_per_cycle.max(1);
        settings.steps_per_visit = settings.steps_per_visit.clamp(1, PollStep::COUNT);

        Self {
            engine,
            settings,
            cache: ChannelCache::new(names),
            urgent: VecDeque::new(),
            desired_modes: HashMap::new(),
            suspend_until: None,
            step_state: HashMap::new(),
            cursor: 0,
            observers: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observers.push(observer);
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn stats(&self) -> TransactionStats {
        self.engine.stats()
    }

    /// Channels waiting for an urgent refresh, front first
    pub fn urgent_queue(&self) -> Vec<UrgentEntry> {
        self.urgent.iter().copied().collect()
    }

    /// Next background step of `channel`
    pub fn next_step(&self, channel: Channel) -> PollStep {
        PollStep::from_index(self.step_state.get(&channel).copied().unwrap_or(0))
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_until.is_some_and(|until| Instant::now() < until)
    }

    /// Queue an out-of-band refresh; duplicates are kept
    pub fn refresh_channel_now(&mut self, channel: Channel) {
        debug!("{} queued for urgent refresh", self.cache.label(channel));
        self.urgent.push_back(UrgentEntry::new(channel));
    }

    /// Open the post-write guard window
    pub(crate) fn suspend_background(&mut self) {
        if !self.settings.write_guard.is_zero() {
            self.suspend_until = Some(Instant::now() + self.settings.write_guard);
        }
    }

    /// One scheduler invocation
    pub async fn step(&mut self) -> StepReport {
        let mut budget = Budget::new(self.settings.max_transactions_per_cycle);
        let mut report = StepReport::default();

        self.poll(&mut budget, &mut report).await;
        report.transactions = budget.used();

        self.publish();
        report
    }

    async fn poll(&mut self, budget: &mut Budget, report: &mut StepReport) {
        if self.is_suspended() {
            report.suspended = true;
            return;
        }
        self.suspend_until = None;

        // Urgent channels first
        while report.urgent_completed < self.settings.channels_per_cycle {
            let Some(entry) = self.urgent.pop_front() else {
                break;
            };
            if let Some(requeue) = self.service_urgent(entry, budget).await {
                debug!(
                    "{} urgent refresh interrupted at step {}, requeued",
                    self.cache.label(requeue.channel),
                    requeue.next_step
                );
                self.urgent.push_front(requeue);
                report.budget_exhausted = true;
                return;
            }
            report.urgent_completed += 1;

            // A corrective write reopened the guard window
            if self.is_suspended() {
                return;
            }
        }

        // Round-robin background polling with the remaining slots
        let active = self.settings.active_channels.clone();
        let slots = self
            .settings
            .channels_per_cycle
            .saturating_sub(report.urgent_completed);

        for _ in 0..slots {
            let channel = active[self.cursor % active.len()];
            self.cursor = (self.cursor + 1) % active.len();

            for _ in 0..self.settings.steps_per_visit {
                if !self.run_poll_step(channel, budget).await {
                    report.budget_exhausted = true;
                    return;
                }
                report.background_steps += 1;
            }
        }
    }

    /// Run the remaining urgent sequence; returns the entry to requeue when
    /// the budget runs out
    async fn service_urgent(
        &mut self,
        mut entry: UrgentEntry,
        budget: &mut Budget,
    ) -> Option<UrgentEntry> {
        while let Some(step) = UrgentStep::SEQUENCE.get(entry.next_step).copied() {
            let channel = entry.channel;
            let completed = match step {
                UrgentStep::Configuration => self.refresh_configuration(channel, budget).await,
                UrgentStep::Setpoints => self.refresh_setpoints(channel, budget).await,
                UrgentStep::FloorLimits => self.refresh_floor_limits(channel, budget).await,
                UrgentStep::Action => self.refresh_action(channel, budget).await,
                UrgentStep::ElementBlock => {
                    let primary_known = self
                        .cache
                        .get(channel)
                        .is_some_and(|s| s.primary_element != 0);
                    if !primary_known && !self.refresh_primary_element(channel, budget).await {
                        false
                    } else {
                        self.refresh_element_block(channel, budget).await
                    }
                },
                UrgentStep::ModeReconcile => self.reconcile_mode(channel, budget).await,
            };
            if !completed {
                return Some(entry);
            }
            entry.next_step += 1;
        }
        None
    }

    /// Returns `false` if the budget ran out before the step finished
    async fn run_poll_step(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let step = self.next_step(channel);
        let completed = match step {
            PollStep::PrimaryElement => self.refresh_primary_element(channel, budget).await,
            PollStep::Configuration => self.refresh_configuration(channel, budget).await,
            PollStep::Setpoints => self.refresh_setpoints(channel, budget).await,
            PollStep::FloorAndAction => {
                self.refresh_floor_limits(channel, budget).await
                    && self.refresh_action(channel, budget).await
            },
            PollStep::ElementBlock => self.refresh_element_block(channel, budget).await,
        };

        if completed {
            let next = (step as u8 + 1) % PollStep::COUNT;
            self.step_state.insert(channel, next);
        }
        completed
    }

    // ========================================================================
    // Field refreshes
    // ========================================================================

    pub(crate) async fn fetch(
        &mut self,
        budget: &mut Budget,
        channel: Channel,
        field: &str,
        addr: RegisterAddress,
        count: u8,
    ) -> Fetch {
        if !budget.try_take() {
            return Fetch::Exhausted;
        }
        match self.engine.read_at(addr, count).await {
            Ok(words) => Fetch::Words(words),
            Err(e) => {
                debug!("{} {} kept stale: {}", self.cache.label(channel), field, e);
                Fetch::Failed
            },
        }
    }

    async fn refresh_primary_element(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let addr = registers::primary_element_addr(channel);
        let words = match self.fetch(budget, channel, "primary element", addr, 1).await {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let selector = registers::decode_primary_element(words[0]);
        self.cache.update(channel, |s| {
            s.primary_element = selector.index;
            s.all_sensors_lost = selector.all_sensors_lost;
            if !selector.is_usable() {
                s.current_temp_c = None;
            }
        });
        if selector.all_sensors_lost {
            warn!("{}: all temperature probes lost", self.cache.label(channel));
        }
        true
    }

    pub(crate) async fn refresh_configuration(
        &mut self,
        channel: Channel,
        budget: &mut Budget,
    ) -> bool {
        let addr = registers::config_addr(channel);
        let words = match self.fetch(budget, channel, "configuration", addr, 1).await {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let config = words[0];
        self.cache.update(channel, |s| {
            s.config_word = Some(config);
            s.mode = registers::decode_mode(config);
            s.child_lock = registers::decode_child_lock(config);
        });
        true
    }

    async fn refresh_setpoints(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let addr = registers::setpoint_addr(channel);
        let count = packed::SETPOINT_BLOCK_WORDS;
        let words = match self.fetch(budget, channel, "setpoints", addr, count).await {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let scale = self.settings.temp_scale;
        let standby_offset = (packed::STANDBY_TEMPERATURE - packed::MANUAL_TEMPERATURE) as usize;
        self.cache.update(channel, |s| {
            s.setpoint_c = words.first().map(|raw| scale.raw_to_c(*raw));
            s.standby_setpoint_c = words.get(standby_offset).map(|raw| scale.raw_to_c(*raw));
        });
        true
    }

    async fn refresh_floor_limits(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let addr = registers::floor_limits_addr(channel);
        let words = match self.fetch(budget, channel, "floor limits", addr, 2).await {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let limits = registers::decode_floor_limits(&words, self.settings.temp_scale);
        self.cache.update(channel, |s| s.floor_limits = limits);
        true
    }

    async fn refresh_action(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let addr = registers::status_addr(channel);
        let words = match self.fetch(budget, channel, "status", addr, 1).await {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let action = registers::decode_action(words[0]);
        self.cache.update(channel, |s| s.action = action);
        true
    }

    async fn refresh_element_block(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let (element, usable) = match self.cache.get(channel) {
            Some(s) => (s.primary_element, s.primary_element != 0 && !s.all_sensors_lost),
            None => (0, false),
        };
        if !usable {
            // Nothing trustworthy to read
            self.cache.update(channel, |s| s.current_temp_c = None);
            return true;
        }

        let addr = registers::element_block_addr(element);
        let words = match self
            .fetch(budget, channel, "element block", addr, elements::BLOCK_WORDS)
            .await
        {
            Fetch::Exhausted => return false,
            Fetch::Failed => return true,
            Fetch::Words(words) => words,
        };

        let reading = registers::decode_element_block(&words, self.settings.temp_scale);
        self.cache.update(channel, |s| {
            s.current_temp_c = reading.air_c;
            s.floor_temp_c = reading.floor_c;
            s.has_floor_sensor = reading.has_floor_sensor;
            s.battery_pct = reading.battery_pct;
        });
        true
    }

    // ========================================================================
    // Mode reconciliation
    // ========================================================================

    /// Returns `false` if the correction ran out of budget
    async fn reconcile_mode(&mut self, channel: Channel, budget: &mut Budget) -> bool {
        let Some(desired) = self.desired_modes.get(&channel).copied() else {
            return true;
        };
        let actual = self.cache.get(channel).map(|s| s.mode);
        let label = self.cache.label(channel);

        if actual == Some(desired.mode) {
            info!("{}: mode {} confirmed", label, desired.mode);
            self.desired_modes.remove(&channel);
            return true;
        }

        if desired.corrections >= self.settings.max_mode_reconcile_attempts {
            warn!(
                "{}: mode {} not applied after {} corrections, giving up",
                label, desired.mode, desired.corrections
            );
            self.desired_modes.remove(&channel);
            return true;
        }

        if let Some(entry) = self.desired_modes.get_mut(&channel) {
            entry.corrections += 1;
        }
        warn!(
            "{}: mode drift (want {}, read {:?}), correction {}/{}",
            label,
            desired.mode,
            actual,
            desired.corrections + 1,
            self.settings.max_mode_reconcile_attempts
        );
        match self.write_mode_ladder(channel, desired.mode, budget).await {
            Ok(()) => {},
            Err(UfhSrvError::BudgetExhausted) => {
                debug!("{}: correction out of budget, resuming next cycle", label);
                return false;
            },
            Err(e) => warn!("{}: correction failed: {}", label, e),
        }
        self.urgent.push_back(UrgentEntry::new(channel));
        self.suspend_background();
        true
    }

    // ========================================================================
    // Publication and accessors
    // ========================================================================

    fn publish(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.cache.snapshot();
        for observer in &mut self.observers {
            observer.on_update(&snapshot);
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    pub fn channel_label(&self, channel: Channel) -> String {
        self.cache.label(channel)
    }

    pub fn get_channel_current_temp(&self, channel: Channel) -> Option<f32> {
        let state = self.cache.get(channel)?;
        if state.temperature_unavailable() {
            return None;
        }
        state.current_temp_c
    }

    pub fn get_channel_setpoint(&self, channel: Channel) -> Option<f32> {
        self.cache.get(channel)?.setpoint_c
    }

    pub fn get_channel_standby_setpoint(&self, channel: Channel) -> Option<f32> {
        self.cache.get(channel)?.standby_setpoint_c
    }

    pub fn get_channel_mode(&self, channel: Channel) -> Option<ChannelMode> {
        self.cache.get(channel).map(|s| s.mode)
    }

    pub fn get_channel_action(&self, channel: Channel) -> Option<ChannelAction> {
        self.cache.get(channel).map(|s| s.action)
    }

    pub fn get_channel_floor_limits(&self, channel: Channel) -> Option<FloorLimits> {
        self.cache.get(channel).map(|s| s.floor_limits)
    }

    pub fn get_channel_floor_temp(&self, channel: Channel) -> Option<f32> {
        self.cache.get(channel)?.floor_temp_c
    }

    pub fn get_channel_battery(&self, channel: Channel) -> Option<u8> {
        self.cache.get(channel)?.battery_pct
    }

    pub fn get_channel_child_lock(&self, channel: Channel) -> Option<bool> {
        self.cache.get(channel).map(|s| s.child_lock)
    }

    /// Mean of the known temperatures of valid members
    pub fn get_group_current_temp(&self, members: &[u8]) -> Option<f32> {
        let temps: Vec<f32> = members
            .iter()
            .filter_map(|n| Channel::new(*n).ok())
            .filter_map(|ch| self.get_channel_current_temp(ch))
            .collect();
        if temps.is_empty() {
            None
        } else {
            Some(temps.iter().sum::<f32>() / temps.len() as f32)
        }
    }
}
