//! In-memory controller simulator
//!
//! Answers register requests from a register map held in memory and can
//! inject bus faults. Implements `BusPort`, so it plugs in wherever the
//! serial port does.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;
use crate::frame::{self, Category, RegisterAddress, Request, DEVICE_ADDR};
use crate::model::{Channel, ChannelMode};
use crate::registers::{self, elements, packed, TempScale};
use crate::transport::BusPort;

/// Largest chunk handed out per `receive` call
const RX_CHUNK: usize = 5;

#[derive(Default)]
struct SimState {
    registers: HashMap<RegisterAddress, u16>,
    rx: VecDeque<u8>,
    log: Vec<Request>,
    corrupt_next: u32,
    swallow_next: u32,
    ignore_mode_writes: bool,
}

/// Channel fixture for seeding the simulator
#[derive(Debug, Clone)]
pub struct SimChannel {
    /// 1-based element, 0 = none
    pub primary_element: u8,
    pub all_sensors_lost: bool,
    pub air_c: f32,
    pub floor_c: f32,
    pub setpoint_c: f32,
    pub standby_setpoint_c: f32,
    pub floor_min_c: f32,
    pub floor_max_c: f32,
    pub mode: ChannelMode,
    pub child_lock: bool,
    pub heating: bool,
    /// 0..=10 battery steps
    pub battery_step: u16,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            primary_element: 1,
            all_sensors_lost: false,
            air_c: 21.0,
            floor_c: 0.0,
            setpoint_c: 21.0,
            standby_setpoint_c: 16.0,
            floor_min_c: 15.0,
            floor_max_c: 30.0,
            mode: ChannelMode::Heat,
            child_lock: false,
            heating: false,
            battery_step: 10,
        }
    }
}

/// Simulated controller; clones share the same state
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller seeded with the given channel fixtures
    pub fn with_channels(channels: &[(Channel, SimChannel)]) -> Self {
        let sim = Self::new();
        for (channel, fixture) in channels {
            sim.seed_channel(*channel, fixture);
        }
        sim
    }

    pub fn seed_channel(&self, channel: Channel, fixture: &SimChannel) {
        let scale = TempScale::default();

        let mut selector = u16::from(fixture.primary_element);
        if fixture.all_sensors_lost {
            selector |= registers::channels::PRIMARY_ELEMENT_ALL_TP_LOST_MASK;
        }
        self.set_register(registers::primary_element_addr(channel), selector);

        let status = if fixture.heating {
            registers::channels::TIMER_EVENT_OUTPUT_ON_MASK
        } else {
            0
        };
        self.set_register(registers::status_addr(channel), status);

        self.set_register(
            registers::config_addr(channel),
            registers::baseline_config(fixture.mode, fixture.child_lock),
        );
        self.set_register(
            registers::setpoint_addr(channel),
            scale.c_to_raw(fixture.setpoint_c),
        );
        self.set_register(
            registers::standby_setpoint_addr(channel),
            scale.c_to_raw(fixture.standby_setpoint_c),
        );
        self.set_words(
            registers::floor_limits_addr(channel),
            &[
                scale.c_to_raw(fixture.floor_min_c),
                scale.c_to_raw(fixture.floor_max_c),
            ],
        );

        if fixture.primary_element > 0 {
            let block = registers::element_block_addr(fixture.primary_element);
            let mut words = vec![0u16; elements::BLOCK_WORDS as usize];
            words[elements::AIR_TEMPERATURE] = scale.c_to_raw(fixture.air_c);
            words[elements::FLOOR_TEMPERATURE] = scale.c_to_raw(fixture.floor_c);
            words[elements::BATTERY_STATUS] = fixture.battery_step;
            self.set_words(block, &words);
        }
    }

    pub fn set_register(&self, addr: RegisterAddress, value: u16) {
        self.state.lock().registers.insert(addr, value);
    }

    /// Store consecutive words starting at `addr`
    pub fn set_words(&self, addr: RegisterAddress, words: &[u16]) {
        let mut state = self.state.lock();
        for (offset, word) in words.iter().enumerate() {
            state.registers.insert(addr.offset(offset as u8), *word);
        }
    }

    /// Register value, 0 when never written
    pub fn register(&self, addr: RegisterAddress) -> u16 {
        self.state
            .lock()
            .registers
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    /// Leave unsolicited bytes in the receive buffer
    pub fn inject_stale_bytes(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    pub fn pending_rx_len(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Damage the CRC of the next `count` responses
    pub fn corrupt_next_responses(&self, count: u32) {
        self.state.lock().corrupt_next = count;
    }

    /// Do not answer the next `count` requests
    pub fn swallow_next_requests(&self, count: u32) {
        self.state.lock().swallow_next = count;
    }

    /// Acknowledge configuration writes without applying them
    pub fn ignore_mode_writes(&self, ignore: bool) {
        self.state.lock().ignore_mode_writes = ignore;
    }

    /// Every well-formed request received so far
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn respond(state: &mut SimState, request: &Request) -> Vec<u8> {
        let function = request.function_code() as u8;
        let is_config = |addr: &RegisterAddress| {
            addr.category == Category::Packed && addr.index == packed::CONFIGURATION
        };

        let words = match *request {
            Request::Read { addr, count } => (0..count)
                .map(|i| {
                    state
                        .registers
                        .get(&addr.offset(i))
                        .copied()
                        .unwrap_or(0)
                })
                .collect::<Vec<_>>(),
            Request::Write { addr, value } => {
                if !(state.ignore_mode_writes && is_config(&addr)) {
                    state.registers.insert(addr, value);
                }
                vec![state.registers.get(&addr).copied().unwrap_or(0)]
            },
            Request::WriteMasked {
                addr,
                and_mask,
                or_mask,
            } => {
                let current = state.registers.get(&addr).copied().unwrap_or(0);
                if !(state.ignore_mode_writes && is_config(&addr)) {
                    state
                        .registers
                        .insert(addr, frame::apply_mask(current, and_mask, or_mask));
                }
                vec![state.registers.get(&addr).copied().unwrap_or(0)]
            },
        };

        frame::encode_response(DEVICE_ADDR, function, &words)
    }
}

#[async_trait]
impl BusPort for SimulatedController {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let request = match frame::decode_request(data) {
            Ok((DEVICE_ADDR, request)) => request,
            Ok((device, _)) => {
                debug!("SIM: request for device {} ignored", device);
                return Ok(());
            },
            Err(e) => {
                debug!("SIM: undecodable request: {}", e);
                return Ok(());
            },
        };
        state.log.push(request);

        if state.swallow_next > 0 {
            state.swallow_next -= 1;
            return Ok(());
        }

        let mut response = Self::respond(&mut state, &request);
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        state.rx.extend(response);
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        let taken = {
            let mut state = self.state.lock();
            let n = state.rx.len().min(buffer.len()).min(RX_CHUNK);
            for slot in buffer.iter_mut().take(n) {
                if let Some(byte) = state.rx.pop_front() {
                    *slot = byte;
                }
            }
            n
        };
        if taken == 0 {
            sleep(wait).await;
        }
        Ok(taken)
    }

    fn discard_input(&mut self) -> Result<usize> {
        let mut state = self.state.lock();
        let n = state.rx.len();
        state.rx.clear();
        Ok(n)
    }
}
