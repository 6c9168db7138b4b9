//! Register transaction engine
//!
//! Executes one read, write or masked write with a bounded receive window
//! and a fixed attempt budget. Earlier failed attempts are logged at debug
//! level only; the final failure is returned (and logged once) with a
//! preview of whatever bytes did arrive.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::frame::{
    parse_response, Category, ParseStatus, RegisterAddress, Request, Response, DEVICE_ADDR,
    MAX_READ_WORDS,
};
use crate::hex;
use crate::transceiver::Transceiver;

/// Receive chunk size per poll
const RX_CHUNK: usize = 64;

/// Timing and retry parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub device: u8,
    /// Window for one complete response
    pub receive_timeout: Duration,
    /// Total attempts per transaction (at least 1)
    pub attempts: u32,
    /// Backoff unit, multiplied by the attempt number
    pub retry_backoff: Duration,
    /// Slice used when polling the port for input
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DEVICE_ADDR,
            receive_timeout: Duration::from_millis(1000),
            attempts: 3,
            retry_backoff: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Running counters, never reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    /// Transactions started
    pub requests: u64,
    /// Attempts repeated after a retryable error
    pub retries: u64,
    pub crc_errors: u64,
    pub timeouts: u64,
    /// Transactions that exhausted their attempts
    pub failures: u64,
}

impl TransactionStats {
    fn record(&mut self, err: &ProtocolError) {
        match err {
            ProtocolError::CrcMismatch { .. } => self.crc_errors += 1,
            ProtocolError::Timeout { .. } => self.timeouts += 1,
            _ => {},
        }
    }
}

/// Sole owner of the bus; transactions are strictly serialized by `&mut self`
pub struct TransactionEngine {
    transceiver: Transceiver,
    config: EngineConfig,
    stats: TransactionStats,
}

impl TransactionEngine {
    pub fn new(transceiver: Transceiver, mut config: EngineConfig) -> Self {
        config.attempts = config.attempts.max(1);
        Self {
            transceiver,
            config,
            stats: TransactionStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    /// Read `count` consecutive words
    pub async fn read(
        &mut self,
        category: Category,
        page: u8,
        index: u8,
        count: u8,
    ) -> Result<Vec<u16>> {
        self.read_at(RegisterAddress::new(category, page, index), count)
            .await
    }

    pub async fn write(&mut self, category: Category, page: u8, index: u8, value: u16) -> Result<()> {
        self.write_at(RegisterAddress::new(category, page, index), value)
            .await
    }

    /// `next = (current & and_mask) | or_mask`, applied by the controller
    pub async fn write_masked(
        &mut self,
        category: Category,
        page: u8,
        index: u8,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<()> {
        self.write_masked_at(RegisterAddress::new(category, page, index), and_mask, or_mask)
            .await
    }

    pub async fn read_at(&mut self, addr: RegisterAddress, count: u8) -> Result<Vec<u16>> {
        if count == 0 || count > MAX_READ_WORDS {
            return Err(ProtocolError::frame(format!(
                "Read count {} outside 1..={}",
                count, MAX_READ_WORDS
            )));
        }
        self.execute(Request::Read { addr, count }).await
    }

    pub async fn write_at(&mut self, addr: RegisterAddress, value: u16) -> Result<()> {
        self.execute(Request::Write { addr, value }).await?;
        Ok(())
    }

    pub async fn write_masked_at(
        &mut self,
        addr: RegisterAddress,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<()> {
        self.execute(Request::WriteMasked {
            addr,
            and_mask,
            or_mask,
        })
        .await?;
        Ok(())
    }

    /// Run one transaction through the attempt budget
    pub async fn execute(&mut self, request: Request) -> Result<Vec<u16>> {
        let frame = request.encode(self.config.device);
        let attempts = self.config.attempts;
        self.stats.requests += 1;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(&request, &frame).await {
                Ok(words) => return Ok(words),
                Err(e) => e,
            };
            self.stats.record(&err);

            if err.is_retryable() && attempt < attempts {
                self.stats.retries += 1;
                debug!(
                    "{:?} {} attempt {}/{} failed, retrying: {}",
                    request.function_code(),
                    request.address(),
                    attempt,
                    attempts,
                    err
                );
                sleep(self.config.retry_backoff * attempt).await;
                continue;
            }

            self.stats.failures += 1;
            warn!(
                "{:?} {} failed after {} attempt(s): {}",
                request.function_code(),
                request.address(),
                attempt,
                err
            );
            return Err(err);
        }
    }

    async fn attempt(&mut self, request: &Request, frame: &[u8]) -> Result<Vec<u16>> {
        self.transceiver.transmit(frame).await?;

        let deadline = Instant::now() + self.config.receive_timeout;
        let expected_fc = request.function_code() as u8;
        let mut rx = BytesMut::with_capacity(RX_CHUNK);
        let mut chunk = [0u8; RX_CHUNK];

        loop {
            // Resync on the device address
            let skip = rx
                .iter()
                .position(|b| *b == self.config.device)
                .unwrap_or(rx.len());
            if skip > 0 {
                debug!("RX: skipping {} bytes before device address", skip);
                rx.advance(skip);
            }

            if let ParseStatus::Complete { response, consumed } = parse_response(&rx)? {
                rx.advance(consumed);
                if response.function != expected_fc {
                    debug!(
                        "RX: ignoring FC={:02X} frame, waiting for FC={:02X}",
                        response.function, expected_fc
                    );
                    continue;
                }
                debug!("RX: {}B", consumed);
                return check_payload(request, &response);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout {
                    preview: hex::preview(&rx),
                });
            }
            let wait = self.config.poll_interval.min(deadline - now);
            let n = self.transceiver.receive(&mut chunk, wait).await?;
            rx.extend_from_slice(&chunk[..n]);
        }
    }
}

fn check_payload(request: &Request, response: &Response) -> Result<Vec<u16>> {
    let words = response.words()?;
    let expected = match request {
        Request::Read { count, .. } => *count as usize,
        Request::Write { .. } | Request::WriteMasked { .. } => 1,
    };
    if words.len() != expected {
        return Err(ProtocolError::frame(format!(
            "Expected {} words, got {}",
            expected,
            words.len()
        )));
    }
    Ok(words)
}
