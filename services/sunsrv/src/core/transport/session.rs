//! Modbus session over a shared transport
//!
//! Owns the single connection to the Modbus host and turns register range
//! reads into retried, chunked FC03 exchanges. The DataManager keeps residue
//! from the previous unit's response in its buffer, so the session always
//! reconnects before the first read for a unit different from the last one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::traits::{Transport, TransportStats};
use crate::error::{Result, SunSrvError};
use crate::protocols::modbus::constants::MODBUS_MAX_READ_REGISTERS;

/// Session retry and pacing settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Total attempts per chunk, at least one
    pub retry_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Largest single request; longer ranges are split
    pub max_registers_per_read: u16,
    /// Pause after dropping the socket on a unit switch
    pub unit_switch_pause: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 2,
            retry_delay: Duration::from_millis(100),
            max_registers_per_read: MODBUS_MAX_READ_REGISTERS,
            unit_switch_pause: Duration::from_millis(100),
        }
    }
}

/// Shared Modbus session
#[derive(Debug)]
pub struct ModbusSession {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    last_unit_id: Option<u8>,
    connected: Arc<AtomicBool>,
    stats: TransportStats,
}

impl ModbusSession {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            last_unit_id: None,
            connected: Arc::new(AtomicBool::new(false)),
            stats: TransportStats::new(),
        }
    }

    /// Read-only connection flag for status reporting without taking the session lock
    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn sync_flag(&self) {
        self.connected
            .store(self.transport.is_connected(), Ordering::Relaxed);
    }

    /// Establish the session
    pub async fn connect(&mut self) -> Result<()> {
        self.stats.record_connection_attempt();
        let result = self.transport.connect().await;
        self.last_unit_id = None;
        match result {
            Ok(()) => {
                self.stats.record_successful_connection();
                self.sync_flag();
                Ok(())
            },
            Err(e) => {
                self.stats.record_failed_connection(&e.to_string());
                self.sync_flag();
                Err(SunSrvError::connection(e.to_string()))
            },
        }
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect reported: {e}");
        }
        self.last_unit_id = None;
        self.sync_flag();
    }

    /// Tear down and re-establish the session
    pub async fn force_reconnect(&mut self) -> Result<()> {
        self.stats.forced_reconnects += 1;
        self.disconnect().await;
        self.connect().await
    }

    /// Read `count` registers starting at the 1-based SunSpec register `start`
    pub async fn read_block(&mut self, unit_id: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        if count == 0 || start == 0 {
            return Err(SunSrvError::read(unit_id, start, count, "empty register range"));
        }
        if start.checked_add(count - 1).is_none() {
            return Err(SunSrvError::read(unit_id, start, count, "range past register 65535"));
        }

        if let Some(previous) = self.last_unit_id {
            if previous != unit_id && self.transport.is_connected() {
                debug!(unit_id, previous, "Unit changed, reconnecting to flush device buffer");
                self.stats.forced_reconnects += 1;
                self.disconnect().await;
                if !self.config.unit_switch_pause.is_zero() {
                    tokio::time::sleep(self.config.unit_switch_pause).await;
                }
            }
        }

        let max = self
            .config
            .max_registers_per_read
            .clamp(1, MODBUS_MAX_READ_REGISTERS);
        let mut registers = Vec::with_capacity(count as usize);
        let mut offset = 0u16;
        while offset < count {
            let chunk = (count - offset).min(max);
            let values = self.read_chunk(unit_id, start + offset, chunk).await?;
            registers.extend(values);
            offset += chunk;
        }

        Ok(registers)
    }

    async fn read_chunk(&mut self, unit_id: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = String::new();
        let mut connect_failed = false;

        for attempt in 1..=attempts {
            if attempt > 1 && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            if !self.transport.is_connected() {
                if let Err(e) = self.connect().await {
                    last_error = e.to_string();
                    connect_failed = true;
                    continue;
                }
                info!(unit_id, "Modbus session re-established");
            }
            connect_failed = false;

            // The request reaches the device buffer whether or not it succeeds
            self.last_unit_id = Some(unit_id);
            match self
                .transport
                .read_holding_registers(unit_id, start - 1, count)
                .await
            {
                Ok(values) if values.len() == count as usize => {
                    self.stats.record_read(true);
                    self.sync_flag();
                    return Ok(values);
                },
                Ok(values) => {
                    last_error = format!("short read: {} of {} registers", values.len(), count);
                },
                Err(e) => {
                    debug!(unit_id, start, count, attempt, "Read attempt failed: {e}");
                    if e.drops_connection() {
                        self.disconnect().await;
                    }
                    last_error = e.to_string();
                },
            }
            self.stats.record_read(false);
        }

        self.sync_flag();
        if connect_failed {
            warn!(unit_id, "Modbus host unreachable: {last_error}");
            return Err(SunSrvError::connection(last_error));
        }
        Err(SunSrvError::read(unit_id, start, count, last_error))
    }
}
