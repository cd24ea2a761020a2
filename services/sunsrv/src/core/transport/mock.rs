//! Mock Transport for Testing
//!
//! Serves registers from an in-memory map per unit id so session, resolver
//! and poller logic can be exercised without a network. Clones share state,
//! so a test can keep one handle while the session owns another.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::traits::{Transport, TransportError};

/// Residue the DataManager leaves in its buffer after a unit switch
pub const STALE_BUFFER_WORD: u16 = 0x5365;

/// Operations observed by the mock, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect,
    Disconnect,
    Read { unit_id: u8, address: u16, count: u16 },
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    fail_connect: bool,
    /// Reproduce the stale-buffer behaviour on unit switches
    stale_buffer: bool,
    last_unit_on_socket: Option<u8>,
    registers: HashMap<u8, BTreeMap<u16, u16>>,
    offline_units: HashSet<u8>,
    /// Wire addresses whose response leaves residue for later reads on the socket
    residue_triggers: HashSet<(u8, u16)>,
    residue: bool,
    /// Remaining injected failures per unit
    transient_failures: HashMap<u8, u32>,
    events: Vec<MockEvent>,
}

/// Mock transport implementation
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load registers for a unit starting at a zero-based wire address
    pub fn set_registers(&self, unit_id: u8, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        let map = state.registers.entry(unit_id).or_default();
        for (offset, value) in values.iter().enumerate() {
            map.insert(address + offset as u16, *value);
        }
    }

    /// Load registers using 1-based SunSpec register numbers
    pub fn set_block(&self, unit_id: u8, register: u16, values: &[u16]) {
        self.set_registers(unit_id, register - 1, values);
    }

    /// Forget `count` registers of a unit starting at `address`
    pub fn clear_registers(&self, unit_id: u8, address: u16, count: u16) {
        let mut state = self.state.lock();
        if let Some(map) = state.registers.get_mut(&unit_id) {
            for addr in address..address + count {
                map.remove(&addr);
            }
        }
    }

    pub fn set_connection_failure(&self, should_fail: bool) {
        self.state.lock().fail_connect = should_fail;
    }

    pub fn set_stale_buffer(&self, enabled: bool) {
        self.state.lock().stale_buffer = enabled;
    }

    /// After a read of `register` on `unit_id`, later reads on the same socket
    /// start with the stale word until the next connect
    pub fn leave_residue_after(&self, unit_id: u8, register: u16) {
        self.state
            .lock()
            .residue_triggers
            .insert((unit_id, register - 1));
    }

    /// Make every read for a unit time out until cleared
    pub fn set_unit_offline(&self, unit_id: u8, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline_units.insert(unit_id);
        } else {
            state.offline_units.remove(&unit_id);
        }
    }

    /// Fail the next `count` reads for a unit
    pub fn fail_next_reads(&self, unit_id: u8, count: u32) {
        self.state.lock().transient_failures.insert(unit_id, count);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Connect))
            .count()
    }

    pub fn reads_for(&self, unit_id: u8) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Read { unit_id: u, .. } if *u == unit_id))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Connect);
        if state.fail_connect {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        state.connected = true;
        state.last_unit_on_socket = None;
        state.residue = false;
        debug!("Mock transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected {
            state.events.push(MockEvent::Disconnect);
        }
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Read {
            unit_id,
            address,
            count,
        });

        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        if state.offline_units.contains(&unit_id) {
            return Err(TransportError::Timeout(format!("unit {unit_id} silent")));
        }

        if let Some(remaining) = state.transient_failures.get_mut(&unit_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Timeout(format!("unit {unit_id} injected")));
            }
        }

        let switched = matches!(state.last_unit_on_socket, Some(prev) if prev != unit_id);
        state.last_unit_on_socket = Some(unit_id);

        let Some(map) = state.registers.get(&unit_id) else {
            return Err(TransportError::Exception {
                function: 0x03,
                code: 0x0B,
            });
        };

        let mut values = Vec::with_capacity(count as usize);
        for addr in address..address.saturating_add(count) {
            match map.get(&addr) {
                Some(v) => values.push(*v),
                None => {
                    return Err(TransportError::Exception {
                        function: 0x03,
                        code: 0x02,
                    })
                },
            }
        }

        if (switched && state.stale_buffer) || state.residue {
            values[0] = STALE_BUFFER_WORD;
        }
        if state.residue_triggers.contains(&(unit_id, address)) {
            state.residue = true;
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_loaded_registers() {
        let mut mock = MockTransport::new();
        mock.set_block(1, 40070, &[113, 60]);
        mock.connect().await.unwrap();
        assert_eq!(
            mock.read_holding_registers(1, 40069, 2).await.unwrap(),
            vec![113, 60]
        );
        assert!(matches!(
            mock.read_holding_registers(1, 40071, 1).await,
            Err(TransportError::Exception { code: 0x02, .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_buffer_after_unit_switch() {
        let mut mock = MockTransport::new();
        mock.set_stale_buffer(true);
        mock.set_block(1, 40070, &[113]);
        mock.set_block(240, 40070, &[203]);
        mock.connect().await.unwrap();

        assert_eq!(mock.read_holding_registers(1, 40069, 1).await.unwrap(), vec![113]);
        assert_eq!(
            mock.read_holding_registers(240, 40069, 1).await.unwrap(),
            vec![STALE_BUFFER_WORD]
        );

        mock.disconnect().await.unwrap();
        mock.connect().await.unwrap();
        assert_eq!(mock.read_holding_registers(240, 40069, 1).await.unwrap(), vec![203]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut mock = MockTransport::new();
        mock.set_block(1, 40001, &[1, 2]);
        mock.set_connection_failure(true);
        assert!(mock.connect().await.is_err());

        mock.set_connection_failure(false);
        mock.connect().await.unwrap();
        mock.fail_next_reads(1, 1);
        assert!(mock.read_holding_registers(1, 40000, 2).await.is_err());
        assert!(mock.read_holding_registers(1, 40000, 2).await.is_ok());
        assert_eq!(mock.reads_for(1), 2);
    }
}
