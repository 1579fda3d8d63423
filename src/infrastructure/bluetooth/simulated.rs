//! Simulated radio
//!
//! An in-memory [`Transport`] with a fixed set of peripherals. It answers
//! requests by posting the matching callbacks to the subscribed sink and
//! records every call so the session core can be driven end to end without
//! hardware. Clones share state.

use crate::domain::error::{BleError, BleResult};
use crate::infrastructure::bluetooth::protocol::{ConnectionHandle, GattService, TransportEvent};
use crate::infrastructure::bluetooth::transport::{Transport, TransportSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub id: String,
    pub name: Option<String>,
    pub services: Vec<GattService>,
    pub rssi: i16,
    pub connect_error: Option<String>,
    pub discovery_error: Option<String>,
}

impl SimulatedDevice {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.map(String::from),
            services: Vec::new(),
            rssi: -60,
            connect_error: None,
            discovery_error: None,
        }
    }

    pub fn with_services(mut self, services: Vec<GattService>) -> Self {
        self.services = services;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn failing_connect(mut self, reason: &str) -> Self {
        self.connect_error = Some(reason.to_string());
        self
    }

    pub fn failing_discovery(mut self, reason: &str) -> Self {
        self.discovery_error = Some(reason.to_string());
        self
    }
}

/// A request the core made of the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices(ConnectionHandle),
    SetNotify {
        handle: ConnectionHandle,
        characteristic: String,
        enabled: bool,
    },
    ReadRssi(ConnectionHandle),
    Disconnect(ConnectionHandle),
    Close(ConnectionHandle),
}

#[derive(Debug)]
struct SimState {
    devices: Vec<SimulatedDevice>,
    sink: Option<TransportSink>,
    radio_enabled: bool,
    auto_respond: bool,
    next_handle: u64,
    open: HashMap<ConnectionHandle, String>,
    calls: Vec<TransportCall>,
}

#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                devices,
                sink: None,
                radio_enabled: true,
                auto_respond: true,
                next_handle: 0,
                open: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.lock().radio_enabled = enabled;
    }

    /// When disabled, requests are recorded but no callbacks are posted;
    /// use [`SimulatedTransport::emit`] to deliver them by hand.
    pub fn set_auto_respond(&self, auto_respond: bool) {
        self.lock().auto_respond = auto_respond;
    }

    /// Post an arbitrary callback, as the radio stack would
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.lock().sink.as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Push a notification for `characteristic` on `handle`
    pub fn notify(&self, handle: ConnectionHandle, characteristic: &str, value: &[u8]) -> bool {
        self.emit(TransportEvent::CharacteristicNotify {
            handle,
            characteristic: characteristic.to_string(),
            value: value.to_vec(),
        })
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| **c == TransportCall::StopScan)
            .count()
    }

    pub fn open_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self.lock().open.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn handle_for(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.lock()
            .open
            .iter()
            .find(|(_, id)| id.as_str() == device_id)
            .map(|(h, _)| *h)
    }
}

impl SimState {
    fn respond(&self, event: TransportEvent) {
        if !self.auto_respond {
            return;
        }
        if let Some(sink) = self.sink.as_ref() {
            sink.emit(event);
        }
    }

    fn device_for(&self, handle: ConnectionHandle) -> BleResult<&SimulatedDevice> {
        let id = self
            .open
            .get(&handle)
            .ok_or_else(|| BleError::Transport(format!("unknown handle {}", handle)))?;
        self.devices
            .iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| BleError::Transport(format!("device {} vanished", id)))
    }
}

impl Transport for SimulatedTransport {
    fn subscribe(&mut self, sink: TransportSink) {
        self.lock().sink = Some(sink);
    }

    fn is_radio_enabled(&self) -> bool {
        self.lock().radio_enabled
    }

    fn device_name(&self, device_id: &str) -> Option<String> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .and_then(|d| d.name.clone())
    }

    fn start_scan(&mut self) -> BleResult<()> {
        let mut state = self.lock();
        state.calls.push(TransportCall::StartScan);
        if !state.radio_enabled {
            return Err(BleError::RadioUnavailable);
        }
        for device in &state.devices {
            state.respond(TransportEvent::ScanResult {
                device_id: device.id.clone(),
                name: device.name.clone(),
            });
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> BleResult<()> {
        self.lock().calls.push(TransportCall::StopScan);
        Ok(())
    }

    fn connect(&mut self, device_id: &str) -> BleResult<ConnectionHandle> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Connect(device_id.to_string()));
        if !state.radio_enabled {
            return Err(BleError::RadioUnavailable);
        }

        state.next_handle += 1;
        let handle = ConnectionHandle(state.next_handle);
        state.open.insert(handle, device_id.to_string());
        debug!("Simulated connect {} -> {}", device_id, handle);

        let failure = match state.devices.iter().find(|d| d.id == device_id) {
            Some(device) => device.connect_error.clone(),
            None => Some("device not found".to_string()),
        };
        match failure {
            Some(reason) => state.respond(TransportEvent::ConnectFailed { handle, reason }),
            None => state.respond(TransportEvent::LinkUp { handle }),
        }
        Ok(handle)
    }

    fn discover_services(&mut self, handle: ConnectionHandle) -> BleResult<()> {
        let mut state = self.lock();
        state.calls.push(TransportCall::DiscoverServices(handle));
        let result = {
            let device = state.device_for(handle)?;
            match &device.discovery_error {
                Some(reason) => Err(reason.clone()),
                None => Ok(device.services.clone()),
            }
        };
        state.respond(TransportEvent::DiscoveryComplete { handle, result });
        Ok(())
    }

    fn set_notify(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &str,
        enabled: bool,
    ) -> BleResult<()> {
        let mut state = self.lock();
        state.calls.push(TransportCall::SetNotify {
            handle,
            characteristic: characteristic.to_string(),
            enabled,
        });
        let device = state.device_for(handle)?;
        let known = device
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .any(|c| c.uuid == characteristic);
        if known {
            Ok(())
        } else {
            Err(BleError::Transport(format!(
                "no characteristic {}",
                characteristic
            )))
        }
    }

    fn read_rssi(&mut self, handle: ConnectionHandle) -> BleResult<i16> {
        let mut state = self.lock();
        state.calls.push(TransportCall::ReadRssi(handle));
        Ok(state.device_for(handle)?.rssi)
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> BleResult<()> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Disconnect(handle));
        state.respond(TransportEvent::LinkDown { handle });
        Ok(())
    }

    fn close(&mut self, handle: ConnectionHandle) {
        let mut state = self.lock();
        state.calls.push(TransportCall::Close(handle));
        state.open.remove(&handle);
    }
}
