//! Collaborator seams
//!
//! The session core drives the radio only through [`Transport`] and asks
//! [`Authorization`] before each logical operation. Transport callbacks are
//! posted through the [`TransportSink`] handed over once in
//! [`Transport::subscribe`].

use crate::domain::error::BleResult;
use crate::infrastructure::bluetooth::protocol::{Capability, ConnectionHandle, TransportEvent};
use crate::infrastructure::bluetooth::service::CoreEvent;
use tokio::sync::mpsc;

/// Delivery end for transport callbacks, feeding the dispatch loop
#[derive(Debug, Clone)]
pub struct TransportSink {
    sender: mpsc::UnboundedSender<CoreEvent>,
}

impl TransportSink {
    pub fn new(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self { sender }
    }

    /// Returns false once the dispatch loop has gone away
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.sender.send(CoreEvent::Transport(event)).is_ok()
    }
}

/// BLE radio operations consumed by the core.
///
/// Requests return immediately; their outcomes arrive later as
/// [`TransportEvent`]s on the subscribed sink.
pub trait Transport: Send {
    fn subscribe(&mut self, sink: TransportSink);

    fn is_radio_enabled(&self) -> bool;

    /// Name the radio stack has cached for a peripheral, if any
    fn device_name(&self, device_id: &str) -> Option<String>;

    fn start_scan(&mut self) -> BleResult<()>;
    fn stop_scan(&mut self) -> BleResult<()>;

    /// Begin connecting; `LinkUp` or `ConnectFailed` follows for the returned handle
    fn connect(&mut self, device_id: &str) -> BleResult<ConnectionHandle>;
    /// `DiscoveryComplete` follows
    fn discover_services(&mut self, handle: ConnectionHandle) -> BleResult<()>;
    fn set_notify(
        &mut self,
        handle: ConnectionHandle,
        characteristic: &str,
        enabled: bool,
    ) -> BleResult<()>;
    fn read_rssi(&mut self, handle: ConnectionHandle) -> BleResult<i16>;

    fn disconnect(&mut self, handle: ConnectionHandle) -> BleResult<()>;
    /// Release every resource behind the handle. Later events for it are not expected.
    fn close(&mut self, handle: ConnectionHandle);
}

/// Permission gate checked before any transport operation
pub trait Authorization: Send + Sync {
    fn is_granted(&self, capability: Capability) -> bool;
}

/// Authorization for platforms without a runtime permission model
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl Authorization for GrantAll {
    fn is_granted(&self, _capability: Capability) -> bool {
        true
    }
}
