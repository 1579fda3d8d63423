//! BLE Connection Module
//!
//! The per-device connection lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Discovering -> Servicing -> Disconnecting -> Closed
//!            |               |
//!            +-------+-------+
//!                    v
//!                  Failed
//! ```
//!
//! A [`ConnectionSession`] owns its [`DeviceLogger`] for its whole life.
//! Collaborators are borrowed per event through a [`SessionContext`].

use crate::domain::error::{BleError, BleResult};
use crate::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::poller::HealthPoller;
use crate::infrastructure::bluetooth::protocol::{decode_payload, ConnectionHandle, GattService};
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::device_log::DeviceLogger;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Discovering,
    Servicing,
    Disconnecting,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Discovering)
                | (Connecting, Failed)
                | (Discovering, Servicing)
                | (Discovering, Failed)
                | (Connecting, Disconnecting)
                | (Discovering, Disconnecting)
                | (Servicing, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}

/// Collaborators a session borrows while handling one event
pub struct SessionContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub registry: &'a DeviceRegistry,
    pub poller: &'a mut HealthPoller,
    pub events: &'a mpsc::UnboundedSender<AppEvent>,
    pub poll_interval: Duration,
}

impl SessionContext<'_> {
    fn notify(&self, device_id: &str, status: ConnectionStatus, message: String, severity: MessageSeverity) {
        let _ = self.events.send(AppEvent::ConnectionStatus {
            device_id: device_id.to_string(),
            status,
        });
        let _ = self
            .events
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

/// Live state of one device connection
pub struct ConnectionSession {
    device_id: String,
    device_name: String,
    handle: Option<ConnectionHandle>,
    state: ConnectionState,
    services: Vec<GattService>,
    logger: DeviceLogger,
}

impl ConnectionSession {
    pub fn new(device_id: &str, device_name: &str, logger: DeviceLogger) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            handle: None,
            state: ConnectionState::Idle,
            services: Vec::new(),
            logger,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn logger(&self) -> &DeviceLogger {
        &self.logger
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "{}: invalid transition {:?} -> {:?}",
                self.device_id, self.state, next
            );
            return false;
        }
        debug!("{}: {:?} -> {:?}", self.device_id, self.state, next);
        self.state = next;
        true
    }

    /// Idle -> Connecting. The device joins the connected set and the
    /// transport is asked to connect; a synchronous refusal fails the session.
    pub fn begin_connect(&mut self, ctx: &mut SessionContext<'_>) -> BleResult<ConnectionHandle> {
        if !self.transition(ConnectionState::Connecting) {
            return Err(BleError::AlreadyConnected(self.device_id.clone()));
        }
        ctx.registry.mark_connected(&self.device_id);
        self.logger
            .append_info(&format!("Connecting to {}", self.device_name));
        ctx.notify(
            &self.device_id,
            ConnectionStatus::Connecting,
            format!("Connecting to {}", self.device_name),
            MessageSeverity::Info,
        );

        match ctx.transport.connect(&self.device_id) {
            Ok(handle) => {
                info!("Connecting to {} ({}) as {}", self.device_name, self.device_id, handle);
                self.handle = Some(handle);
                Ok(handle)
            }
            Err(e) => {
                let err = BleError::ConnectFailed {
                    device_id: self.device_id.clone(),
                    reason: e.to_string(),
                };
                self.fail(ctx, &err);
                Err(err)
            }
        }
    }

    /// Connecting -> Discovering
    pub fn on_link_up(&mut self, ctx: &mut SessionContext<'_>) {
        if self.state != ConnectionState::Connecting {
            debug!("{}: link up ignored in {:?}", self.device_id, self.state);
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };
        self.transition(ConnectionState::Discovering);
        info!("Connected to GATT server for {}", self.device_name);
        self.logger.append_info("Connected to GATT server");

        if let Err(e) = ctx.transport.discover_services(handle) {
            let err = BleError::DiscoveryFailed {
                device_id: self.device_id.clone(),
                reason: e.to_string(),
            };
            self.fail(ctx, &err);
        }
    }

    /// Connecting -> Failed on a transport-level connect error
    pub fn on_connect_failed(&mut self, ctx: &mut SessionContext<'_>, reason: &str) {
        if self.state != ConnectionState::Connecting {
            debug!("{}: connect failure ignored in {:?}", self.device_id, self.state);
            return;
        }
        let err = BleError::ConnectFailed {
            device_id: self.device_id.clone(),
            reason: reason.to_string(),
        };
        self.fail(ctx, &err);
    }

    /// Connecting -> Failed when the link never came up
    pub fn on_connect_timeout(&mut self, ctx: &mut SessionContext<'_>) {
        if self.state == ConnectionState::Connecting {
            self.on_connect_failed(ctx, "connection timed out");
        }
    }

    /// Discovering -> Servicing (or Failed)
    pub fn on_discovery_complete(
        &mut self,
        ctx: &mut SessionContext<'_>,
        result: Result<Vec<GattService>, String>,
    ) {
        if self.state != ConnectionState::Discovering {
            debug!("{}: discovery result ignored in {:?}", self.device_id, self.state);
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                let err = BleError::DiscoveryFailed {
                    device_id: self.device_id.clone(),
                    reason,
                };
                self.fail(ctx, &err);
                return;
            }
        };
        let Some(handle) = self.handle else {
            return;
        };

        info!("Discovered {} services for {}", services.len(), self.device_name);
        self.logger.append_info("Services discovered");

        // Report order is kept as-is; it mirrors the peripheral's GATT table
        for service in &services {
            self.logger.append_info(&format!("Service: {}", service.uuid));

            for characteristic in &service.characteristics {
                self.logger
                    .append_info(&format!("  Characteristic: {}", characteristic.uuid));

                if !characteristic.can_notify() {
                    continue;
                }
                match ctx.transport.set_notify(handle, &characteristic.uuid, true) {
                    Ok(()) => self.logger.append_info(&format!(
                        "  Enabled notifications for {}",
                        characteristic.uuid
                    )),
                    Err(e) => {
                        warn!(
                            "Could not enable notifications for {} on {}: {}",
                            characteristic.uuid, self.device_id, e
                        );
                        self.logger.append_info(&format!(
                            "  Failed to enable notifications for {}: {}",
                            characteristic.uuid, e
                        ));
                    }
                }
            }
        }
        self.services = services;

        self.transition(ConnectionState::Servicing);
        ctx.poller.start(&self.device_id, ctx.poll_interval);
        self.logger.append_info("Started continuous logging");
        ctx.notify(
            &self.device_id,
            ConnectionStatus::Connected,
            format!("Connected to {}", self.device_name),
            MessageSeverity::Success,
        );
    }

    /// Transport reported the link gone
    pub fn on_link_down(&mut self, ctx: &mut SessionContext<'_>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Discovering => {
                let reason = "link lost".to_string();
                let err = if self.state == ConnectionState::Connecting {
                    BleError::ConnectFailed {
                        device_id: self.device_id.clone(),
                        reason,
                    }
                } else {
                    BleError::DiscoveryFailed {
                        device_id: self.device_id.clone(),
                        reason,
                    }
                };
                self.fail(ctx, &err);
            }
            ConnectionState::Servicing => {
                info!("Disconnected from GATT server for {}", self.device_name);
                self.close(ctx, "disconnection");
            }
            _ => debug!("{}: link down ignored in {:?}", self.device_id, self.state),
        }
    }

    /// Explicit disconnect request from outside the core
    pub fn disconnect(&mut self, ctx: &mut SessionContext<'_>) {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Discovering
            | ConnectionState::Servicing => {
                if let Some(handle) = self.handle {
                    if let Err(e) = ctx.transport.disconnect(handle) {
                        warn!("Transport disconnect for {} failed: {}", self.device_id, e);
                    }
                }
                self.close(ctx, "disconnection");
            }
            _ => debug!("{}: disconnect ignored in {:?}", self.device_id, self.state),
        }
    }

    pub fn on_characteristic_read(&mut self, characteristic: &str, value: &[u8], success: bool) {
        if self.state != ConnectionState::Servicing || !success {
            return;
        }
        self.logger.append_data(&format!(
            "Read from {}: {}",
            characteristic,
            decode_payload(value)
        ));
    }

    pub fn on_notification(&mut self, characteristic: &str, value: &[u8]) {
        if self.state != ConnectionState::Servicing {
            return;
        }
        self.logger.append_data(&format!(
            "Notification from {}: {}",
            characteristic,
            decode_payload(value)
        ));
    }

    /// Run one liveness probe. Returns false when the device has left the
    /// connected set and polling should end.
    pub fn probe(&mut self, ctx: &mut SessionContext<'_>) -> bool {
        if self.state != ConnectionState::Servicing || !ctx.registry.is_connected(&self.device_id) {
            return false;
        }
        let Some(handle) = self.handle else {
            return false;
        };
        match ctx.transport.read_rssi(handle) {
            Ok(rssi) => self.logger.append_info(&format!(
                "Connection check for {}, RSSI: {}",
                self.device_name, rssi
            )),
            Err(e) => {
                warn!("RSSI read for {} failed: {}", self.device_id, e);
                self.logger.append_info(&format!(
                    "Connection check for {} failed: {}",
                    self.device_name, e
                ));
            }
        }
        true
    }

    /// First teardown phase: release the connection handle
    pub fn release_handle(&mut self, transport: &mut dyn Transport) {
        if let Some(handle) = self.handle.take() {
            transport.close(handle);
        }
    }

    /// Final teardown phase: close the logs and mark the session closed
    pub fn finish_shutdown(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.logger.append_info("Stopped logging due to shutdown");
        self.logger.close();
        self.state = ConnectionState::Closed;
    }

    /// -> Disconnecting -> Closed
    fn close(&mut self, ctx: &mut SessionContext<'_>, cause: &str) {
        if !self.transition(ConnectionState::Disconnecting) {
            return;
        }
        ctx.poller.cancel(&self.device_id);
        self.logger
            .append_info(&format!("Stopped logging due to {}", cause));

        self.transition(ConnectionState::Closed);
        self.logger.close();
        self.release_handle(&mut *ctx.transport);
        ctx.registry.mark_disconnected(&self.device_id);

        ctx.notify(
            &self.device_id,
            ConnectionStatus::Disconnected,
            format!("Disconnected from {}", self.device_name),
            MessageSeverity::Info,
        );
    }

    /// -> Failed, releasing everything the session holds
    fn fail(&mut self, ctx: &mut SessionContext<'_>, err: &BleError) {
        error!("{}", err);
        self.logger.append_info(&format!("Connection failed: {}", err));
        self.state = ConnectionState::Failed;

        ctx.poller.cancel(&self.device_id);
        self.release_handle(&mut *ctx.transport);
        ctx.registry.mark_disconnected(&self.device_id);
        self.logger.close();

        ctx.notify(
            &self.device_id,
            ConnectionStatus::Error,
            format!("Disconnected from {}: {}", self.device_name, err),
            MessageSeverity::Error,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{properties, GattCharacteristic};
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedDevice, SimulatedTransport, TransportCall,
    };
    use crate::infrastructure::device_log::LocalFilesystem;
    use std::path::Path;

    struct Harness {
        transport: SimulatedTransport,
        registry: DeviceRegistry,
        poller: HealthPoller,
        events: mpsc::UnboundedSender<AppEvent>,
        _events_rx: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new(device: SimulatedDevice) -> Self {
            let transport = SimulatedTransport::new(vec![device]);
            transport.set_auto_respond(false);
            let (core_tx, _core_rx) = mpsc::unbounded_channel();
            let (events, events_rx) = mpsc::unbounded_channel();
            Self {
                transport,
                registry: DeviceRegistry::new(),
                poller: HealthPoller::new(core_tx),
                events,
                _events_rx: events_rx,
            }
        }

        fn ctx(&mut self) -> SessionContext<'_> {
            SessionContext {
                transport: &mut self.transport,
                registry: &self.registry,
                poller: &mut self.poller,
                events: &self.events,
                poll_interval: Duration::from_secs(5),
            }
        }
    }

    fn battery_device() -> SimulatedDevice {
        SimulatedDevice::new("AA:BB:CC:DD:EE:FF", Some("Pixel Buds")).with_services(vec![
            GattService::new(
                "180F",
                vec![GattCharacteristic::new(
                    "2A19",
                    properties::READ | properties::NOTIFY,
                )],
            ),
        ])
    }

    fn session(root: &Path) -> ConnectionSession {
        let logger = DeviceLogger::open(&LocalFilesystem, root, "AA:BB:CC:DD:EE:FF", "Pixel Buds");
        ConnectionSession::new("AA:BB:CC:DD:EE:FF", "Pixel Buds", logger)
    }

    fn info_lines(session: &ConnectionSession) -> Vec<String> {
        std::fs::read_to_string(session.logger().info_path())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Servicing.can_transition_to(Disconnecting));
        assert!(!Servicing.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Servicing));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Closed));
        assert!(Closed.is_terminal() && Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());

        let handle = s.begin_connect(&mut h.ctx()).unwrap();
        assert_eq!(s.state(), ConnectionState::Connecting);
        assert!(h.registry.is_connected("AA:BB:CC:DD:EE:FF"));

        s.on_link_up(&mut h.ctx());
        assert_eq!(s.state(), ConnectionState::Discovering);
        assert!(h.transport.calls().contains(&TransportCall::DiscoverServices(handle)));

        let services = battery_device().services;
        s.on_discovery_complete(&mut h.ctx(), Ok(services));
        assert_eq!(s.state(), ConnectionState::Servicing);
        assert_eq!(s.services().len(), 1);
        assert!(h.poller.is_active("AA:BB:CC:DD:EE:FF"));

        s.on_link_down(&mut h.ctx());
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(!h.poller.is_active("AA:BB:CC:DD:EE:FF"));
        assert!(!h.registry.is_connected("AA:BB:CC:DD:EE:FF"));
        assert!(h.transport.calls().contains(&TransportCall::Close(handle)));
        assert!(s.handle().is_none());

        let lines = info_lines(&s);
        let position = |needle: &str| lines.iter().position(|l| l.contains(needle)).unwrap();
        assert!(position("Service: 180F") < position("Characteristic: 2A19"));
        assert!(position("Characteristic: 2A19") < position("Enabled notifications for 2A19"));
        assert!(position("Stopped logging due to disconnection") < position("=== LOG CLOSED ==="));
    }

    #[tokio::test]
    async fn test_characteristics_logged_in_reported_order() {
        let dir = tempfile::tempdir().unwrap();
        let reported = vec!["2A29", "2A24", "2A25", "2A27", "2A26"];
        let device = SimulatedDevice::new("AA:BB:CC:DD:EE:FF", None).with_services(vec![
            GattService::new(
                "180A",
                reported
                    .iter()
                    .map(|u| GattCharacteristic::new(*u, properties::READ))
                    .collect(),
            ),
        ]);
        let services = device.services.clone();
        let mut h = Harness::new(device);
        let mut s = session(dir.path());
        s.begin_connect(&mut h.ctx()).unwrap();
        s.on_link_up(&mut h.ctx());
        s.on_discovery_complete(&mut h.ctx(), Ok(services));

        let logged: Vec<String> = info_lines(&s)
            .iter()
            .filter_map(|l| l.split("Characteristic: ").nth(1).map(String::from))
            .collect();
        assert_eq!(logged, reported);
        // Nothing here is notify-capable
        assert!(!h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::SetNotify { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());

        let handle = s.begin_connect(&mut h.ctx()).unwrap();
        s.on_connect_failed(&mut h.ctx(), "GATT error 133");

        assert_eq!(s.state(), ConnectionState::Failed);
        assert!(!h.registry.is_connected("AA:BB:CC:DD:EE:FF"));
        assert!(h.transport.calls().contains(&TransportCall::Close(handle)));
        assert!(s.logger().is_closed());

        let lines = info_lines(&s);
        assert!(lines.iter().any(|l| l.contains("Connection failed") && l.contains("GATT error 133")));
        assert_eq!(lines[lines.len() - 2], "=== LOG CLOSED ===");

        // No retry: later events change nothing
        s.on_link_up(&mut h.ctx());
        assert_eq!(s.state(), ConnectionState::Failed);
        let connects = h
            .transport
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());
        s.begin_connect(&mut h.ctx()).unwrap();
        s.on_link_up(&mut h.ctx());
        s.on_discovery_complete(&mut h.ctx(), Err("status 129".to_string()));

        assert_eq!(s.state(), ConnectionState::Failed);
        assert!(!h.poller.is_active("AA:BB:CC:DD:EE:FF"));
        assert!(s.logger().is_closed());
    }

    #[tokio::test]
    async fn test_connect_timeout_only_applies_while_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());
        s.begin_connect(&mut h.ctx()).unwrap();
        s.on_link_up(&mut h.ctx());

        s.on_connect_timeout(&mut h.ctx());
        assert_eq!(s.state(), ConnectionState::Discovering);
    }

    #[tokio::test]
    async fn test_data_events_only_logged_while_servicing() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());
        s.begin_connect(&mut h.ctx()).unwrap();

        s.on_notification("2A19", b"early");
        s.on_link_up(&mut h.ctx());
        s.on_discovery_complete(&mut h.ctx(), Ok(battery_device().services));

        s.on_notification("2A19", &[0x64]);
        s.on_characteristic_read("2A19", b"Pixel", true);
        s.on_characteristic_read("2A19", b"bad", false);

        let data = std::fs::read_to_string(s.logger().data_path()).unwrap();
        assert!(!data.contains("early"));
        assert!(data.contains("] Notification from 2A19: d"));
        assert!(data.contains("] Read from 2A19: Pixel"));
        assert!(!data.contains("bad"));
        let info = std::fs::read_to_string(s.logger().info_path()).unwrap();
        assert!(!info.contains("Notification from"));
    }

    #[tokio::test]
    async fn test_probe_logs_rssi_until_device_leaves_connected_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device().with_rssi(-42));
        let mut s = session(dir.path());
        s.begin_connect(&mut h.ctx()).unwrap();
        s.on_link_up(&mut h.ctx());
        s.on_discovery_complete(&mut h.ctx(), Ok(battery_device().services));

        assert!(s.probe(&mut h.ctx()));
        assert!(info_lines(&s)
            .iter()
            .any(|l| l.ends_with("Connection check for Pixel Buds, RSSI: -42")));

        h.registry.mark_disconnected("AA:BB:CC:DD:EE:FF");
        assert!(!s.probe(&mut h.ctx()));
    }

    #[tokio::test]
    async fn test_explicit_disconnect_while_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(battery_device());
        let mut s = session(dir.path());
        let handle = s.begin_connect(&mut h.ctx()).unwrap();

        s.disconnect(&mut h.ctx());
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(h.transport.calls().contains(&TransportCall::Disconnect(handle)));
        assert!(s.logger().is_closed());
    }
}
