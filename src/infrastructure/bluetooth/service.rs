//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection sessions, health
//! polling and per-device logs. It owns every per-device resource and is
//! driven from a single dispatch loop ([`BluetoothService::run`]), so state
//! transitions never race each other.

use crate::domain::error::{BleError, BleResult};
use crate::domain::models::{AppEvent, DiscoveredDevice, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionSession, ConnectionState, SessionContext},
    poller::HealthPoller,
    protocol::{Capability, ConnectionHandle, TransportEvent},
    scanner::BleScanner,
    transport::{Authorization, Transport, TransportSink},
};
use crate::infrastructure::device_log::{DeviceLogger, LogFilesystem};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the dispatch loop reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Transport(TransportEvent),
    ScanTimeout { generation: u64 },
    ConnectTimeout { handle: ConnectionHandle },
    PollTick { device_id: String, task_id: u64 },
}

impl From<TransportEvent> for CoreEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

/// Requests from the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scan for the given duration, or the configured default
    StartScan(Option<Duration>),
    StopScan,
    Connect(String),
    Disconnect(String),
    Shutdown,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    transport: Box<dyn Transport>,
    authorization: Arc<dyn Authorization>,
    filesystem: Arc<dyn LogFilesystem>,
    settings: Settings,
    registry: DeviceRegistry,
    scanner: BleScanner,
    poller: HealthPoller,
    sessions: HashMap<String, ConnectionSession>,
    handles: HashMap<ConnectionHandle, String>,
    connect_timers: HashMap<String, CancellationToken>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    core_sender: mpsc::UnboundedSender<CoreEvent>,
}

impl BluetoothService {
    /// Create the service and subscribe to the transport's callbacks.
    ///
    /// The returned receiver carries the events [`BluetoothService::run`]
    /// (or a test) must feed back into [`BluetoothService::handle_event`].
    pub fn new(
        mut transport: Box<dyn Transport>,
        authorization: Arc<dyn Authorization>,
        filesystem: Arc<dyn LogFilesystem>,
        settings: Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (core_sender, core_receiver) = mpsc::unbounded_channel();
        transport.subscribe(TransportSink::new(core_sender.clone()));

        let registry = DeviceRegistry::new();
        let service = Self {
            scanner: BleScanner::new(registry.clone(), event_sender.clone(), core_sender.clone()),
            poller: HealthPoller::new(core_sender.clone()),
            transport,
            authorization,
            filesystem,
            settings,
            registry,
            sessions: HashMap::new(),
            handles: HashMap::new(),
            connect_timers: HashMap::new(),
            event_sender,
            core_sender,
        };
        (service, core_receiver)
    }

    fn authorize(&self, capability: Capability) -> BleResult<()> {
        if !self.authorization.is_granted(capability) {
            warn!("{:?} permission missing", capability);
            return Err(BleError::PermissionDenied);
        }
        if !self.transport.is_radio_enabled() {
            warn!("Bluetooth radio is disabled");
            return Err(BleError::RadioUnavailable);
        }
        Ok(())
    }

    /// Start scanning for devices. `None` uses the configured duration.
    pub fn start_scan(&mut self, duration: Option<Duration>) -> BleResult<()> {
        self.authorize(Capability::Scan)?;
        let duration = duration.unwrap_or_else(|| self.settings.scan_duration());
        self.scanner.start(self.transport.as_mut(), duration)
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) {
        self.scanner.stop(self.transport.as_mut());
    }

    /// Connect to a device by address.
    ///
    /// The log name comes from the current scan if the device was seen there,
    /// otherwise from the name the radio stack has cached for it.
    pub fn connect(&mut self, device_id: &str) -> BleResult<ConnectionHandle> {
        self.authorize(Capability::Connect)?;

        let device_name = self
            .registry
            .find_discovered(device_id)
            .unwrap_or_else(|| DiscoveredDevice::new(device_id, self.transport.device_name(device_id)))
            .display_name()
            .to_string();

        if self.registry.is_connected(device_id) || self.sessions.contains_key(device_id) {
            info!("Already connected to {}", device_id);
            self.send_log(
                format!("Already connected to {}", device_name),
                MessageSeverity::Warning,
            );
            return Err(BleError::AlreadyConnected(device_id.to_string()));
        }

        let logger = DeviceLogger::open(
            self.filesystem.as_ref(),
            &self.settings.log_root(),
            device_id,
            &device_name,
        );
        let mut session = ConnectionSession::new(device_id, &device_name, logger);

        let result = {
            let mut ctx = SessionContext {
                transport: self.transport.as_mut(),
                registry: &self.registry,
                poller: &mut self.poller,
                events: &self.event_sender,
                poll_interval: self.settings.poll_interval(),
            };
            session.begin_connect(&mut ctx)
        };
        let handle = result?;

        self.handles.insert(handle, device_id.to_string());
        self.sessions.insert(device_id.to_string(), session);
        self.arm_connect_timeout(device_id, handle);
        Ok(handle)
    }

    fn arm_connect_timeout(&mut self, device_id: &str, handle: ConnectionHandle) {
        let timeout = self.settings.connect_timeout();
        if timeout.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let sender = self.core_sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = sender.send(CoreEvent::ConnectTimeout { handle });
                }
            }
        });
        if let Some(previous) = self.connect_timers.insert(device_id.to_string(), token) {
            previous.cancel();
        }
    }

    fn disarm_connect_timeout(&mut self, device_id: &str) {
        if let Some(token) = self.connect_timers.remove(device_id) {
            token.cancel();
        }
    }

    /// Number of connect timers still waiting to fire
    pub fn pending_connect_timers(&self) -> usize {
        self.connect_timers.len()
    }

    /// Disconnect from a device
    pub fn disconnect(&mut self, device_id: &str) -> BleResult<()> {
        if !self.sessions.contains_key(device_id) {
            return Err(BleError::NotConnected(device_id.to_string()));
        }
        self.authorize(Capability::Connect)?;
        self.with_session(device_id, |session, ctx| session.disconnect(ctx));
        Ok(())
    }

    /// Dispatch one event to the component that owns it
    pub fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Transport(TransportEvent::ScanResult { device_id, name }) => {
                self.scanner.on_result(&device_id, name);
            }
            CoreEvent::Transport(event) => self.handle_transport_event(event),
            CoreEvent::ScanTimeout { generation } => {
                self.scanner.on_timeout(self.transport.as_mut(), generation);
            }
            CoreEvent::ConnectTimeout { handle } => {
                if let Some(device_id) = self.device_for(handle) {
                    self.with_session(&device_id, |session, ctx| session.on_connect_timeout(ctx));
                }
            }
            CoreEvent::PollTick { device_id, task_id } => self.handle_poll_tick(&device_id, task_id),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(handle) = event.handle() else {
            return;
        };
        let Some(device_id) = self.device_for(handle) else {
            debug!("Dropping event for defunct handle {}: {:?}", handle, event);
            return;
        };

        self.with_session(&device_id, move |session, ctx| match event {
            TransportEvent::LinkUp { .. } => session.on_link_up(ctx),
            TransportEvent::LinkDown { .. } => session.on_link_down(ctx),
            TransportEvent::ConnectFailed { reason, .. } => session.on_connect_failed(ctx, &reason),
            TransportEvent::DiscoveryComplete { result, .. } => {
                session.on_discovery_complete(ctx, result)
            }
            TransportEvent::CharacteristicRead {
                characteristic,
                value,
                success,
                ..
            } => session.on_characteristic_read(&characteristic, &value, success),
            TransportEvent::CharacteristicNotify {
                characteristic,
                value,
                ..
            } => session.on_notification(&characteristic, &value),
            TransportEvent::ScanResult { .. } => {}
        });
    }

    fn handle_poll_tick(&mut self, device_id: &str, task_id: u64) {
        if !self.poller.accepts(device_id, task_id) {
            return;
        }
        if !self.authorization.is_granted(Capability::Connect) {
            warn!("Stopping health probes for {}: permission missing", device_id);
            self.poller.cancel(device_id);
            self.send_log(
                format!("{} ({})", BleError::PermissionDenied, device_id),
                MessageSeverity::Error,
            );
            return;
        }
        let alive = self
            .with_session(device_id, |session, ctx| session.probe(ctx))
            .unwrap_or(false);
        if !alive {
            self.poller.cancel(device_id);
        }
    }

    fn device_for(&self, handle: ConnectionHandle) -> Option<String> {
        self.handles.get(&handle).cloned()
    }

    /// Run `f` against the session for `device_id`, then drop the session
    /// if it reached a terminal state
    fn with_session<R>(
        &mut self,
        device_id: &str,
        f: impl FnOnce(&mut ConnectionSession, &mut SessionContext<'_>) -> R,
    ) -> Option<R> {
        let session = self.sessions.get_mut(device_id)?;
        let mut ctx = SessionContext {
            transport: self.transport.as_mut(),
            registry: &self.registry,
            poller: &mut self.poller,
            events: &self.event_sender,
            poll_interval: self.settings.poll_interval(),
        };
        let result = f(session, &mut ctx);

        let state = session.state();
        if !matches!(state, ConnectionState::Connecting | ConnectionState::Discovering) {
            self.disarm_connect_timeout(device_id);
        }
        if state.is_terminal() {
            debug!("Session for {} ended in {:?}", device_id, state);
            self.sessions.remove(device_id);
            self.handles.retain(|_, id| id != device_id);
        }
        Some(result)
    }

    /// Tear everything down: stop the scan, release every connection
    /// handle, cancel every poll task, then close every log
    pub fn shutdown(&mut self) {
        info!("Shutting down {} sessions", self.sessions.len());
        self.scanner.stop(self.transport.as_mut());
        for (_, token) in self.connect_timers.drain() {
            token.cancel();
        }

        for session in self.sessions.values_mut() {
            session.release_handle(self.transport.as_mut());
        }
        self.poller.cancel_all();
        for session in self.sessions.values_mut() {
            session.finish_shutdown();
        }

        self.registry.clear_connected();
        self.sessions.clear();
        self.handles.clear();
    }

    /// Process commands and events until shutdown is requested or the
    /// command channel closes
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<CoreEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        info!("Bluetooth service running");
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        let result = match command {
            Command::StartScan(duration) => self.start_scan(duration),
            Command::StopScan => {
                self.stop_scan();
                Ok(())
            }
            Command::Connect(device_id) => self.connect(&device_id).map(|_| ()),
            Command::Disconnect(device_id) => self.disconnect(&device_id),
            Command::Shutdown => return ControlFlow::Break(()),
        };
        if let Err(e) = result {
            warn!("Command failed: {}", e);
            self.send_log(e.to_string(), MessageSeverity::Error);
        }
        ControlFlow::Continue(())
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn session(&self, device_id: &str) -> Option<&ConnectionSession> {
        self.sessions.get(device_id)
    }

    pub fn session_state(&self, device_id: &str) -> Option<ConnectionState> {
        self.sessions.get(device_id).map(|s| s.state())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn is_polling(&self, device_id: &str) -> bool {
        self.poller.is_active(device_id)
    }

    fn send_log(&self, message: String, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}
