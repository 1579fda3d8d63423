use chrono::{DateTime, Local};

/// Name shown for peripherals that do not advertise one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// A peripheral seen during the current scan window
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    /// Stable hardware address, e.g. `AA:BB:CC:DD:EE:FF`
    pub id: String,
    pub name: Option<String>,
    pub first_seen: DateTime<Local>,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.filter(|n| !n.trim().is_empty()),
            first_seen: Local::now(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// Notices delivered to the UI collaborator
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(DiscoveredDevice),
    ScanFinished { found: usize },
    ConnectionStatus {
        device_id: String,
        status: ConnectionStatus,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
