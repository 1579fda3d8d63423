//! GATT Protocol Definitions
//!
//! Types shared between the transport and the session core: connection
//! handles, the discovered service tree, transport callback events, and
//! payload decoding for the data log.

use std::fmt;

/// Opaque handle issued by the transport for one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Characteristic property bits (Bluetooth Core, Vol 3, Part G, 3.3.1.1)
pub mod properties {
    pub const READ: u8 = 0x02;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub properties: u8,
}

impl GattCharacteristic {
    pub fn new(uuid: impl Into<String>, properties: u8) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
        }
    }

    pub fn can_notify(&self) -> bool {
        self.properties & properties::NOTIFY != 0
    }
}

/// A primary service with its characteristics in the order the peripheral reported them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: String,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: impl Into<String>, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics,
        }
    }
}

/// Operations gated by the authorization collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
}

/// Callbacks delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ScanResult {
        device_id: String,
        name: Option<String>,
    },
    LinkUp {
        handle: ConnectionHandle,
    },
    LinkDown {
        handle: ConnectionHandle,
    },
    ConnectFailed {
        handle: ConnectionHandle,
        reason: String,
    },
    DiscoveryComplete {
        handle: ConnectionHandle,
        result: Result<Vec<GattService>, String>,
    },
    CharacteristicRead {
        handle: ConnectionHandle,
        characteristic: String,
        value: Vec<u8>,
        success: bool,
    },
    CharacteristicNotify {
        handle: ConnectionHandle,
        characteristic: String,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Self::ScanResult { .. } => None,
            Self::LinkUp { handle }
            | Self::LinkDown { handle }
            | Self::ConnectFailed { handle, .. }
            | Self::DiscoveryComplete { handle, .. }
            | Self::CharacteristicRead { handle, .. }
            | Self::CharacteristicNotify { handle, .. } => Some(*handle),
        }
    }
}

/// Render a characteristic value for the data log.
///
/// Printable UTF-8 is written as text, anything else as hex bytes.
pub fn decode_payload(value: &[u8]) -> String {
    if value.is_empty() {
        return "(empty)".to_string();
    }
    match std::str::from_utf8(value) {
        Ok(text) if text.chars().all(|c| !c.is_control() || c == '\t') => text.to_string(),
        _ => {
            let hex: Vec<String> = value.iter().map(|b| format!("{:02X}", b)).collect();
            format!("0x{}", hex.join(""))
        }
    }
}
