use thiserror::Error;

/// Failures surfaced by the BLE session core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("bluetooth permission denied")]
    PermissionDenied,

    #[error("bluetooth radio unavailable")]
    RadioUnavailable,

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("connection to {device_id} failed: {reason}")]
    ConnectFailed { device_id: String, reason: String },

    #[error("service discovery on {device_id} failed: {reason}")]
    DiscoveryFailed { device_id: String, reason: String },

    #[error("failed to write {stream} log for {device_id}: {reason}")]
    LogWriteFailed {
        device_id: String,
        stream: &'static str,
        reason: String,
    },

    #[error("not connected to {0}")]
    NotConnected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type BleResult<T> = Result<T, BleError>;
