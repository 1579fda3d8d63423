//! Bluetooth Module
//!
//! BLE session core: discovery, per-device connection lifecycle, health
//! polling, and the per-device logs written along the way.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (dispatch loop - owns sessions, handles, poll tasks)   │
//! └──────┬──────────────┬───────────────┬───────────────────┘
//!        │              │               │
//!        ▼              ▼               ▼
//! ┌───────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Scanner  │  │  Connection  │  │ HealthPoller │
//! │           │  │              │  │              │
//! │ - timed   │  │ - lifecycle  │  │ - RSSI probe │
//! │   scan    │  │ - GATT walk  │  │ - cancel     │
//! │ - dedup   │  │ - data log   │  │   tokens     │
//! └───────────┘  └──────────────┘  └──────────────┘
//!        │              │               │
//!        └──────────────┼───────────────┘
//!                       ▼
//!              Transport / Authorization
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT model, transport events, payload decoding
//! - [`transport`] - Radio and permission collaborator traits
//! - [`scanner`] - Time-bounded BLE discovery
//! - [`connection`] - Per-device connection state machine
//! - [`poller`] - Periodic liveness probes
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-memory radio for demos and tests

pub mod connection;
pub mod poller;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::{BluetoothService, Command, CoreEvent};
