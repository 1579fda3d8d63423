//! BLE session logger
//!
//! Scans for nearby Bluetooth Low Energy peripherals, connects to the ones
//! the user picks, walks their GATT tree, subscribes to notifications, and
//! keeps an append-only info/data log per connected device.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{BleError, BleResult};
pub use infrastructure::bluetooth::{BluetoothService, Command, CoreEvent};
