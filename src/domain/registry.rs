//! Device Registry
//!
//! Tracks the peripherals discovered during the current scan window and the
//! set of devices that currently own a connection. Cloning the registry
//! yields another handle onto the same shared state.

use crate::domain::models::DiscoveredDevice;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RegistryState {
    discovered: Vec<DiscoveredDevice>,
    connected: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Membership sets stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget every discovered device (connected devices are untouched)
    pub fn clear_discovered(&self) {
        self.lock().discovered.clear();
    }

    /// Insert a sighting. Returns the new entry, or `None` if the
    /// identifier was already present.
    pub fn insert_discovered(&self, id: &str, name: Option<String>) -> Option<DiscoveredDevice> {
        let mut state = self.lock();
        if state.discovered.iter().any(|d| d.id == id) {
            return None;
        }
        let device = DiscoveredDevice::new(id, name);
        state.discovered.push(device.clone());
        Some(device)
    }

    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.lock().discovered.clone()
    }

    pub fn find_discovered(&self, id: &str) -> Option<DiscoveredDevice> {
        self.lock().discovered.iter().find(|d| d.id == id).cloned()
    }

    pub fn discovered_count(&self) -> usize {
        self.lock().discovered.len()
    }

    /// Returns false if the device was already in the connected set
    pub fn mark_connected(&self, id: &str) -> bool {
        self.lock().connected.insert(id.to_string())
    }

    pub fn mark_disconnected(&self, id: &str) -> bool {
        self.lock().connected.remove(id)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().connected.contains(id)
    }

    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().connected.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear_connected(&self) {
        self.lock().connected.clear();
    }
}
