//! BLE Scanner Module
//!
//! Runs a time-bounded discovery scan and feeds deduplicated results into
//! the [`DeviceRegistry`].

use crate::domain::error::BleResult;
use crate::domain::models::{AppEvent, DiscoveredDevice, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::service::CoreEvent;
use crate::infrastructure::bluetooth::transport::Transport;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default length of a discovery window
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// BLE Scanner for discovering nearby peripherals
pub struct BleScanner {
    registry: DeviceRegistry,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    core_sender: mpsc::UnboundedSender<CoreEvent>,
    active: bool,
    generation: u64,
    timer: Option<CancellationToken>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(
        registry: DeviceRegistry,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        core_sender: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        Self {
            registry,
            event_sender,
            core_sender,
            active: false,
            generation: 0,
            timer: None,
        }
    }

    /// Start a scan that stops itself after `duration`.
    ///
    /// Permission and radio checks belong to the caller; this only fails if
    /// the transport refuses to start, in which case nothing changes.
    pub fn start<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        duration: Duration,
    ) -> BleResult<()> {
        // Stop any existing scan
        self.stop(transport);

        transport.start_scan()?;
        self.registry.clear_discovered();
        self.active = true;
        self.generation += 1;

        info!("Starting BLE scan for {:?}", duration);
        self.send_log("Scanning...", MessageSeverity::Info);

        let generation = self.generation;
        let sender = self.core_sender.clone();
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let _ = sender.send(CoreEvent::ScanTimeout { generation });
                }
            }
        });
        self.timer = Some(token);

        Ok(())
    }

    /// Record a scan result. Returns the device if it was newly inserted.
    pub fn on_result(&mut self, device_id: &str, name: Option<String>) -> Option<DiscoveredDevice> {
        if !self.active {
            debug!("Ignoring scan result for {} outside a scan", device_id);
            return None;
        }
        let device = self.registry.insert_discovered(device_id, name)?;
        debug!("Found device: {}", device.id);
        let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
        Some(device)
    }

    /// Handle the scan timer. Timers from earlier scans are ignored.
    pub fn on_timeout<T: Transport + ?Sized>(&mut self, transport: &mut T, generation: u64) {
        if generation == self.generation {
            self.stop(transport);
        }
    }

    /// Stop scanning. Does nothing when no scan is active.
    pub fn stop<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }

        info!("Stopping BLE scan...");
        if let Err(e) = transport.stop_scan() {
            warn!("Transport failed to stop scan: {}", e);
        }

        let found = self.registry.discovered_count();
        self.send_log(
            &format!("Scan completed. Found {} devices.", found),
            MessageSeverity::Info,
        );
        let _ = self.event_sender.send(AppEvent::ScanFinished { found });
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.active
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{SimulatedDevice, SimulatedTransport};

    fn setup() -> (
        BleScanner,
        SimulatedTransport,
        DeviceRegistry,
        mpsc::UnboundedReceiver<AppEvent>,
        mpsc::UnboundedReceiver<CoreEvent>,
    ) {
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new();
        let scanner = BleScanner::new(registry.clone(), ui_tx, core_tx);
        let transport = SimulatedTransport::new(vec![
            SimulatedDevice::new("AA:AA", Some("Pixel Buds")),
            SimulatedDevice::new("BB:BB", None),
        ]);
        (scanner, transport, registry, ui_rx, core_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_duration() {
        let (mut scanner, mut transport, _registry, mut ui_rx, mut core_rx) = setup();
        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        assert!(scanner.is_scanning());

        let start = tokio::time::Instant::now();
        let generation = match core_rx.recv().await.unwrap() {
            CoreEvent::ScanTimeout { generation } => generation,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(start.elapsed(), DEFAULT_SCAN_DURATION);

        scanner.on_timeout(&mut transport, generation);
        assert!(!scanner.is_scanning());
        assert_eq!(transport.stop_scan_calls(), 1);

        let finished = std::iter::from_fn(|| ui_rx.try_recv().ok())
            .any(|e| matches!(e, AppEvent::ScanFinished { found: 0 }));
        assert!(finished);
    }

    #[tokio::test]
    async fn test_results_are_deduplicated() {
        let (mut scanner, mut transport, registry, mut ui_rx, _core_rx) = setup();
        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();

        assert!(scanner.on_result("AA:AA", Some("Pixel Buds".into())).is_some());
        assert!(scanner.on_result("BB:BB", None).is_some());
        assert!(scanner.on_result("AA:AA", Some("Pixel Buds".into())).is_none());

        assert_eq!(registry.discovered_count(), 2);
        let found = std::iter::from_fn(|| ui_rx.try_recv().ok())
            .filter(|e| matches!(e, AppEvent::DeviceFound(_)))
            .count();
        assert_eq!(found, 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_stale_timeouts_are_ignored() {
        let (mut scanner, mut transport, _registry, _ui_rx, _core_rx) = setup();
        scanner.stop(&mut transport);
        assert_eq!(transport.stop_scan_calls(), 0);

        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        assert_eq!(transport.stop_scan_calls(), 1);

        // Timer from the first scan must not end the second one
        scanner.on_timeout(&mut transport, 1);
        assert!(scanner.is_scanning());

        scanner.stop(&mut transport);
        scanner.stop(&mut transport);
        assert_eq!(transport.stop_scan_calls(), 2);
    }

    #[tokio::test]
    async fn test_new_scan_clears_registry_and_late_results_are_dropped() {
        let (mut scanner, mut transport, registry, _ui_rx, _core_rx) = setup();
        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        scanner.on_result("AA:AA", None);
        scanner.stop(&mut transport);

        assert!(scanner.on_result("CC:CC", None).is_none());
        assert_eq!(registry.discovered_count(), 1);

        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        assert_eq!(registry.discovered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_the_timer() {
        let (mut scanner, mut transport, _registry, _ui_rx, mut core_rx) = setup();
        scanner.start(&mut transport, DEFAULT_SCAN_DURATION).unwrap();
        scanner.stop(&mut transport);

        tokio::time::sleep(DEFAULT_SCAN_DURATION * 2).await;
        assert!(core_rx.try_recv().is_err());
    }
}
