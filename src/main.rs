use ble_session_logger::domain::models::AppEvent;
use ble_session_logger::domain::settings::SettingsService;
use ble_session_logger::infrastructure::bluetooth::protocol::{
    properties, GattCharacteristic, GattService,
};
use ble_session_logger::infrastructure::bluetooth::simulated::{
    SimulatedDevice, SimulatedTransport,
};
use ble_session_logger::infrastructure::bluetooth::transport::GrantAll;
use ble_session_logger::infrastructure::device_log::LocalFilesystem;
use ble_session_logger::infrastructure::logging::init_logger;
use ble_session_logger::{BluetoothService, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

const BUDS_ADDRESS: &str = "F4:7D:EF:12:34:56";

/// Peripherals the simulated radio advertises
fn demo_transport() -> SimulatedTransport {
    SimulatedTransport::new(vec![
        SimulatedDevice::new(BUDS_ADDRESS, Some("Pixel Buds"))
            .with_rssi(-58)
            .with_services(vec![
                GattService::new(
                    "180A",
                    vec![
                        GattCharacteristic::new("2A29", properties::READ),
                        GattCharacteristic::new("2A24", properties::READ),
                    ],
                ),
                GattService::new(
                    "180F",
                    vec![GattCharacteristic::new(
                        "2A19",
                        properties::READ | properties::NOTIFY,
                    )],
                ),
            ]),
        SimulatedDevice::new("C0:FF:EE:00:00:01", None).with_rssi(-81),
    ])
}

fn report(event: AppEvent) {
    match event {
        AppEvent::DeviceFound(device) => {
            info!("Found {} ({})", device.display_name(), device.id)
        }
        AppEvent::ScanFinished { found } => info!("Scan finished with {} devices", found),
        AppEvent::ConnectionStatus { device_id, status } => info!("{}: {:?}", device_id, status),
        AppEvent::LogMessage(message) => info!("[{:?}] {}", message.severity, message.message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()
        .unwrap_or_else(|_| SettingsService::from_path(PathBuf::from("settings.json")));
    let settings = settings_service.get().clone();
    let _logging = init_logger(&settings.log_settings)?;
    info!("Starting BLE session logger");

    let transport = demo_transport();
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (service, events) = BluetoothService::new(
        Box::new(transport.clone()),
        Arc::new(GrantAll),
        Arc::new(LocalFilesystem),
        settings.clone(),
        ui_tx,
    );
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(service.run(events, commands_rx));

    commands.send(Command::StartScan(None))?;
    let mut found = Vec::new();
    while let Some(event) = ui_rx.recv().await {
        if let AppEvent::DeviceFound(device) = &event {
            found.push(device.id.clone());
        }
        let finished = matches!(event, AppEvent::ScanFinished { .. });
        report(event);
        if finished {
            break;
        }
    }

    for device_id in &found {
        commands.send(Command::Connect(device_id.clone()))?;
    }

    // Stay connected for a few probe cycles while the buds report battery level
    let deadline = Instant::now() + settings.poll_interval() * 3;
    let mut battery: u8 = 100;
    while Instant::now() < deadline {
        tokio::select! {
            Some(event) = ui_rx.recv() => report(event),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if let Some(handle) = transport.handle_for(BUDS_ADDRESS) {
                    transport.notify(handle, "2A19", &[battery]);
                    battery = battery.saturating_sub(1);
                }
            }
        }
    }

    commands.send(Command::Shutdown)?;
    if let Err(e) = worker.await {
        warn!("Bluetooth service task failed: {}", e);
    }
    info!("Device logs written under {}", settings.log_root);
    Ok(())
}
