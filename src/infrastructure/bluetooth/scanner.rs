//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of provisionable devices.

use crate::domain::models::{AppEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::infrastructure::bluetooth::protocol;
use anyhow::{anyhow, Result};
use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a discovery pass looks for.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    /// Service UUID advertised by provisionable devices
    pub service_uuid: String,
    /// Show every BLE device regardless of advertised services
    pub show_all_devices: bool,
    /// Case-insensitive fragment of the advertised name
    pub name_filter: Option<String>,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID.to_string(),
            show_all_devices: false,
            name_filter: None,
        }
    }
}

/// BLE Scanner for discovering provisionable devices
pub struct BleScanner {
    adapter: Adapter,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    /// Create a scanner on the first available adapter
    pub async fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        Ok(Self {
            adapter,
            event_sender,
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration` and report every matching device.
    pub async fn discover(
        &self,
        duration: Duration,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<ScannedDevice>> {
        let found = self.scan(duration, filter).await?;
        let devices: Vec<ScannedDevice> = found.into_iter().map(|(_, device)| device).collect();

        self.send_log(
            &format!("Found {} device(s)", devices.len()),
            MessageSeverity::Info,
        );
        Ok(devices)
    }

    /// Locate a peripheral whose name or address contains `target`,
    /// or the first matching device when `target` is `None`.
    pub async fn find(
        &self,
        duration: Duration,
        filter: &DiscoveryFilter,
        target: Option<&str>,
    ) -> Result<(Peripheral, ScannedDevice)> {
        let found = self.scan(duration, filter).await?;
        found
            .into_iter()
            .find(|(_, device)| target.map_or(true, |t| device.matches(t)))
            .ok_or_else(|| match target {
                Some(t) => anyhow!("No device matching {:?} found", t),
                None => anyhow!("No provisionable device found"),
            })
    }

    async fn scan(
        &self,
        duration: Duration,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<(Peripheral, ScannedDevice)>> {
        let service_uuid = protocol::parse_uuid(&filter.service_uuid)?;
        info!("Starting BLE scan for service UUID: {}", service_uuid);
        self.send_log("Scanning for devices...", MessageSeverity::Info);

        let scan_filter = if filter.show_all_devices {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: vec![service_uuid],
            }
        };
        self.adapter.start_scan(scan_filter).await?;
        tokio::time::sleep(duration).await;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            if !filter.show_all_devices && !props.services.contains(&service_uuid) {
                debug!("Skipping {} without provisioning service", props.address);
                continue;
            }
            let device = scanned_device(&props);
            if let Some(fragment) = &filter.name_filter {
                if !device.matches(fragment) {
                    continue;
                }
            }
            let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
            found.push((peripheral, device));
        }

        self.adapter.stop_scan().await?;
        info!("Scan finished, {} device(s) matched", found.len());
        Ok(found)
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

fn scanned_device(props: &PeripheralProperties) -> ScannedDevice {
    ScannedDevice {
        name: props
            .local_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        address: props.address.to_string(),
        signal_strength: props.rssi,
    }
}
