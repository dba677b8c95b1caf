//! Command-line front end for provisioning Wi-Fi credentials over BLE.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wifi_provisioner::domain::models::{
    AppEvent, DeviceStatus, MessageSeverity, ScanParams, WifiConfig, WifiConnectionState,
    WifiScanRecord,
};
use wifi_provisioner::domain::settings::{Settings, SettingsService};
use wifi_provisioner::infrastructure::bluetooth::gatt::{GattTransport, GattUuids};
use wifi_provisioner::infrastructure::bluetooth::scanner::{BleScanner, DiscoveryFilter};
use wifi_provisioner::infrastructure::bluetooth::ProvisioningService;
use wifi_provisioner::infrastructure::logging;

#[derive(Parser)]
#[command(name = "wifi-provisioner")]
#[command(about = "Provision Wi-Fi credentials onto devices over BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby provisionable devices
    Devices {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Show every BLE device, not only provisionable ones
        #[arg(long)]
        all: bool,
    },
    /// Show the device firmware version
    Info {
        /// Device name or address fragment
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Show the device's Wi-Fi status
    Status {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Let the device scan for Wi-Fi networks
    Scan {
        #[arg(short, long)]
        device: Option<String>,
        /// How long to collect results, in seconds
        #[arg(long, default_value = "5")]
        duration: u64,
    },
    /// Send Wi-Fi credentials to the device
    Provision {
        #[arg(short, long)]
        device: Option<String>,
        /// Network to join
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        passphrase: Option<String>,
        /// Keep credentials in RAM only
        #[arg(long)]
        volatile: bool,
        /// How long to scan for the network, in seconds
        #[arg(long, default_value = "5")]
        scan_duration: u64,
    },
    /// Erase the network stored on the device
    Forget {
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Starting Wi-Fi provisioner");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(report_events(event_rx));

    let scanner = BleScanner::new(event_tx.clone()).await?;
    let settings = settings_service.get().clone();

    let target = match &cli.command {
        Commands::Devices { duration, all } => {
            return list_devices(&scanner, &settings, *duration, *all).await;
        }
        Commands::Info { device }
        | Commands::Status { device }
        | Commands::Scan { device, .. }
        | Commands::Provision { device, .. }
        | Commands::Forget { device } => device
            .clone()
            .or_else(|| settings.last_connected_address.clone()),
    };

    let service = connect(&scanner, &mut settings_service, target, event_tx).await?;
    let outcome = run(&service, cli.command).await;
    if let Err(e) = service.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    outcome
}

fn discovery_filter(settings: &Settings, show_all: bool) -> DiscoveryFilter {
    DiscoveryFilter {
        service_uuid: settings.ble_service_uuid.clone(),
        show_all_devices: show_all || settings.debug_show_all_devices,
        name_filter: settings.device_name_filter.clone(),
    }
}

async fn list_devices(
    scanner: &BleScanner,
    settings: &Settings,
    duration: Option<u64>,
    show_all: bool,
) -> Result<()> {
    let duration = duration.unwrap_or(settings.discovery_duration_secs);
    println!("Scanning for devices ({} seconds)...", duration);

    let devices = scanner
        .discover(
            Duration::from_secs(duration),
            &discovery_filter(settings, show_all),
        )
        .await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .signal_strength
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", device.name, device.address, rssi);
    }
    Ok(())
}

async fn connect(
    scanner: &BleScanner,
    settings_service: &mut SettingsService,
    target: Option<String>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<ProvisioningService> {
    let settings = settings_service.get().clone();
    let (peripheral, device) = scanner
        .find(
            Duration::from_secs(settings.discovery_duration_secs),
            &discovery_filter(&settings, false),
            target.as_deref(),
        )
        .await?;
    println!("Connecting to {} ({})...", device.name, device.address);

    let transport = GattTransport::new(
        scanner.adapter().clone(),
        peripheral,
        GattUuids::from_settings(&settings)?,
    );
    let service = ProvisioningService::new(Arc::new(transport), &settings, event_tx).await?;
    service.connect().await?;

    if let Err(e) = settings_service.remember_device(&device.address) {
        warn!("Could not remember device: {}", e);
    }
    Ok(service)
}

async fn run(service: &ProvisioningService, command: Commands) -> Result<()> {
    match command {
        Commands::Devices { .. } => Ok(()),
        Commands::Info { .. } => {
            let info = service.read_info().await?;
            println!("Firmware version: {}", info.version);
            Ok(())
        }
        Commands::Status { .. } => {
            print_status(&service.get_status().await?);
            Ok(())
        }
        Commands::Scan { duration, .. } => {
            let records = scan(service, Duration::from_secs(duration)).await?;
            println!("\nFound {} networks:", records.len());
            for record in &records {
                print_record(record);
            }
            Ok(())
        }
        Commands::Provision {
            ssid,
            passphrase,
            volatile,
            scan_duration,
            ..
        } => provision(service, &ssid, passphrase, volatile, scan_duration).await,
        Commands::Forget { .. } => {
            service.forget_config().await?;
            println!("Stored network forgotten.");
            Ok(())
        }
    }
}

/// Scan for `window`, strongest networks first.
async fn scan(service: &ProvisioningService, window: Duration) -> Result<Vec<WifiScanRecord>> {
    println!("Scanning for networks...");
    let mut session = service.scan(ScanParams::default()).await?;
    let collected = session.collect_for(window).await;
    session.stop().await?;

    let mut records = collected?;
    records.sort_by_key(|record| std::cmp::Reverse(record.rssi.map_or(i16::MIN, i16::from)));
    Ok(records)
}

async fn provision(
    service: &ProvisioningService,
    ssid: &str,
    passphrase: Option<String>,
    volatile: bool,
    scan_duration: u64,
) -> Result<()> {
    let records = scan(service, Duration::from_secs(scan_duration)).await?;
    let Some(record) = WifiScanRecord::strongest(&records, ssid) else {
        bail!("Network {:?} not found", ssid);
    };
    if record.wifi.auth_mode.requires_passphrase() && passphrase.is_none() {
        bail!("Network {:?} requires a passphrase", ssid);
    }
    print_record(record);

    let config = WifiConfig {
        wifi: Some(record.wifi.clone()),
        passphrase,
        volatile_memory: volatile,
    };
    let mut progress = service.set_config(config).await?;
    if !progress.is_following() {
        println!("Credentials accepted.");
        return Ok(());
    }

    let mut last = None;
    while let Some(state) = progress.next().await {
        let state = state?;
        println!("  {}", state);
        last = Some(state);
    }

    match last {
        Some(WifiConnectionState::Connected) => {
            println!("Device joined {}.", ssid);
            Ok(())
        }
        Some(state) => bail!("Provisioning did not complete: {}", state),
        None => bail!("Device reported no progress"),
    }
}

fn print_status(status: &DeviceStatus) {
    match status.state {
        Some(state) => println!("Wi-Fi state: {}", state),
        None => println!("Wi-Fi state: unknown"),
    }
    if let Some(wifi) = &status.provisioning_info {
        println!(
            "Provisioned network: {} ({}, channel {})",
            wifi.ssid_lossy(),
            wifi.bssid_string(),
            wifi.channel
        );
    }
    if let Some(conn) = &status.connection_info {
        println!("IP address: {}", conn.ip4_addr);
    }
    if status.scan_info.is_some() {
        println!("A scan is in progress");
    }
}

fn print_record(record: &WifiScanRecord) {
    let rssi = record
        .rssi
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "N/A".to_string());
    println!(
        "  {:<32} {} ch {:>3} {:?} RSSI: {}",
        record.wifi.ssid_lossy(),
        record.wifi.bssid_string(),
        record.wifi.channel,
        record.wifi.auth_mode,
        rssi
    );
}

async fn report_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::LogMessage(message) => match message.severity {
                MessageSeverity::Error => error!("{}", message.message),
                MessageSeverity::Warning => warn!("{}", message.message),
                MessageSeverity::Success => println!("{}", message.message),
                MessageSeverity::Info => debug!("{}", message.message),
            },
            AppEvent::ConnectionStatus(status) => debug!("Connection status: {}", status),
            AppEvent::DeviceFound(device) => debug!("Found {} ({})", device.name, device.address),
        }
    }
}
