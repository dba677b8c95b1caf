use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "wifi_provisioner".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Service Layout
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_info_uuid")]
    pub ble_info_char_uuid: String,
    #[serde(default = "default_control_point_uuid")]
    pub ble_control_point_char_uuid: String,
    #[serde(default = "default_data_out_uuid")]
    pub ble_data_out_char_uuid: String,

    // Protocol Timeouts
    #[serde(default = "default_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub notification_timeout_ms: u64,

    // Connect Retry Policy
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    // Provisioning
    /// Devices that report join progress on the data-out channel after
    /// `SetConfig`. When false, `SetConfig` completes with its ack.
    #[serde(default = "default_true")]
    pub follow_provisioning_progress: bool,

    // Discovery
    #[serde(default = "default_discovery_duration_secs")]
    pub discovery_duration_secs: u64,
    #[serde(default)]
    pub device_name_filter: Option<String>,
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_info_char_uuid: default_info_uuid(),
            ble_control_point_char_uuid: default_control_point_uuid(),
            ble_data_out_char_uuid: default_data_out_uuid(),

            response_timeout_ms: default_timeout_ms(),
            notification_timeout_ms: default_timeout_ms(),

            connect_max_attempts: default_connect_max_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),

            follow_provisioning_progress: default_true(),

            discovery_duration_secs: default_discovery_duration_secs(),
            device_name_filter: None,
            debug_show_all_devices: false,
            last_connected_address: None,
        }
    }
}

impl Settings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

fn default_service_uuid() -> String {
    "14387800-130c-49e7-b877-2881c89cb258".to_string()
}
fn default_info_uuid() -> String {
    "14387801-130c-49e7-b877-2881c89cb258".to_string()
}
fn default_control_point_uuid() -> String {
    "14387802-130c-49e7-b877-2881c89cb258".to_string()
}
fn default_data_out_uuid() -> String {
    "14387803-130c-49e7-b877-2881c89cb258".to_string()
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_connect_max_attempts() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    100
}
fn default_discovery_duration_secs() -> u64 {
    5
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WifiProvisioner");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_address.as_deref() != Some(address) {
            self.settings.last_connected_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }
}
