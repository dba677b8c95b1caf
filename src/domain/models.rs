//! Provisioning domain types shared by the protocol engine and front ends.

use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

/// Maximum SSID length accepted by the device, in bytes.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum WPA passphrase length accepted by the device, in bytes.
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// Radio band of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Any,
    Band2_4Ghz,
    Band5Ghz,
}

impl Band {
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Band2_4Ghz => 1,
            Self::Band5Ghz => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::Band2_4Ghz),
            2 => Some(Self::Band5Ghz),
            _ => None,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Band2_4Ghz => write!(f, "2.4 GHz"),
            Self::Band5Ghz => write!(f, "5 GHz"),
        }
    }
}

/// Authentication scheme advertised by an access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
}

impl AuthMode {
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Wep => 1,
            Self::WpaPsk => 2,
            Self::Wpa2Psk => 3,
            Self::WpaWpa2Psk => 4,
            Self::Wpa2Enterprise => 5,
            Self::Wpa3Psk => 6,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Wep),
            2 => Some(Self::WpaPsk),
            3 => Some(Self::Wpa2Psk),
            4 => Some(Self::WpaWpa2Psk),
            5 => Some(Self::Wpa2Enterprise),
            6 => Some(Self::Wpa3Psk),
            _ => None,
        }
    }

    /// Whether joining a network with this scheme needs a passphrase.
    pub fn requires_passphrase(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Identity of a Wi-Fi network as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiInfo {
    /// Raw SSID octets. Not necessarily UTF-8.
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub band: Option<Band>,
    pub channel: u8,
    pub auth_mode: AuthMode,
}

impl WifiInfo {
    /// SSID for display. Invalid UTF-8 is replaced, never sent back.
    pub fn ssid_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.ssid)
    }

    pub fn bssid_string(&self) -> String {
        self.bssid
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// One network reported while the device scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiScanRecord {
    pub wifi: WifiInfo,
    pub rssi: Option<i8>,
}

impl WifiScanRecord {
    /// Strongest record for `ssid`. Records without RSSI rank last.
    pub fn strongest<'a>(records: &'a [WifiScanRecord], ssid: &str) -> Option<&'a WifiScanRecord> {
        records
            .iter()
            .filter(|record| record.wifi.ssid == ssid.as_bytes())
            .max_by_key(|record| record.rssi.map_or(i16::MIN, i16::from))
    }
}

/// Scan tuning passed along with `StartScan`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanParams {
    pub band: Option<Band>,
    pub passive: bool,
    pub period_ms: Option<u16>,
    pub group_channels: Option<u8>,
}

/// Credentials sent with `SetConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    pub wifi: Option<WifiInfo>,
    pub passphrase: Option<String>,
    /// Keep the credentials in RAM only; they are lost on device reboot.
    pub volatile_memory: bool,
}

impl WifiConfig {
    pub fn for_network(wifi: WifiInfo, passphrase: Option<String>) -> Self {
        Self {
            wifi: Some(wifi),
            passphrase,
            volatile_memory: false,
        }
    }
}

/// Why the device gave up joining a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailureReason {
    AuthError,
    NetworkNotFound,
    Timeout,
    FailIp,
    FailConn,
}

impl ConnectionFailureReason {
    pub fn wire_value(self) -> u8 {
        match self {
            Self::AuthError => 0,
            Self::NetworkNotFound => 1,
            Self::Timeout => 2,
            Self::FailIp => 3,
            Self::FailConn => 4,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AuthError),
            1 => Some(Self::NetworkNotFound),
            2 => Some(Self::Timeout),
            3 => Some(Self::FailIp),
            4 => Some(Self::FailConn),
            _ => None,
        }
    }
}

/// Wi-Fi join progress reported by the device.
///
/// The non-failure states form an ordered progression. Front ends use the
/// ordinal to tell whether a step is behind or ahead of the current one, so
/// the values below match the device's wire values and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiConnectionState {
    Disconnected,
    Authentication,
    Association,
    ObtainingIp,
    Connected,
    ConnectionFailed(Option<ConnectionFailureReason>),
}

impl WifiConnectionState {
    /// Wire value of `ConnectionFailed`.
    pub const FAILED_WIRE_VALUE: u8 = 5;

    /// Position in the join progression; `None` for the failure state.
    pub const fn ordinal(self) -> Option<u8> {
        match self {
            Self::Disconnected => Some(0),
            Self::Authentication => Some(1),
            Self::Association => Some(2),
            Self::ObtainingIp => Some(3),
            Self::Connected => Some(4),
            Self::ConnectionFailed(_) => None,
        }
    }

    pub fn wire_value(self) -> u8 {
        self.ordinal().unwrap_or(Self::FAILED_WIRE_VALUE)
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Authentication),
            2 => Some(Self::Association),
            3 => Some(Self::ObtainingIp),
            4 => Some(Self::Connected),
            _ => None,
        }
    }

    /// True once the progression has reached or passed `step`.
    /// A failed join has reached nothing.
    pub fn has_reached(self, step: WifiConnectionState) -> bool {
        match (self.ordinal(), step.ordinal()) {
            (Some(current), Some(step)) => current >= step,
            _ => false,
        }
    }

    /// `Connected` and `ConnectionFailed` end a provisioning attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Connected | Self::ConnectionFailed(_))
    }
}

impl fmt::Display for WifiConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Authentication => write!(f, "authenticating"),
            Self::Association => write!(f, "associating"),
            Self::ObtainingIp => write!(f, "obtaining IP"),
            Self::Connected => write!(f, "connected"),
            Self::ConnectionFailed(Some(reason)) => write!(f, "connection failed ({:?})", reason),
            Self::ConnectionFailed(None) => write!(f, "connection failed"),
        }
    }
}

/// Network-layer details of an established Wi-Fi connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip4_addr: Ipv4Addr,
}

/// Payload of a successful `GetStatus` exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: Option<WifiConnectionState>,
    pub provisioning_info: Option<WifiInfo>,
    pub connection_info: Option<ConnectionInfo>,
    pub scan_info: Option<ScanParams>,
}

/// Contents of the info characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: String,
}

/// Result code carried by every ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    InvalidArgument,
    InvalidProto,
    InternalError,
}

impl StatusCode {
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::InvalidArgument => 1,
            Self::InvalidProto => 2,
            Self::InternalError => 3,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::InvalidProto),
            3 => Some(Self::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidProto => write!(f, "invalid protocol message"),
            Self::InternalError => write!(f, "internal device error"),
        }
    }
}

/// Why a BLE session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Requested by this side.
    Success,
    LinkLoss,
    /// The peer does not expose the provisioning service.
    MissingService,
    Unknown,
}

/// Lifecycle of the BLE session with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Ready,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectionStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Ready => write!(f, "ready"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected(reason) => write!(f, "disconnected ({:?})", reason),
        }
    }
}

/// A BLE peripheral found during discovery.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
}

impl ScannedDevice {
    /// Case-insensitive match on name or address.
    pub fn matches(&self, fragment: &str) -> bool {
        let fragment = fragment.to_lowercase();
        self.name.to_lowercase().contains(&fragment)
            || self.address.to_lowercase().contains(&fragment)
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(ScannedDevice),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
