//! Wi-Fi Provisioning Protocol
//!
//! UUIDs, opcodes and the binary framing of commands, acks and result frames.
//! Everything here is pure: no I/O, no clocks, no randomness.
//!
//! # Frame Layouts (little-endian)
//!
//! ```text
//! command       := opcode:u8 body
//!   START_SCAN  := scan_params
//!   SET_CONFIG  := wifi_info flags:u8 [pass_len:u8 passphrase]
//!                  flags bit 0: passphrase present, bit 1: volatile memory
//!
//! scan_params   := flags:u8 [band:u8] [period_ms:u16] [group_channels:u8]
//!                  flags bit 0: band, bit 1: passive, bit 2: period, bit 3: group
//! wifi_info     := ssid_len:u8 ssid bssid:[u8; 6] flags:u8 [band:u8] channel:u8 auth:u8
//!                  flags bit 0: band present
//!
//! ack           := opcode:u8 status:u8 [device_status]
//!                  device_status only for GET_STATUS with SUCCESS
//! device_status := flags:u8 [state] [wifi_info] [ipv4:[u8; 4]] [scan_params]
//!                  flags bit 0: state, bit 1: provisioning info,
//!                        bit 2: connection info, bit 3: scan info
//! state         := value:u8 [reason:u8]   reason only when value == 5, 0xFF = none
//!
//! result        := 0x01 wifi_info has_rssi:u8 [rssi:i8]    scan record
//!                | 0x02 state                              connection state
//! ```

use crate::domain::models::{
    AuthMode, Band, ConnectionFailureReason, ConnectionInfo, DeviceInfo, DeviceStatus,
    ScanParams, StatusCode, WifiConfig, WifiConnectionState, WifiInfo, WifiScanRecord,
    MAX_PASSPHRASE_LEN, MAX_SSID_LEN,
};
use crate::error::{EncodingError, MalformedFrame};
use std::net::Ipv4Addr;
use tracing::trace;
use uuid::Uuid;

/// Wi-Fi Provisioning Service UUID
pub const SERVICE_UUID: &str = "14387800-130c-49e7-b877-2881c89cb258";

/// Version/Info Characteristic UUID (read)
pub const INFO_CHAR_UUID: &str = "14387801-130c-49e7-b877-2881c89cb258";

/// Control Point Characteristic UUID (write, indicate)
pub const CONTROL_POINT_CHAR_UUID: &str = "14387802-130c-49e7-b877-2881c89cb258";

/// Data Out Characteristic UUID (notify)
pub const DATA_OUT_CHAR_UUID: &str = "14387803-130c-49e7-b877-2881c89cb258";

const RESULT_TAG_SCAN_RECORD: u8 = 0x01;
const RESULT_TAG_STATE: u8 = 0x02;

const NO_REASON: u8 = 0xFF;
const BSSID_LEN: usize = 6;

/// Command opcodes written to the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    GetStatus,
    StartScan,
    StopScan,
    SetConfig,
    ForgetConfig,
}

impl OpCode {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::GetStatus => 0x01,
            Self::StartScan => 0x02,
            Self::StopScan => 0x03,
            Self::SetConfig => 0x04,
            Self::ForgetConfig => 0x05,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::GetStatus),
            0x02 => Some(Self::StartScan),
            0x03 => Some(Self::StopScan),
            0x04 => Some(Self::SetConfig),
            0x05 => Some(Self::ForgetConfig),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetStatus => "GET_STATUS",
            Self::StartScan => "START_SCAN",
            Self::StopScan => "STOP_SCAN",
            Self::SetConfig => "SET_CONFIG",
            Self::ForgetConfig => "FORGET_CONFIG",
        }
    }
}

/// Commands understood by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetStatus,
    StartScan(ScanParams),
    StopScan,
    SetConfig(WifiConfig),
    ForgetConfig,
}

impl Command {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::GetStatus => OpCode::GetStatus,
            Self::StartScan(_) => OpCode::StartScan,
            Self::StopScan => OpCode::StopScan,
            Self::SetConfig(_) => OpCode::SetConfig,
            Self::ForgetConfig => OpCode::ForgetConfig,
        }
    }
}

/// Body of an ack, which depends on the command it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPayload {
    None,
    DeviceStatus(DeviceStatus),
}

/// The single indication answering a control point write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub opcode: OpCode,
    pub status: StatusCode,
    pub payload: AckPayload,
}

/// One notification on the data-out channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFrame {
    ScanRecord(WifiScanRecord),
    ConnectionState(WifiConnectionState),
}

impl ResultFrame {
    /// A connection state that ends a provisioning attempt.
    pub fn is_terminal_state(&self) -> bool {
        matches!(self, Self::ConnectionState(state) if state.is_terminal())
    }
}

/// Serialize a command for the control point.
pub fn encode(command: &Command) -> Result<Vec<u8>, EncodingError> {
    let mut out = vec![command.opcode().as_byte()];
    match command {
        Command::GetStatus | Command::StopScan | Command::ForgetConfig => {}
        Command::StartScan(params) => put_scan_params(&mut out, params),
        Command::SetConfig(config) => put_wifi_config(&mut out, config)?,
    }
    trace!("Encoded {}: {:02X?}", command.opcode().name(), out);
    Ok(out)
}

/// Parse a control point indication.
pub fn decode_ack(bytes: &[u8]) -> Result<AckResponse, MalformedFrame> {
    let mut reader = FrameReader::new(bytes);
    let raw_opcode = reader.u8()?;
    let opcode = OpCode::from_byte(raw_opcode).ok_or(MalformedFrame::UnknownOpcode(raw_opcode))?;
    let raw_status = reader.u8()?;
    let status = StatusCode::from_wire(raw_status).ok_or(MalformedFrame::UnknownStatus(raw_status))?;

    let payload = if opcode == OpCode::GetStatus && status == StatusCode::Success {
        AckPayload::DeviceStatus(read_device_status(&mut reader)?)
    } else {
        AckPayload::None
    };
    reader.finish()?;

    Ok(AckResponse {
        opcode,
        status,
        payload,
    })
}

/// Parse a data-out notification.
pub fn decode_result(bytes: &[u8]) -> Result<ResultFrame, MalformedFrame> {
    let mut reader = FrameReader::new(bytes);
    let frame = match reader.u8()? {
        RESULT_TAG_SCAN_RECORD => {
            let wifi = read_wifi_info(&mut reader)?;
            let rssi = match reader.u8()? {
                0 => None,
                1 => Some(reader.u8()? as i8),
                other => {
                    return Err(MalformedFrame::InvalidValue {
                        field: "has_rssi",
                        value: other,
                    })
                }
            };
            ResultFrame::ScanRecord(WifiScanRecord { wifi, rssi })
        }
        RESULT_TAG_STATE => ResultFrame::ConnectionState(read_state(&mut reader)?),
        tag => return Err(MalformedFrame::UnknownTag(tag)),
    };
    reader.finish()?;
    Ok(frame)
}

/// Interpret the info characteristic. Never fails: the value is informational.
pub fn decode_info(bytes: &[u8]) -> DeviceInfo {
    let version = if let Ok(raw) = <[u8; 4]>::try_from(bytes) {
        u32::from_le_bytes(raw).to_string()
    } else {
        match std::str::from_utf8(bytes) {
            Ok(text) if !text.is_empty() && !text.chars().any(char::is_control) => {
                text.to_string()
            }
            _ => bytes.iter().map(|b| format!("{:02X}", b)).collect(),
        }
    };
    DeviceInfo { version }
}

/// Parse a UUID string from settings.
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|e| anyhow::anyhow!("Invalid UUID {:?}: {}", uuid_str, e))
}

fn put_scan_params(out: &mut Vec<u8>, params: &ScanParams) {
    let mut flags = 0u8;
    if params.band.is_some() {
        flags |= 0x01;
    }
    if params.passive {
        flags |= 0x02;
    }
    if params.period_ms.is_some() {
        flags |= 0x04;
    }
    if params.group_channels.is_some() {
        flags |= 0x08;
    }
    out.push(flags);
    if let Some(band) = params.band {
        out.push(band.wire_value());
    }
    if let Some(period) = params.period_ms {
        out.extend_from_slice(&period.to_le_bytes());
    }
    if let Some(group) = params.group_channels {
        out.push(group);
    }
}

fn put_wifi_info(out: &mut Vec<u8>, info: &WifiInfo) -> Result<(), EncodingError> {
    let ssid = info.ssid.as_slice();
    if ssid.is_empty() {
        return Err(EncodingError::MissingField("ssid"));
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(EncodingError::FieldTooLong {
            field: "ssid",
            max: MAX_SSID_LEN,
            actual: ssid.len(),
        });
    }
    out.push(ssid.len() as u8);
    out.extend_from_slice(ssid);
    out.extend_from_slice(&info.bssid);
    match info.band {
        Some(band) => out.extend_from_slice(&[0x01, band.wire_value()]),
        None => out.push(0x00),
    }
    out.push(info.channel);
    out.push(info.auth_mode.wire_value());
    Ok(())
}

fn put_wifi_config(out: &mut Vec<u8>, config: &WifiConfig) -> Result<(), EncodingError> {
    let wifi = config.wifi.as_ref().ok_or(EncodingError::MissingField("wifi"))?;
    put_wifi_info(out, wifi)?;

    let passphrase = config.passphrase.as_deref().filter(|p| !p.is_empty());
    if passphrase.is_none() && wifi.auth_mode.requires_passphrase() {
        return Err(EncodingError::MissingField("passphrase"));
    }

    let mut flags = 0u8;
    if passphrase.is_some() {
        flags |= 0x01;
    }
    if config.volatile_memory {
        flags |= 0x02;
    }
    out.push(flags);

    if let Some(passphrase) = passphrase {
        let bytes = passphrase.as_bytes();
        if bytes.len() > MAX_PASSPHRASE_LEN {
            return Err(EncodingError::FieldTooLong {
                field: "passphrase",
                max: MAX_PASSPHRASE_LEN,
                actual: bytes.len(),
            });
        }
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    Ok(())
}

fn read_scan_params(reader: &mut FrameReader<'_>) -> Result<ScanParams, MalformedFrame> {
    let flags = reader.u8()?;
    let band = if flags & 0x01 != 0 {
        Some(reader.band()?)
    } else {
        None
    };
    let passive = flags & 0x02 != 0;
    let period_ms = if flags & 0x04 != 0 {
        Some(reader.u16_le()?)
    } else {
        None
    };
    let group_channels = if flags & 0x08 != 0 {
        Some(reader.u8()?)
    } else {
        None
    };
    Ok(ScanParams {
        band,
        passive,
        period_ms,
        group_channels,
    })
}

fn read_wifi_info(reader: &mut FrameReader<'_>) -> Result<WifiInfo, MalformedFrame> {
    let ssid_len = reader.u8()? as usize;
    let ssid = reader.take(ssid_len)?.to_vec();
    let mut bssid = [0u8; BSSID_LEN];
    bssid.copy_from_slice(reader.take(BSSID_LEN)?);
    let band = match reader.u8()? {
        0 => None,
        1 => Some(reader.band()?),
        other => {
            return Err(MalformedFrame::InvalidValue {
                field: "band_present",
                value: other,
            })
        }
    };
    let channel = reader.u8()?;
    let raw_auth = reader.u8()?;
    let auth_mode = AuthMode::from_wire(raw_auth).ok_or(MalformedFrame::InvalidValue {
        field: "auth_mode",
        value: raw_auth,
    })?;
    Ok(WifiInfo {
        ssid,
        bssid,
        band,
        channel,
        auth_mode,
    })
}

fn read_state(reader: &mut FrameReader<'_>) -> Result<WifiConnectionState, MalformedFrame> {
    let value = reader.u8()?;
    if value == WifiConnectionState::FAILED_WIRE_VALUE {
        let raw_reason = reader.u8()?;
        let reason = if raw_reason == NO_REASON {
            None
        } else {
            Some(
                ConnectionFailureReason::from_wire(raw_reason).ok_or(
                    MalformedFrame::InvalidValue {
                        field: "failure_reason",
                        value: raw_reason,
                    },
                )?,
            )
        };
        return Ok(WifiConnectionState::ConnectionFailed(reason));
    }
    WifiConnectionState::from_ordinal(value).ok_or(MalformedFrame::InvalidValue {
        field: "state",
        value,
    })
}

fn read_device_status(reader: &mut FrameReader<'_>) -> Result<DeviceStatus, MalformedFrame> {
    let flags = reader.u8()?;
    let state = if flags & 0x01 != 0 {
        Some(read_state(reader)?)
    } else {
        None
    };
    let provisioning_info = if flags & 0x02 != 0 {
        Some(read_wifi_info(reader)?)
    } else {
        None
    };
    let connection_info = if flags & 0x04 != 0 {
        let raw = reader.take(4)?;
        Some(ConnectionInfo {
            ip4_addr: Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]),
        })
    } else {
        None
    };
    let scan_info = if flags & 0x08 != 0 {
        Some(read_scan_params(reader)?)
    } else {
        None
    };
    Ok(DeviceStatus {
        state,
        provisioning_info,
        connection_info,
        scan_info,
    })
}

/// Bounds-checked cursor over a received frame.
struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MalformedFrame> {
        if self.bytes.is_empty() {
            return Err(MalformedFrame::Empty);
        }
        if self.remaining() < len {
            return Err(MalformedFrame::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MalformedFrame> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, MalformedFrame> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn band(&mut self) -> Result<Band, MalformedFrame> {
        let value = self.u8()?;
        Band::from_wire(value).ok_or(MalformedFrame::InvalidValue {
            field: "band",
            value,
        })
    }

    fn finish(&self) -> Result<(), MalformedFrame> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(MalformedFrame::TrailingBytes(extra)),
        }
    }
}

/// Device-side encoders used by tests to script replies.
#[cfg(test)]
pub(crate) mod device {
    use super::*;

    pub fn ack(opcode: OpCode, status: StatusCode) -> Vec<u8> {
        vec![opcode.as_byte(), status.wire_value()]
    }

    pub fn status_ack(status: &DeviceStatus) -> Vec<u8> {
        let mut out = ack(OpCode::GetStatus, StatusCode::Success);
        let mut flags = 0u8;
        if status.state.is_some() {
            flags |= 0x01;
        }
        if status.provisioning_info.is_some() {
            flags |= 0x02;
        }
        if status.connection_info.is_some() {
            flags |= 0x04;
        }
        if status.scan_info.is_some() {
            flags |= 0x08;
        }
        out.push(flags);
        if let Some(state) = status.state {
            put_state(&mut out, state);
        }
        if let Some(info) = &status.provisioning_info {
            put_wifi_info(&mut out, info).unwrap();
        }
        if let Some(conn) = status.connection_info {
            out.extend_from_slice(&conn.ip4_addr.octets());
        }
        if let Some(scan) = &status.scan_info {
            put_scan_params(&mut out, scan);
        }
        out
    }

    pub fn scan_record(record: &WifiScanRecord) -> Vec<u8> {
        let mut out = vec![RESULT_TAG_SCAN_RECORD];
        put_wifi_info(&mut out, &record.wifi).unwrap();
        match record.rssi {
            Some(rssi) => out.extend_from_slice(&[1, rssi as u8]),
            None => out.push(0),
        }
        out
    }

    pub fn state(state: WifiConnectionState) -> Vec<u8> {
        let mut out = vec![RESULT_TAG_STATE];
        put_state(&mut out, state);
        out
    }

    fn put_state(out: &mut Vec<u8>, state: WifiConnectionState) {
        out.push(state.wire_value());
        if let WifiConnectionState::ConnectionFailed(reason) = state {
            out.push(reason.map_or(NO_REASON, |r| r.wire_value()));
        }
    }

    /// Parse a command the way the device does.
    pub fn command(bytes: &[u8]) -> Result<Command, MalformedFrame> {
        let mut reader = FrameReader::new(bytes);
        let raw_opcode = reader.u8()?;
        let opcode =
            OpCode::from_byte(raw_opcode).ok_or(MalformedFrame::UnknownOpcode(raw_opcode))?;
        let command = match opcode {
            OpCode::GetStatus => Command::GetStatus,
            OpCode::StopScan => Command::StopScan,
            OpCode::ForgetConfig => Command::ForgetConfig,
            OpCode::StartScan => Command::StartScan(read_scan_params(&mut reader)?),
            OpCode::SetConfig => {
                let wifi = read_wifi_info(&mut reader)?;
                let flags = reader.u8()?;
                let passphrase = if flags & 0x01 != 0 {
                    let len = reader.u8()? as usize;
                    let raw = reader.take(len)?;
                    Some(String::from_utf8(raw.to_vec()).map_err(|_| {
                        MalformedFrame::InvalidValue {
                            field: "passphrase",
                            value: raw[0],
                        }
                    })?)
                } else {
                    None
                };
                Command::SetConfig(WifiConfig {
                    wifi: Some(wifi),
                    passphrase,
                    volatile_memory: flags & 0x02 != 0,
                })
            }
        };
        reader.finish()?;
        Ok(command)
    }

    pub fn network(ssid: &str, rssi: i8) -> WifiScanRecord {
        WifiScanRecord {
            wifi: WifiInfo {
                ssid: ssid.as_bytes().to_vec(),
                bssid: [0x10, 0x20, 0x30, 0x40, 0x50, rssi as u8],
                band: Some(Band::Band2_4Ghz),
                channel: 6,
                auth_mode: AuthMode::Wpa2Psk,
            },
            rssi: Some(rssi),
        }
    }
}
