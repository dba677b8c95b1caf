//! Error types for the provisioning stack.
//!
//! Codec errors ([`EncodingError`], [`MalformedFrame`]) are raised inside the
//! protocol module and always reach callers wrapped in [`ProtocolError`].
//! Front ends only see [`ProvisioningError`].

use crate::domain::models::{ConnectionStatus, DisconnectReason, StatusCode};
use crate::infrastructure::bluetooth::transport::Channel;
use std::time::Duration;
use thiserror::Error;

/// A command could not be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{field}` is {actual} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
}

/// A received frame does not match the expected envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("empty frame")]
    Empty,
    #[error("truncated frame: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("unknown result tag {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid value {value} for `{field}`")]
    InvalidValue { field: &'static str, value: u8 },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Failures reported by the BLE transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("characteristic for {0:?} channel not found")]
    MissingCharacteristic(Channel),
    #[error("channel {0:?} does not support this operation")]
    Unsupported(Channel),
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

/// Failures of a single protocol exchange or stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
    #[error("device is not ready (status: {0})")]
    NotReady(ConnectionStatus),
    #[error("another exchange is already in progress")]
    Busy,
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("no notification within {0:?}")]
    NotificationTimeout(Duration),
    #[error("device rejected the command: {0}")]
    Remote(StatusCode),
    #[error("unexpected payload in response to {0}")]
    UnexpectedPayload(&'static str),
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("link dropped during the exchange ({0:?})")]
    Disconnected(DisconnectReason),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by [`ProvisioningService`](crate::infrastructure::bluetooth::ProvisioningService).
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("device is not ready; connect first")]
    NotReady,
    #[error("device does not expose the Wi-Fi provisioning service")]
    MissingService,
    #[error("could not connect after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("device disconnected ({0:?})")]
    Disconnected(DisconnectReason),
    #[error(transparent)]
    Protocol(ProtocolError),
}

impl ProvisioningError {
    /// Whether the same call may succeed once the connection is Ready again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingService => false,
            Self::Disconnected(reason) => *reason != DisconnectReason::MissingService,
            Self::Protocol(ProtocolError::Encoding(_) | ProtocolError::Malformed(_)) => false,
            _ => true,
        }
    }
}

impl From<ProtocolError> for ProvisioningError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::NotReady(ConnectionStatus::Disconnected(
                DisconnectReason::MissingService,
            )) => Self::MissingService,
            ProtocolError::NotReady(_) => Self::NotReady,
            ProtocolError::Disconnected(reason) => Self::Disconnected(reason),
            other => Self::Protocol(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_becomes_precondition_error() {
        let error: ProvisioningError =
            ProtocolError::NotReady(ConnectionStatus::Connecting).into();
        assert!(matches!(error, ProvisioningError::NotReady));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_missing_service_is_fatal() {
        let error: ProvisioningError = ProtocolError::NotReady(ConnectionStatus::Disconnected(
            DisconnectReason::MissingService,
        ))
        .into();
        assert!(matches!(error, ProvisioningError::MissingService));
        assert!(!error.is_retryable());
        assert!(!ProvisioningError::Disconnected(DisconnectReason::MissingService).is_retryable());
    }

    #[test]
    fn test_codec_errors_are_not_retryable() {
        let error: ProvisioningError = ProtocolError::Malformed(MalformedFrame::Empty).into();
        assert!(!error.is_retryable());

        let timeout: ProvisioningError =
            ProtocolError::ResponseTimeout(Duration::from_secs(60)).into();
        assert!(timeout.is_retryable());

        let remote: ProvisioningError = ProtocolError::Remote(StatusCode::InternalError).into();
        assert!(remote.is_retryable());
    }

    #[test]
    fn test_link_loss_surfaces_as_disconnected() {
        let error: ProvisioningError =
            ProtocolError::Disconnected(DisconnectReason::LinkLoss).into();
        assert!(matches!(
            error,
            ProvisioningError::Disconnected(DisconnectReason::LinkLoss)
        ));
        assert!(error.is_retryable());
    }
}
