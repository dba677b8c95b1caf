//! BLE Connection Module
//!
//! Brings a session up and down: connect with retry, discover the
//! provisioning service, and report every step as a [`LinkEvent`].

use crate::domain::connection_state::LinkEvent;
use crate::domain::models::{AppEvent, DisconnectReason, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::error::{ProvisioningError, TransportError};
use crate::infrastructure::bluetooth::transport::{Channel, SharedTransport};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connect attempts before giving up
    pub max_connect_attempts: u32,
    /// Fixed delay between attempts
    pub connect_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(100),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_connect_attempts: settings.connect_max_attempts.max(1),
            connect_retry_delay: settings.connect_retry_delay(),
        }
    }
}

/// BLE Connection handler
pub struct BleConnection {
    transport: SharedTransport,
    link_sender: mpsc::UnboundedSender<LinkEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl BleConnection {
    pub fn new(
        transport: SharedTransport,
        link_sender: mpsc::UnboundedSender<LinkEvent>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            link_sender,
            event_sender,
            config,
        }
    }

    /// Connect and verify the provisioning service is present.
    pub async fn connect(&self) -> Result<(), ProvisioningError> {
        info!("Connecting to device");
        self.send_log("Connecting to device...", MessageSeverity::Info);
        self.emit(LinkEvent::ConnectStarted);

        // Step 1: Establish the link
        let attempts = self.connect_with_retry().await?;

        // Step 2: Discover the provisioning characteristics
        let channels = match self.transport.discover().await {
            Ok(channels) => channels,
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.abandon().await;
                return Err(ProvisioningError::ConnectFailed {
                    attempts,
                    source: e,
                });
            }
        };

        let missing: Vec<Channel> = Channel::ALL
            .into_iter()
            .filter(|channel| !channels.contains(channel))
            .collect();
        if !missing.is_empty() {
            error!("Provisioning service incomplete, missing {:?}", missing);
            self.send_log(
                "Device does not support Wi-Fi provisioning",
                MessageSeverity::Error,
            );
            self.emit(LinkEvent::ServicesMissing);
            if let Err(e) = self.transport.disconnect().await {
                warn!("Failed to drop link after missing service: {}", e);
            }
            return Err(ProvisioningError::MissingService);
        }

        // Step 3: Session is usable
        self.emit(LinkEvent::Connected);
        self.emit(LinkEvent::Ready);
        info!("Device ready after {} attempt(s)", attempts);
        self.send_log("Connection established!", MessageSeverity::Success);
        Ok(())
    }

    /// Returns the number of attempts it took.
    async fn connect_with_retry(&self) -> Result<u32, ProvisioningError> {
        let max = self.config.max_connect_attempts.max(1);
        let mut last_error: Option<TransportError> = None;

        for attempt in 1..=max {
            match self.transport.connect().await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, max, e);
                    last_error = Some(e);
                    if attempt < max {
                        tokio::time::sleep(self.config.connect_retry_delay).await;
                    }
                }
            }
        }

        error!("Failed to connect after {} attempts", max);
        self.send_log("Could not connect to device", MessageSeverity::Error);
        self.emit(LinkEvent::Disconnected(DisconnectReason::Unknown));
        Err(ProvisioningError::ConnectFailed {
            attempts: max,
            source: last_error.unwrap_or(TransportError::NotConnected),
        })
    }

    async fn abandon(&self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to drop link: {}", e);
        }
        self.emit(LinkEvent::Disconnected(DisconnectReason::Unknown));
    }

    /// Tear the session down on request.
    pub async fn disconnect(&self) -> Result<(), ProvisioningError> {
        info!("Disconnecting from device");
        self.emit(LinkEvent::DisconnectStarted);
        let result = self.transport.disconnect().await;
        self.emit(LinkEvent::Disconnected(DisconnectReason::Success));

        match result {
            Ok(()) => {
                self.send_log("Disconnected from device", MessageSeverity::Info);
                Ok(())
            }
            Err(e) => {
                warn!("Disconnect reported an error: {}", e);
                Err(ProvisioningError::Protocol(e.into()))
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.link_sender.send(event);
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
