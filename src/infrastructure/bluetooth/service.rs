//! Provisioning Service Module
//!
//! Main service that coordinates the connection lifecycle, the request
//! engine and the streaming channel for one provisionable device.

use crate::domain::connection_state::{ConnectionStateMachine, LinkEvent};
use crate::domain::models::{
    AppEvent, ConnectionStatus, DeviceInfo, DeviceStatus, DisconnectReason, MessageSeverity,
    ScanParams, StatusMessage, WifiConfig, WifiConnectionState, WifiScanRecord,
};
use crate::domain::settings::Settings;
use crate::error::{ProtocolError, ProvisioningError};
use crate::infrastructure::bluetooth::{
    connection::{BleConnection, ConnectionConfig},
    protocol::{self, AckPayload, Command, ResultFrame},
    request::RequestEngine,
    stream::{ResultStream, StreamingChannel, Termination},
    transport::{Channel, SharedTransport},
};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main service coordinating all provisioning operations on one device
pub struct ProvisioningService {
    transport: SharedTransport,
    connection: BleConnection,
    engine: RequestEngine,
    streaming: StreamingChannel,
    status: watch::Receiver<ConnectionStatus>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    follow_progress: bool,
    pump: JoinHandle<()>,
}

impl ProvisioningService {
    /// Create the service for `transport`. Nothing is connected yet.
    pub async fn new(
        transport: SharedTransport,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self, ProvisioningError> {
        let (status_tx, status) = watch::channel(ConnectionStatus::Idle);
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let local = stream::unfold(link_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        let events = match transport
            .link_events()
            .await
            .map_err(|e| ProvisioningError::Protocol(e.into()))?
        {
            Some(remote) => stream::select(local, remote).boxed(),
            None => local,
        };
        let pump = tokio::spawn(pump_link_events(events, status_tx, event_sender.clone()));

        let engine = RequestEngine::new(transport.clone(), status.clone(), settings.response_timeout());
        let streaming = StreamingChannel::new(engine.clone(), settings.notification_timeout());
        let connection = BleConnection::new(
            transport.clone(),
            link_tx,
            event_sender.clone(),
            ConnectionConfig::from_settings(settings),
        );

        Ok(Self {
            transport,
            connection,
            engine,
            streaming,
            status,
            event_sender,
            follow_progress: settings.follow_provisioning_progress,
            pump,
        })
    }

    /// Connect and wait until the session is Ready.
    pub async fn connect(&self) -> Result<(), ProvisioningError> {
        let mut status = self.status.clone();
        match *status.borrow_and_update() {
            ConnectionStatus::Ready => return Ok(()),
            ConnectionStatus::Idle | ConnectionStatus::Disconnected(_) => {}
            other => {
                warn!("Connect requested while {}", other);
                return Err(ProvisioningError::Protocol(ProtocolError::Busy));
            }
        }

        let result = self.connection.connect().await;
        let settled = settle(&mut status).await;
        result?;

        match settled {
            ConnectionStatus::Ready => Ok(()),
            ConnectionStatus::Disconnected(DisconnectReason::MissingService) => {
                Err(ProvisioningError::MissingService)
            }
            ConnectionStatus::Disconnected(reason) => Err(ProvisioningError::Disconnected(reason)),
            _ => Err(ProvisioningError::NotReady),
        }
    }

    /// Tear the session down. A session that is not up is left alone.
    pub async fn disconnect(&self) -> Result<(), ProvisioningError> {
        let mut status = self.status.clone();
        match *status.borrow_and_update() {
            ConnectionStatus::Connected | ConnectionStatus::Ready => {}
            other => {
                debug!("Disconnect requested while {}, nothing to do", other);
                return Ok(());
            }
        }

        let result = self.connection.disconnect().await;
        settle(&mut status).await;
        result
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Read the version reported by the info characteristic.
    pub async fn read_info(&self) -> Result<DeviceInfo, ProvisioningError> {
        self.engine.ensure_ready()?;
        let raw = self
            .transport
            .read(Channel::Info)
            .await
            .map_err(ProtocolError::from)?;
        let info = protocol::decode_info(&raw);
        info!("Device version {}", info.version);
        Ok(info)
    }

    pub async fn get_status(&self) -> Result<DeviceStatus, ProvisioningError> {
        match self.engine.execute(&Command::GetStatus).await? {
            AckPayload::DeviceStatus(status) => Ok(status),
            AckPayload::None => Err(ProtocolError::UnexpectedPayload("GET_STATUS").into()),
        }
    }

    /// Start a Wi-Fi scan on the device.
    pub async fn scan(&self, params: ScanParams) -> Result<ScanSession, ProvisioningError> {
        let results = self
            .streaming
            .open(Command::StartScan(params), Termination::Open)
            .await?;
        self.send_log("Scanning for networks...", MessageSeverity::Info);
        Ok(ScanSession {
            results: Some(results),
            engine: self.engine.clone(),
        })
    }

    /// Stop a scan that is no longer tracked by a [`ScanSession`].
    pub async fn stop_scan(&self) -> Result<(), ProvisioningError> {
        self.engine.execute(&Command::StopScan).await?;
        Ok(())
    }

    /// Send credentials and follow the join, if the device is set up to report it.
    pub async fn set_config(
        &self,
        config: WifiConfig,
    ) -> Result<ProvisioningProgress, ProvisioningError> {
        let ssid = config
            .wifi
            .as_ref()
            .map(|wifi| wifi.ssid_lossy().into_owned())
            .unwrap_or_default();
        info!("Provisioning network {:?}", ssid);

        let results = if self.follow_progress {
            Some(
                self.streaming
                    .open(Command::SetConfig(config), Termination::UntilTerminalState)
                    .await?,
            )
        } else {
            self.engine.execute(&Command::SetConfig(config)).await?;
            None
        };

        self.send_log(
            &format!("Credentials for {} sent", ssid),
            MessageSeverity::Info,
        );
        Ok(ProvisioningProgress {
            results,
            last_state: None,
        })
    }

    /// Erase the stored network on the device.
    pub async fn forget_config(&self) -> Result<(), ProvisioningError> {
        self.engine.execute(&Command::ForgetConfig).await?;
        self.send_log("Stored network forgotten", MessageSeverity::Info);
        Ok(())
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for ProvisioningService {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Feed link events through the state machine and publish every transition.
async fn pump_link_events(
    mut events: BoxStream<'static, LinkEvent>,
    status: watch::Sender<ConnectionStatus>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
) {
    let mut machine = ConnectionStateMachine::new();
    while let Some(event) = events.next().await {
        if let Some(next) = machine.apply(event) {
            info!("Connection status: {}", next);
            status.send_replace(next);
            let _ = event_sender.send(AppEvent::ConnectionStatus(next));
        }
    }
    debug!("Link event pump finished");
}

/// Wait for the next Ready or Disconnected status.
async fn settle(status: &mut watch::Receiver<ConnectionStatus>) -> ConnectionStatus {
    loop {
        if status.changed().await.is_err() {
            return *status.borrow();
        }
        let current = *status.borrow_and_update();
        if current.is_ready() || current.is_disconnected() {
            return current;
        }
    }
}

/// A running Wi-Fi scan. Yields records until stopped or dropped.
pub struct ScanSession {
    results: Option<ResultStream>,
    engine: RequestEngine,
}

impl ScanSession {
    /// Gather records for `window`, or until the scan ends.
    pub async fn collect_for(
        &mut self,
        window: Duration,
    ) -> Result<Vec<WifiScanRecord>, ProvisioningError> {
        let deadline = tokio::time::Instant::now() + window;
        let mut records = Vec::new();
        while let Ok(item) = tokio::time::timeout_at(deadline, self.next()).await {
            match item {
                Some(record) => records.push(record?),
                None => break,
            }
        }
        Ok(records)
    }

    /// Release the result channel, then tell the device to stop scanning.
    pub async fn stop(mut self) -> Result<(), ProvisioningError> {
        if let Some(results) = self.results.take() {
            results.close().await;
        }
        self.engine.execute(&Command::StopScan).await?;
        info!("Scan stopped");
        Ok(())
    }
}

impl Stream for ScanSession {
    type Item = Result<WifiScanRecord, ProvisioningError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(results) = self.results.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(results.poll_next_unpin(cx)) {
                Some(Ok(ResultFrame::ScanRecord(record))) => return Poll::Ready(Some(Ok(record))),
                Some(Ok(ResultFrame::ConnectionState(state))) => {
                    debug!("Ignoring connection state {} during scan", state);
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => {
                    self.results = None;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Connection states reported while the device joins a network.
///
/// Empty when the device was provisioned without following progress.
pub struct ProvisioningProgress {
    results: Option<ResultStream>,
    last_state: Option<WifiConnectionState>,
}

impl ProvisioningProgress {
    pub fn is_following(&self) -> bool {
        self.results.is_some()
    }

    /// Drain the progress and return the last state seen.
    pub async fn outcome(mut self) -> Result<Option<WifiConnectionState>, ProvisioningError> {
        while let Some(state) = self.next().await {
            state?;
        }
        Ok(self.last_state)
    }

    /// Stop following the join. The device keeps going.
    pub async fn close(mut self) {
        if let Some(results) = self.results.take() {
            results.close().await;
        }
    }
}

impl Stream for ProvisioningProgress {
    type Item = Result<WifiConnectionState, ProvisioningError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(results) = self.results.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(results.poll_next_unpin(cx)) {
                Some(Ok(ResultFrame::ConnectionState(state))) => {
                    self.last_state = Some(state);
                    return Poll::Ready(Some(Ok(state)));
                }
                Some(Ok(ResultFrame::ScanRecord(record))) => {
                    debug!(
                        "Ignoring scan record {:?} during provisioning",
                        record.wifi.ssid_lossy()
                    );
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => {
                    self.results = None;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
