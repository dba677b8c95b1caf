//! Request/Response Engine
//!
//! Runs one non-streaming command: subscribe to the control point, write the
//! command, wait for its single ack, and map the status code.

use crate::domain::models::{ConnectionStatus, DisconnectReason, StatusCode};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::protocol::{self, AckPayload, AckResponse, Command, OpCode};
use crate::infrastructure::bluetooth::subscription::{ExchangeGuard, ExchangeSlot, Subscription};
use crate::infrastructure::bluetooth::transport::{Channel, SharedTransport};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Default bound on waiting for an ack.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a command waits for the previous one to release its listeners.
pub const DEFAULT_SLOT_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RequestEngine {
    transport: SharedTransport,
    status: watch::Receiver<ConnectionStatus>,
    slot: ExchangeSlot,
    response_timeout: Duration,
    slot_wait: Duration,
}

impl RequestEngine {
    pub fn new(
        transport: SharedTransport,
        status: watch::Receiver<ConnectionStatus>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            status,
            slot: ExchangeSlot::new(),
            response_timeout,
            slot_wait: DEFAULT_SLOT_WAIT,
        }
    }

    pub fn with_slot_wait(mut self, slot_wait: Duration) -> Self {
        self.slot_wait = slot_wait;
        self
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn slot(&self) -> &ExchangeSlot {
        &self.slot
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Take the exchange slot for a command or stream on this connection.
    pub async fn acquire_slot(&self) -> Result<ExchangeGuard, ProtocolError> {
        self.slot.acquire(self.slot_wait).await
    }

    pub fn ensure_ready(&self) -> Result<(), ProtocolError> {
        let status = *self.status.borrow();
        if status.is_ready() {
            Ok(())
        } else {
            Err(ProtocolError::NotReady(status))
        }
    }

    /// Resolves once the connection reports a disconnect.
    pub(crate) fn link_lost(&self) -> BoxFuture<'static, DisconnectReason> {
        let mut status = self.status.clone();
        async move {
            let seen = status
                .wait_for(|status| status.is_disconnected())
                .await
                .map(|status| *status);
            match seen {
                Ok(ConnectionStatus::Disconnected(reason)) => reason,
                Ok(_) => DisconnectReason::Unknown,
                // Nobody reports link state any more.
                Err(_) => future::pending().await,
            }
        }
        .boxed()
    }

    /// Run `command` and return the ack payload.
    pub async fn execute(&self, command: &Command) -> Result<AckPayload, ProtocolError> {
        self.ensure_ready()?;
        let lease = self.acquire_slot().await?;
        self.exchange(command, &lease).await
    }

    /// Run `command` under a slot the caller already holds.
    pub(crate) async fn exchange(
        &self,
        command: &Command,
        lease: &ExchangeGuard,
    ) -> Result<AckPayload, ProtocolError> {
        self.ensure_ready()?;
        let opcode = command.opcode();
        let frame = protocol::encode(command)?;

        let mut acks =
            Subscription::open(self.transport.clone(), Channel::ControlPoint, lease.clone())
                .await?;
        let outcome = self.write_and_await_ack(&mut acks, opcode, &frame).await;
        acks.close().await;

        let ack = outcome?;
        match ack.status {
            StatusCode::Success => {
                debug!("{} acknowledged", opcode.name());
                Ok(ack.payload)
            }
            status => {
                warn!("{} rejected by device: {}", opcode.name(), status);
                Err(ProtocolError::Remote(status))
            }
        }
    }

    async fn write_and_await_ack(
        &self,
        acks: &mut Subscription,
        opcode: OpCode,
        frame: &[u8],
    ) -> Result<AckResponse, ProtocolError> {
        // Anything already queued predates this command.
        acks.discard_pending();
        info!("Sending {}", opcode.name());
        self.transport.write(Channel::ControlPoint, frame).await?;

        let deadline = Instant::now() + self.response_timeout;
        let mut lost = self.link_lost();
        loop {
            let received = tokio::select! {
                received = timeout_at(deadline, acks.next()) => received,
                reason = &mut lost => {
                    warn!("Link dropped while waiting for {} ack", opcode.name());
                    return Err(ProtocolError::Disconnected(reason));
                }
            };
            let raw = match received {
                Ok(Some(raw)) => raw,
                Ok(None) => return Err(ProtocolError::ChannelClosed),
                Err(_) => {
                    warn!(
                        "No ack for {} within {:?}",
                        opcode.name(),
                        self.response_timeout
                    );
                    return Err(ProtocolError::ResponseTimeout(self.response_timeout));
                }
            };

            debug!("Control point frame: {:02X?}", raw);
            let ack = protocol::decode_ack(&raw)?;
            if ack.opcode != opcode {
                warn!(
                    "Discarding stray {} ack while waiting for {}",
                    ack.opcode.name(),
                    opcode.name()
                );
                continue;
            }
            return Ok(ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceStatus, WifiConnectionState};
    use crate::error::MalformedFrame;
    use crate::infrastructure::bluetooth::fake_transport::{Call, FakeTransport};
    use crate::infrastructure::bluetooth::protocol::device;
    use std::sync::Arc;

    fn engine(fake: &Arc<FakeTransport>, status: ConnectionStatus) -> RequestEngine {
        let (_tx, rx) = watch::channel(status);
        RequestEngine::new(fake.clone(), rx, Duration::from_millis(100))
            .with_slot_wait(Duration::from_millis(20))
    }

    fn connected_status() -> DeviceStatus {
        DeviceStatus {
            state: Some(WifiConnectionState::Connected),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_status_returns_payload() {
        let fake = FakeTransport::new();
        fake.reply_to_next_write(vec![(
            Channel::ControlPoint,
            device::status_ack(&connected_status()),
        )]);

        let payload = engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::GetStatus)
            .await
            .unwrap();

        assert_eq!(payload, AckPayload::DeviceStatus(connected_status()));
        assert_eq!(fake.subscribe_count(), 1);
        assert_eq!(fake.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_never_writes() {
        let fake = FakeTransport::new();
        let error = engine(&fake, ConnectionStatus::Connected)
            .execute(&Command::GetStatus)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            ProtocolError::NotReady(ConnectionStatus::Connected)
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subscribes_before_writing() {
        let fake = FakeTransport::strict();
        fake.reply_to_next_write(vec![(
            Channel::ControlPoint,
            device::ack(OpCode::ForgetConfig, StatusCode::Success),
        )]);

        engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::ForgetConfig)
            .await
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                Call::Subscribe(Channel::ControlPoint),
                Call::Write(Channel::ControlPoint, vec![0x05]),
                Call::Unsubscribe(Channel::ControlPoint),
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_status_becomes_error() {
        let fake = FakeTransport::new();
        fake.reply_to_next_write(vec![(
            Channel::ControlPoint,
            device::ack(OpCode::ForgetConfig, StatusCode::InternalError),
        )]);

        let error = engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::ForgetConfig)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ProtocolError::Remote(StatusCode::InternalError)
        ));
    }

    #[tokio::test]
    async fn test_timeout_then_late_frame_is_not_matched() {
        let fake = FakeTransport::new();
        let engine = engine(&fake, ConnectionStatus::Ready);

        // The device stays silent for the first exchange.
        fake.reply_to_next_write(vec![]);
        let error = engine.execute(&Command::GetStatus).await.unwrap_err();
        assert!(matches!(error, ProtocolError::ResponseTimeout(_)));
        assert_eq!(fake.subscribe_count(), fake.unsubscribe_count());

        // Its answer shows up after the listener was released.
        let stale = DeviceStatus {
            state: Some(WifiConnectionState::Authentication),
            ..Default::default()
        };
        fake.notify(Channel::ControlPoint, device::status_ack(&stale));
        assert_eq!(fake.unrouted_frames().len(), 1);

        fake.reply_to_next_write(vec![(
            Channel::ControlPoint,
            device::status_ack(&connected_status()),
        )]);
        let payload = engine.execute(&Command::GetStatus).await.unwrap();
        assert_eq!(payload, AckPayload::DeviceStatus(connected_status()));
    }

    #[tokio::test]
    async fn test_ack_queued_before_write_is_not_matched() {
        let fake = FakeTransport::new();
        let late = DeviceStatus {
            state: Some(WifiConnectionState::Authentication),
            ..Default::default()
        };
        fake.emit_on_next_subscribe(Channel::ControlPoint, device::status_ack(&late));
        fake.reply_to_next_write(vec![(
            Channel::ControlPoint,
            device::status_ack(&connected_status()),
        )]);

        let payload = engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::GetStatus)
            .await
            .unwrap();
        assert_eq!(payload, AckPayload::DeviceStatus(connected_status()));
    }

    #[tokio::test]
    async fn test_link_loss_ends_wait_for_ack() {
        let fake = FakeTransport::new();
        let (tx, rx) = watch::channel(ConnectionStatus::Ready);
        let engine = RequestEngine::new(fake.clone(), rx, Duration::from_secs(60));
        fake.reply_to_next_write(vec![]);

        let (result, _) = tokio::join!(engine.execute(&Command::GetStatus), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(ConnectionStatus::Disconnected(DisconnectReason::LinkLoss));
        });

        assert!(matches!(
            result,
            Err(ProtocolError::Disconnected(DisconnectReason::LinkLoss))
        ));
        assert_eq!(fake.subscribe_count(), fake.unsubscribe_count());
        assert!(engine.slot().is_free());
    }

    #[tokio::test]
    async fn test_stray_ack_for_other_opcode_is_discarded() {
        let fake = FakeTransport::new();
        fake.reply_to_next_write(vec![
            (
                Channel::ControlPoint,
                device::ack(OpCode::StopScan, StatusCode::Success),
            ),
            (
                Channel::ControlPoint,
                device::ack(OpCode::ForgetConfig, StatusCode::Success),
            ),
        ]);

        let payload = engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::ForgetConfig)
            .await
            .unwrap();
        assert_eq!(payload, AckPayload::None);
    }

    #[tokio::test]
    async fn test_malformed_ack_is_surfaced_without_retry() {
        let fake = FakeTransport::new();
        fake.reply_to_next_write(vec![(Channel::ControlPoint, vec![0x01, 0x09])]);

        let error = engine(&fake, ConnectionStatus::Ready)
            .execute(&Command::GetStatus)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ProtocolError::Malformed(MalformedFrame::UnknownStatus(9))
        ));
        assert_eq!(fake.writes().len(), 1);
        assert_eq!(fake.subscribe_count(), fake.unsubscribe_count());
    }

    #[tokio::test]
    async fn test_encoding_error_happens_before_io() {
        let fake = FakeTransport::new();
        let command = Command::SetConfig(crate::domain::models::WifiConfig {
            wifi: None,
            passphrase: None,
            volatile_memory: false,
        });

        let error = engine(&fake, ConnectionStatus::Ready)
            .execute(&command)
            .await
            .unwrap_err();
        assert!(matches!(error, ProtocolError::Encoding(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_exchange_is_rejected_while_slot_is_held() {
        let fake = FakeTransport::new();
        let engine = engine(&fake, ConnectionStatus::Ready);

        let guard = engine.slot().try_acquire().unwrap();
        let error = engine.execute(&Command::GetStatus).await.unwrap_err();
        assert!(matches!(error, ProtocolError::Busy));
        assert!(fake.calls().is_empty());

        drop(guard);
        assert!(engine.slot().try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_exchange_releases_subscription() {
        let fake = FakeTransport::new();
        let engine = engine(&fake, ConnectionStatus::Ready);
        fake.reply_to_next_write(vec![]);

        let pending = engine.execute(&Command::GetStatus);
        // Give up long before the response timeout.
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        fake.settle().await;
        assert_eq!(fake.subscribe_count(), 1);
        assert_eq!(fake.unsubscribe_count(), 1);
        assert!(engine.acquire_slot().await.is_ok());
    }
}
