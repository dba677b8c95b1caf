//! Exchange slot and scoped channel subscriptions.
//!
//! Acks carry no request id: an ack belongs to whatever command is
//! outstanding. The [`ExchangeSlot`] therefore admits one exchange or stream
//! per connection, and every [`Subscription`] opened for it holds an
//! [`ExchangeGuard`] until its unsubscribe has completed. The next exchange
//! can only subscribe once the previous listener is gone.
//!
//! [`Subscription::close`] releases a subscription and waits for the
//! transport. Dropping an unreleased subscription schedules the unsubscribe
//! on the current runtime; the guard travels with it.

use crate::error::{ProtocolError, TransportError};
use crate::infrastructure::bluetooth::transport::{Channel, FrameStream, SharedTransport};
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ExchangeSlot {
    semaphore: Arc<Semaphore>,
}

impl Default for ExchangeSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeSlot {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the slot, waiting up to `wait` for a previous exchange to
    /// finish its cleanup.
    pub async fn acquire(&self, wait: Duration) -> Result<ExchangeGuard, ProtocolError> {
        match tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ExchangeGuard::new(permit)),
            Ok(Err(_)) | Err(_) => Err(ProtocolError::Busy),
        }
    }

    pub fn try_acquire(&self) -> Result<ExchangeGuard, ProtocolError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(ExchangeGuard::new)
            .map_err(|_| ProtocolError::Busy)
    }

    pub fn is_free(&self) -> bool {
        self.semaphore.available_permits() > 0
    }
}

/// Shared hold on the [`ExchangeSlot`]. The slot frees when the last clone drops.
#[derive(Debug, Clone)]
pub struct ExchangeGuard {
    _permit: Arc<OwnedSemaphorePermit>,
}

impl ExchangeGuard {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Arc::new(permit),
        }
    }
}

pub struct Subscription {
    transport: SharedTransport,
    channel: Channel,
    frames: FrameStream,
    lease: Option<ExchangeGuard>,
}

impl Subscription {
    /// Subscribe to `channel`. Frames are buffered from the moment this
    /// returns, so it must complete before the triggering write.
    pub async fn open(
        transport: SharedTransport,
        channel: Channel,
        lease: ExchangeGuard,
    ) -> Result<Self, TransportError> {
        let frames = transport.subscribe(channel).await?;
        debug!("Subscribed to {:?}", channel);
        Ok(Self {
            transport,
            channel,
            frames,
            lease: Some(lease),
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Next frame, or `None` once the transport closed the channel.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.frames.next().await
    }

    /// Drop every frame already buffered. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(Some(frame)) = self.frames.next().now_or_never() {
            warn!("Discarding stale {:?} frame: {:02X?}", self.channel, frame);
            dropped += 1;
        }
        dropped
    }

    pub(crate) fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        self.frames.poll_next_unpin(cx)
    }

    /// Release the subscription and wait for the transport to confirm.
    pub async fn close(mut self) {
        let lease = self.lease.take();
        release(&self.transport, self.channel).await;
        drop(lease);
    }
}

async fn release(transport: &SharedTransport, channel: Channel) {
    match transport.unsubscribe(channel).await {
        Ok(()) => debug!("Unsubscribed from {:?}", channel),
        Err(e) => warn!("Failed to unsubscribe from {:?}: {}", channel, e),
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = self.transport.clone();
                let channel = self.channel;
                handle.spawn(async move {
                    release(&transport, channel).await;
                    drop(lease);
                });
            }
            Err(_) => warn!(
                "Subscription to {:?} dropped outside a runtime; not released",
                self.channel
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake_transport::{Call, FakeTransport};

    #[tokio::test]
    async fn test_close_releases_slot_after_unsubscribe() {
        let fake = FakeTransport::new();
        let slot = ExchangeSlot::new();
        let lease = slot.try_acquire().unwrap();

        let subscription = Subscription::open(fake.clone(), Channel::DataOut, lease)
            .await
            .unwrap();
        assert!(!slot.is_free());

        subscription.close().await;
        assert!(slot.is_free());
        assert_eq!(
            fake.calls(),
            vec![
                Call::Subscribe(Channel::DataOut),
                Call::Unsubscribe(Channel::DataOut)
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_schedules_unsubscribe() {
        let fake = FakeTransport::new();
        let slot = ExchangeSlot::new();
        let lease = slot.try_acquire().unwrap();

        let subscription = Subscription::open(fake.clone(), Channel::DataOut, lease)
            .await
            .unwrap();
        drop(subscription);

        // The slot stays taken until the scheduled unsubscribe ran.
        let lease = slot.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.unsubscribe_count(), 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_acquire_gives_up_when_slot_stays_taken() {
        let slot = ExchangeSlot::new();
        let _held = slot.try_acquire().unwrap();
        assert!(matches!(
            slot.acquire(Duration::from_millis(20)).await,
            Err(ProtocolError::Busy)
        ));
        assert!(matches!(slot.try_acquire(), Err(ProtocolError::Busy)));
    }

    #[tokio::test]
    async fn test_discard_pending_keeps_later_frames() {
        let fake = FakeTransport::new();
        let slot = ExchangeSlot::new();
        let mut subscription =
            Subscription::open(fake.clone(), Channel::ControlPoint, slot.try_acquire().unwrap())
                .await
                .unwrap();

        fake.notify(Channel::ControlPoint, vec![0x01, 0x00]);
        fake.notify(Channel::ControlPoint, vec![0x03, 0x00]);
        assert_eq!(subscription.discard_pending(), 2);
        assert_eq!(subscription.discard_pending(), 0);

        fake.notify(Channel::ControlPoint, vec![0x05, 0x00]);
        assert_eq!(subscription.next().await, Some(vec![0x05, 0x00]));
        subscription.close().await;
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let fake = FakeTransport::new();
        let slot = ExchangeSlot::new();
        let mut subscription =
            Subscription::open(fake.clone(), Channel::DataOut, slot.try_acquire().unwrap())
                .await
                .unwrap();

        fake.notify(Channel::DataOut, vec![1]);
        fake.notify(Channel::DataOut, vec![2]);
        assert_eq!(subscription.next().await, Some(vec![1]));
        assert_eq!(subscription.next().await, Some(vec![2]));
        subscription.close().await;
    }
}
