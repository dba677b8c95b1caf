//! Transport Adapter
//!
//! The seam between the protocol engine and the platform BLE stack. The
//! engine only ever talks to a [`Transport`]; [`GattTransport`] implements it
//! with `btleplug`, and the test suite implements it in memory.
//!
//! [`GattTransport`]: crate::infrastructure::bluetooth::gatt::GattTransport

use crate::domain::connection_state::LinkEvent;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Logical endpoints of the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Read-only device information.
    Info,
    /// Commands in, one indicated ack out per command.
    ControlPoint,
    /// Notified results of streaming commands.
    DataOut,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Info, Channel::ControlPoint, Channel::DataOut];
}

/// Raw frames delivered by a subscribed channel, in arrival order.
pub type FrameStream = BoxStream<'static, Vec<u8>>;

/// Link events raised by the transport outside of `connect`/`disconnect`,
/// such as the peer dropping the link.
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

pub type SharedTransport = Arc<dyn Transport>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the link. One attempt; retry policy lives above.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Discover services and return the provisioning channels that exist.
    async fn discover(&self) -> Result<Vec<Channel>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, channel: Channel, payload: &[u8]) -> Result<(), TransportError>;

    /// Start delivery on `channel`. Frames that arrive before this call
    /// returns are not delivered.
    async fn subscribe(&self, channel: Channel) -> Result<FrameStream, TransportError>;

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError>;

    /// Unsolicited link events, or `None` when the transport has none to offer.
    async fn link_events(&self) -> Result<Option<LinkEventStream>, TransportError>;
}
