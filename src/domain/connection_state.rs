//! Connection State Machine
//!
//! Tracks the BLE session lifecycle. The machine is fed [`LinkEvent`]s by the
//! transport layer and performs no I/O of its own.
//!
//! ```text
//! Idle ──ConnectStarted──▶ Connecting ──Connected──▶ Connected ──Ready──▶ Ready
//!                             │                          │                  │
//!                      ServicesMissing            DisconnectStarted   DisconnectStarted
//!                             ▼                          ▼                  ▼
//!             Disconnected(MissingService)         Disconnecting ◀──────────┘
//!                                                        │
//!                                              Disconnected(reason)
//! ```

use crate::domain::models::{ConnectionStatus, DisconnectReason};
use tracing::{debug, warn};

/// Link-level facts reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectStarted,
    /// The link is up and the provisioning service was found.
    Connected,
    /// The link is up but the peer lacks the provisioning characteristics.
    ServicesMissing,
    /// Session setup finished; commands may be issued.
    Ready,
    DisconnectStarted,
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    status: ConnectionStatus,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Apply an event. Returns the new status when the event caused a
    /// transition, `None` when it was ignored.
    pub fn apply(&mut self, event: LinkEvent) -> Option<ConnectionStatus> {
        use ConnectionStatus as S;

        let next = match (self.status, event) {
            (S::Idle | S::Disconnected(_), LinkEvent::ConnectStarted) => S::Connecting,
            (S::Connecting, LinkEvent::Connected) => S::Connected,
            (S::Connecting, LinkEvent::ServicesMissing) => {
                S::Disconnected(DisconnectReason::MissingService)
            }
            (S::Connected, LinkEvent::Ready) => S::Ready,
            (S::Connected | S::Ready, LinkEvent::DisconnectStarted) => S::Disconnecting,
            // A peer that drops while we are already tearing down still
            // counts as a clean disconnect.
            (S::Disconnecting, LinkEvent::Disconnected(DisconnectReason::LinkLoss)) => {
                S::Disconnected(DisconnectReason::Success)
            }
            (
                S::Connecting | S::Connected | S::Ready | S::Disconnecting,
                LinkEvent::Disconnected(reason),
            ) => S::Disconnected(reason),
            (current, event) => {
                warn!("Ignoring link event {:?} in state {:?}", event, current);
                return None;
            }
        };

        debug!("Connection status {:?} -> {:?}", self.status, next);
        self.status = next;
        Some(next)
    }

    /// Return to `Idle` when the session is torn down.
    pub fn reset(&mut self) {
        self.status = ConnectionStatus::Idle;
    }
}
