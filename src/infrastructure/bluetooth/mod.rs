//! Bluetooth Module
//!
//! Provisions Wi-Fi credentials onto a device over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ProvisioningService                     │
//! │   (public API: connect, status, scan, set_config, ...)   │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ Connection │   │ RequestEngine  │◀──│  Streaming   │
//! │            │   │                │   │   Channel    │
//! │ - retry    │   │ - arm / fire   │   │ - data-out   │
//! │ - discover │   │ - ack match    │   │ - timeouts   │
//! └─────┬──────┘   └───────┬────────┘   └──────┬───────┘
//!       │                  │    Subscription   │
//!       ▼                  ▼                   ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              Transport (GattTransport / fake)            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, opcodes and frame encoding
//! - [`transport`] - The BLE seam used by everything above it
//! - [`gatt`] - `btleplug` implementation of the transport
//! - [`subscription`] - Exchange slot and scoped channel subscriptions
//! - [`request`] - One command, one ack
//! - [`stream`] - One command, many results
//! - [`connection`] - Connect retry and service discovery
//! - [`scanner`] - BLE device discovery
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod gatt;
pub mod protocol;
pub mod request;
pub mod scanner;
pub mod service;
pub mod stream;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake_transport;

// Re-export main service for convenience
pub use service::{ProvisioningProgress, ProvisioningService, ScanSession};
