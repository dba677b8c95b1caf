//! Wi-Fi provisioning of devices over Bluetooth Low Energy.

pub mod domain;
pub mod error;
pub mod infrastructure;
