//! GATT Transport
//!
//! [`Transport`] over a `btleplug` peripheral. Bonding and MTU negotiation
//! are left to the platform stack, which performs both on connect.

use crate::domain::connection_state::LinkEvent;
use crate::domain::models::DisconnectReason;
use crate::domain::settings::Settings;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    Channel, FrameStream, LinkEventStream, Transport,
};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::{future, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Service and characteristic UUIDs of the provisioning profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattUuids {
    pub service: Uuid,
    pub info: Uuid,
    pub control_point: Uuid,
    pub data_out: Uuid,
}

impl Default for GattUuids {
    fn default() -> Self {
        Self {
            service: Uuid::from_u128(0x14387800_130c_49e7_b877_2881c89cb258),
            info: Uuid::from_u128(0x14387801_130c_49e7_b877_2881c89cb258),
            control_point: Uuid::from_u128(0x14387802_130c_49e7_b877_2881c89cb258),
            data_out: Uuid::from_u128(0x14387803_130c_49e7_b877_2881c89cb258),
        }
    }
}

impl GattUuids {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service: protocol::parse_uuid(&settings.ble_service_uuid)?,
            info: protocol::parse_uuid(&settings.ble_info_char_uuid)?,
            control_point: protocol::parse_uuid(&settings.ble_control_point_char_uuid)?,
            data_out: protocol::parse_uuid(&settings.ble_data_out_char_uuid)?,
        })
    }

    pub fn channel_for(&self, uuid: Uuid) -> Option<Channel> {
        if uuid == self.info {
            Some(Channel::Info)
        } else if uuid == self.control_point {
            Some(Channel::ControlPoint)
        } else if uuid == self.data_out {
            Some(Channel::DataOut)
        } else {
            None
        }
    }
}

pub struct GattTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    uuids: GattUuids,
    characteristics: Mutex<HashMap<Channel, Characteristic>>,
    disconnect_requested: Arc<AtomicBool>,
}

impl GattTransport {
    pub fn new(adapter: Adapter, peripheral: Peripheral, uuids: GattUuids) -> Self {
        Self {
            adapter,
            peripheral,
            uuids,
            characteristics: Mutex::new(HashMap::new()),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, channel: Channel) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .map_err(|_| TransportError::Other("characteristic map poisoned".to_string()))?
            .get(&channel)
            .cloned()
            .ok_or(TransportError::MissingCharacteristic(channel))
    }
}

#[async_trait]
impl Transport for GattTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.disconnect_requested.store(false, Ordering::SeqCst);
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        info!("BLE link up: {:?}", self.peripheral.id());
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<Channel>, TransportError> {
        self.peripheral.discover_services().await?;

        let mut found = HashMap::new();
        for service in self.peripheral.services() {
            if service.uuid != self.uuids.service {
                continue;
            }
            info!("Found provisioning service");
            for characteristic in service.characteristics {
                if let Some(channel) = self.uuids.channel_for(characteristic.uuid) {
                    debug!("{:?} -> {}", channel, characteristic.uuid);
                    found.insert(channel, characteristic);
                }
            }
        }

        let channels = found.keys().copied().collect();
        *self
            .characteristics
            .lock()
            .map_err(|_| TransportError::Other("characteristic map poisoned".to_string()))? =
            found;
        Ok(channels)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        if let Ok(mut characteristics) = self.characteristics.lock() {
            characteristics.clear();
        }
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(channel)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, channel: Channel, payload: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<FrameStream, TransportError> {
        let characteristic = self.characteristic(channel)?;
        let uuid = characteristic.uuid;

        // Take the notification stream first so nothing sent right after
        // the CCCD write is missed.
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        Ok(notifications
            .filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn link_events(&self) -> Result<Option<LinkEventStream>, TransportError> {
        let events = self.adapter.events().await?;
        let id = self.peripheral.id();
        let requested = self.disconnect_requested.clone();

        let stream = events.filter_map(move |event| {
            let link = match event {
                CentralEvent::DeviceDisconnected(peer) if peer == id => {
                    if requested.load(Ordering::SeqCst) {
                        None
                    } else {
                        warn!("Link lost: {:?}", peer);
                        Some(LinkEvent::Disconnected(DisconnectReason::LinkLoss))
                    }
                }
                _ => None,
            };
            future::ready(link)
        });
        Ok(Some(stream.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uuids_match_profile() {
        let uuids = GattUuids::default();
        assert_eq!(uuids.service.to_string(), protocol::SERVICE_UUID);
        assert_eq!(uuids.info.to_string(), protocol::INFO_CHAR_UUID);
        assert_eq!(
            uuids.control_point.to_string(),
            protocol::CONTROL_POINT_CHAR_UUID
        );
        assert_eq!(uuids.data_out.to_string(), protocol::DATA_OUT_CHAR_UUID);
    }

    #[test]
    fn test_uuids_from_settings() {
        let uuids = GattUuids::from_settings(&Settings::default()).unwrap();
        assert_eq!(uuids, GattUuids::default());

        let mut settings = Settings::default();
        settings.ble_data_out_char_uuid = "not-a-uuid".to_string();
        assert!(GattUuids::from_settings(&settings).is_err());
    }

    #[test]
    fn test_channel_lookup() {
        let uuids = GattUuids::default();
        assert_eq!(uuids.channel_for(uuids.info), Some(Channel::Info));
        assert_eq!(
            uuids.channel_for(uuids.control_point),
            Some(Channel::ControlPoint)
        );
        assert_eq!(uuids.channel_for(uuids.data_out), Some(Channel::DataOut));
        assert_eq!(uuids.channel_for(uuids.service), None);
    }
}
