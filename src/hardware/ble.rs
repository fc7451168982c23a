//! GATT link to the microphone peripheral, via btleplug.
//!
//! ## Connect sequence:
//! 1. Take the first Bluetooth adapter
//! 2. Scan until a peripheral advertises a name starting with `name_prefix`,
//!    giving up after `scan_timeout_secs`
//! 3. Connect, discover services, locate the audio characteristic
//! 4. On `start_notifications`, subscribe and pump notification values into the channel

use crate::config::DeviceConfig;
use crate::error::BridgeError;
use crate::hardware::{DeviceInfo, HardwareLink, NotificationSender};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(250);

pub struct BleLink {
    config: DeviceConfig,
    peripheral: Option<Peripheral>,
    characteristic: Option<Characteristic>,
    pump: Option<JoinHandle<()>>,
}

impl BleLink {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
            peripheral: None,
            characteristic: None,
            pump: None,
        }
    }

    async fn adapter() -> Result<Adapter, BridgeError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BridgeError::LinkUnavailable(e.to_string()))?;
        manager
            .adapters()
            .await
            .map_err(|e| BridgeError::LinkUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::LinkUnavailable("no Bluetooth adapter found".to_string()))
    }

    /// Poll discovered peripherals until one matches the name prefix.
    async fn find(&self, adapter: &Adapter) -> Result<(Peripheral, String), BridgeError> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BridgeError::LinkUnavailable(format!("scan failed: {}", e)))?;

        let deadline = Instant::now() + Duration::from_secs(self.config.scan_timeout_secs);
        let found = loop {
            let peripherals = adapter
                .peripherals()
                .await
                .map_err(|e| BridgeError::LinkUnavailable(e.to_string()))?;

            let mut matched = None;
            for peripheral in peripherals {
                if let Ok(Some(props)) = peripheral.properties().await {
                    if let Some(name) = props.local_name {
                        if name.starts_with(&self.config.name_prefix) {
                            matched = Some((peripheral, name));
                            break;
                        }
                    }
                }
            }

            if matched.is_some() || Instant::now() >= deadline {
                break matched;
            }
            time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found.ok_or_else(|| {
            BridgeError::PairingFailed(format!(
                "no device named {}* found within {} s",
                self.config.name_prefix, self.config.scan_timeout_secs
            ))
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, BridgeError> {
    Uuid::parse_str(value).map_err(|e| BridgeError::ServiceOrCharacteristicMissing(format!("bad UUID {}: {}", value, e)))
}

#[async_trait]
impl HardwareLink for BleLink {
    async fn connect(&mut self) -> Result<DeviceInfo, BridgeError> {
        let service = parse_uuid(&self.config.service_uuid)?;
        let characteristic = parse_uuid(&self.config.characteristic_uuid)?;

        let adapter = Self::adapter().await?;
        info!(prefix = %self.config.name_prefix, "Scanning for microphone");
        let (peripheral, name) = self.find(&adapter).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| BridgeError::GattConnectFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BridgeError::GattConnectFailed(e.to_string()))?;

        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service);

        let Some(found) = found else {
            let _ = peripheral.disconnect().await;
            return Err(BridgeError::ServiceOrCharacteristicMissing(format!(
                "{} has no characteristic {} in service {}",
                name, characteristic, service
            )));
        };

        let device = DeviceInfo {
            id: peripheral.address().to_string(),
            name: if name.is_empty() { self.config.fallback_name.clone() } else { name },
        };
        info!(device_id = %device.id, device_name = %device.name, "GATT connected");

        self.peripheral = Some(peripheral);
        self.characteristic = Some(found);
        Ok(device)
    }

    async fn start_notifications(&mut self, notifications: NotificationSender) -> Result<(), BridgeError> {
        let (Some(peripheral), Some(characteristic)) = (self.peripheral.as_ref(), self.characteristic.as_ref()) else {
            return Err(BridgeError::InvalidState("not connected".to_string()));
        };

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| BridgeError::GattConnectFailed(e.to_string()))?;
        peripheral
            .subscribe(characteristic)
            .await
            .map_err(|e| BridgeError::GattConnectFailed(format!("subscribe failed: {}", e)))?;

        let uuid = characteristic.uuid;
        self.pump = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if notifications.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        }));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(peripheral) = self.peripheral.take() {
            if let Some(characteristic) = self.characteristic.take() {
                let _ = peripheral.unsubscribe(&characteristic).await;
            }
            if let Err(e) = peripheral.disconnect().await {
                warn!("GATT disconnect failed: {}", e);
            }
        }
        info!("Microphone link released");
    }
}
