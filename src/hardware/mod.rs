//! # Hardware Link
//!
//! The microphone peripheral, seen as a capability: connect to it, have it push
//! raw PCM notification payloads into a channel, disconnect.
//!
//! ## Implementations:
//! - **BleLink** (`ble` feature): scans for a peripheral whose name starts with the
//!   configured prefix, connects over GATT and subscribes to the audio characteristic
//! - **ReplayLink**: streams a WAV or raw PCM file in real time, chunked like the
//!   firmware does; lets the bridge run without hardware
//! - **UnavailableLink**: what you get with neither; connecting reports that the
//!   platform has no Bluetooth capability

#[cfg(feature = "ble")]
pub mod ble;
pub mod replay;

use crate::config::DeviceConfig;
use crate::error::BridgeError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of the connected peripheral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

/// Receives every notification payload, in arrival order.
pub type NotificationSender = mpsc::UnboundedSender<Vec<u8>>;

#[async_trait]
pub trait HardwareLink: Send {
    /// Discover, pair and connect. Suspends on scanning and the GATT connect.
    async fn connect(&mut self) -> Result<DeviceInfo, BridgeError>;

    /// Subscribe to the audio characteristic; payloads go to `notifications`
    /// until `disconnect`.
    async fn start_notifications(&mut self, notifications: NotificationSender) -> Result<(), BridgeError>;

    /// Tear the link down. Safe to call in any state.
    async fn disconnect(&mut self);
}

/// Builds a fresh link for each connect, from the configuration current at that time.
pub type LinkFactory = Arc<dyn Fn(&DeviceConfig) -> Box<dyn HardwareLink> + Send + Sync>;

/// Pick the link implementation for a device configuration.
///
/// A configured replay file always wins, so a BLE-enabled build can still be
/// exercised from a recording.
pub fn default_link_factory() -> LinkFactory {
    Arc::new(|config: &DeviceConfig| -> Box<dyn HardwareLink> {
        if !config.replay_file.trim().is_empty() {
            return Box::new(replay::ReplayLink::new(config));
        }

        #[cfg(feature = "ble")]
        {
            Box::new(ble::BleLink::new(config))
        }

        #[cfg(not(feature = "ble"))]
        {
            Box::new(UnavailableLink)
        }
    })
}

/// Stand-in link for builds without Bluetooth support.
pub struct UnavailableLink;

#[async_trait]
impl HardwareLink for UnavailableLink {
    async fn connect(&mut self) -> Result<DeviceInfo, BridgeError> {
        Err(BridgeError::LinkUnavailable(
            "built without the `ble` feature and no replay file configured".to_string(),
        ))
    }

    async fn start_notifications(&mut self, _notifications: NotificationSender) -> Result<(), BridgeError> {
        Err(BridgeError::LinkUnavailable("no hardware link".to_string()))
    }

    async fn disconnect(&mut self) {}
}
