//! Boundary to the BLE transport
//!
//! Scanning, connecting, GATT discovery, MTU negotiation and notification
//! delivery belong to the platform BLE stack. This module only names the
//! operations the receiver needs ([`CameraLink`]) and the events it consumes
//! ([`LinkEvent`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peripherals::Peripheral;
use crate::protocol::CAMERA_CHARACTERISTIC_TAG;

/// Errors reported by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peripheral is not connected
    #[error("peripheral {0} is not connected")]
    NotConnected(String),

    /// The transport cannot perform this operation
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Any other failure reported by the BLE stack
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Events delivered by the transport, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peripheral was seen while scanning
    Discovered(Peripheral),
    /// The scan window ended
    ScanStopped,
    /// A connection was established
    Connected(String),
    /// A connection was lost or closed
    Disconnected(String),
    /// A characteristic value notification
    Notification {
        /// Peripheral id
        peripheral: String,
        /// Characteristic UUID
        characteristic: String,
        /// Notification payload
        value: Vec<u8>,
    },
}

/// One characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    /// Owning service UUID
    pub service: String,
    /// Characteristic UUID
    pub characteristic: String,
    /// Descriptor UUIDs
    #[serde(default)]
    pub descriptors: Vec<String>,
}

/// Where the camera listens for the trigger and sends its notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEndpoint {
    /// Peripheral id
    pub device_id: String,
    /// Service of the notify characteristic
    pub notify_service: String,
    /// Characteristic that streams the image
    pub notify_characteristic: String,
    /// Service of the write characteristic
    pub write_service: String,
    /// Characteristic that accepts the capture trigger
    pub write_characteristic: String,
}

impl CameraEndpoint {
    /// Whether a notification came from this endpoint
    pub fn matches(&self, peripheral: &str, characteristic: &str) -> bool {
        self.device_id == peripheral
            && self
                .notify_characteristic
                .eq_ignore_ascii_case(characteristic)
    }
}

/// Pick the camera characteristic out of a service discovery result
///
/// The firmware uses one characteristic for both the trigger write and the
/// image notifications; it is recognised by [`CAMERA_CHARACTERISTIC_TAG`] in
/// its UUID and must expose a descriptor (the CCCD). If several match, the
/// last one wins.
pub fn select_camera_endpoint(
    device_id: &str,
    characteristics: &[CharacteristicInfo],
) -> Option<CameraEndpoint> {
    characteristics
        .iter()
        .filter(|c| !c.descriptors.is_empty())
        .filter(|c| {
            c.characteristic
                .to_ascii_lowercase()
                .contains(CAMERA_CHARACTERISTIC_TAG)
        })
        .last()
        .map(|c| CameraEndpoint {
            device_id: device_id.to_string(),
            notify_service: c.service.clone(),
            notify_characteristic: c.characteristic.clone(),
            write_service: c.service.clone(),
            write_characteristic: c.characteristic.clone(),
        })
}

/// Operations the receiver needs from a BLE stack
///
/// Implementations deliver their asynchronous results (discoveries,
/// disconnects, notifications) as [`LinkEvent`]s on a channel of their own
/// choosing.
pub trait CameraLink {
    /// Start scanning for the given number of seconds
    fn start_scan(&mut self, seconds: u64) -> Result<()>;

    /// Stop an active scan
    fn stop_scan(&mut self) -> Result<()>;

    /// Connect to a peripheral
    fn connect(&mut self, id: &str) -> Result<()>;

    /// Disconnect from a peripheral
    fn disconnect(&mut self, id: &str) -> Result<()>;

    /// Discover services and characteristics
    fn retrieve_services(&mut self, id: &str) -> Result<Vec<CharacteristicInfo>>;

    /// Request an MTU; returns the negotiated value
    fn request_mtu(&mut self, id: &str, mtu: u16) -> Result<u16>;

    /// Write without response
    fn write_without_response(
        &mut self,
        id: &str,
        service: &str,
        characteristic: &str,
        data: &[u8],
    ) -> Result<()>;

    /// Subscribe to notifications
    fn start_notification(&mut self, id: &str, service: &str, characteristic: &str) -> Result<()>;

    /// Unsubscribe from notifications
    fn stop_notification(&mut self, id: &str, service: &str, characteristic: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(service: &str, uuid: &str, descriptors: &[&str]) -> CharacteristicInfo {
        CharacteristicInfo {
            service: service.to_string(),
            characteristic: uuid.to_string(),
            descriptors: descriptors.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_select_camera_endpoint() {
        let chars = vec![
            characteristic("1800", "2a00", &[]),
            characteristic("00ff", "0000ff01-0000-1000-8000-00805f9b34fb", &["2902"]),
        ];

        let endpoint = select_camera_endpoint("dev", &chars).unwrap();
        assert_eq!(endpoint.device_id, "dev");
        assert_eq!(endpoint.notify_service, "00ff");
        assert_eq!(
            endpoint.notify_characteristic,
            "0000ff01-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(endpoint.write_characteristic, endpoint.notify_characteristic);
    }

    #[test]
    fn test_select_requires_descriptor() {
        let chars = vec![characteristic("00ff", "ff01", &[])];
        assert!(select_camera_endpoint("dev", &chars).is_none());
    }

    #[test]
    fn test_select_is_case_insensitive_and_last_wins() {
        let chars = vec![
            characteristic("a", "FF01", &["2902"]),
            characteristic("b", "0000FF01-0000", &["2902"]),
        ];
        let endpoint = select_camera_endpoint("dev", &chars).unwrap();
        assert_eq!(endpoint.notify_service, "b");
    }

    #[test]
    fn test_no_camera_characteristic() {
        let chars = vec![characteristic("180f", "2a19", &["2902"])];
        assert!(select_camera_endpoint("dev", &chars).is_none());
    }

    #[test]
    fn test_endpoint_matches() {
        let endpoint = select_camera_endpoint("dev", &[characteristic("s", "ff01", &["2902"])])
            .unwrap();
        assert!(endpoint.matches("dev", "FF01"));
        assert!(!endpoint.matches("other", "ff01"));
        assert!(!endpoint.matches("dev", "ff02"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            LinkError::NotConnected("dev".into()).to_string(),
            "peripheral dev is not connected"
        );
    }
}
