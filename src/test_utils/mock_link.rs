//! In-memory [`CameraLink`] that records every call

use std::collections::BTreeSet;

use crate::link::{CameraLink, CharacteristicInfo, LinkError, Result};

/// Service UUID of the camera firmware
pub const CAMERA_SERVICE: &str = "000000ff-0000-1000-8000-00805f9b34fb";
/// Notify/write characteristic UUID of the camera firmware
pub const CAMERA_CHARACTERISTIC: &str = "0000ff01-0000-1000-8000-00805f9b34fb";

/// One call made against a [`MockLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// `start_scan(seconds)`
    StartScan(u64),
    /// `stop_scan()`
    StopScan,
    /// `connect(id)`
    Connect(String),
    /// `disconnect(id)`
    Disconnect(String),
    /// `retrieve_services(id)`
    RetrieveServices(String),
    /// `request_mtu(id, mtu)`
    RequestMtu(String, u16),
    /// `write_without_response(id, service, characteristic, data)`
    Write {
        /// Peripheral id
        id: String,
        /// Characteristic written to
        characteristic: String,
        /// Bytes written
        data: Vec<u8>,
    },
    /// `start_notification(id, service, characteristic)`
    StartNotification(String, String),
    /// `stop_notification(id, service, characteristic)`
    StopNotification(String, String),
}

/// Scriptable transport for session tests
#[derive(Debug, Default)]
pub struct MockLink {
    /// Calls in the order they were made
    pub calls: Vec<LinkCall>,
    /// Result of every `retrieve_services`
    pub services: Vec<CharacteristicInfo>,
    /// MTU granted by the peer; `None` grants whatever is requested
    pub negotiated_mtu: Option<u16>,
    /// Make `connect` fail
    pub fail_connect: bool,
    connected: BTreeSet<String>,
}

impl MockLink {
    /// A link whose peripherals expose the camera service
    pub fn camera() -> Self {
        Self {
            services: vec![
                CharacteristicInfo {
                    service: "1800".to_string(),
                    characteristic: "2a00".to_string(),
                    descriptors: Vec::new(),
                },
                CharacteristicInfo {
                    service: CAMERA_SERVICE.to_string(),
                    characteristic: CAMERA_CHARACTERISTIC.to_string(),
                    descriptors: vec!["2902".to_string()],
                },
            ],
            ..Self::default()
        }
    }

    /// Whether `id` is currently connected
    pub fn is_connected(&self, id: &str) -> bool {
        self.connected.contains(id)
    }

    fn require_connected(&self, id: &str) -> Result<()> {
        if self.is_connected(id) {
            Ok(())
        } else {
            Err(LinkError::NotConnected(id.to_string()))
        }
    }
}

impl CameraLink for MockLink {
    fn start_scan(&mut self, seconds: u64) -> Result<()> {
        self.calls.push(LinkCall::StartScan(seconds));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.calls.push(LinkCall::StopScan);
        Ok(())
    }

    fn connect(&mut self, id: &str) -> Result<()> {
        self.calls.push(LinkCall::Connect(id.to_string()));
        if self.fail_connect {
            return Err(LinkError::Transport(format!("connection to {} refused", id)));
        }
        self.connected.insert(id.to_string());
        Ok(())
    }

    fn disconnect(&mut self, id: &str) -> Result<()> {
        self.calls.push(LinkCall::Disconnect(id.to_string()));
        self.connected.remove(id);
        Ok(())
    }

    fn retrieve_services(&mut self, id: &str) -> Result<Vec<CharacteristicInfo>> {
        self.calls.push(LinkCall::RetrieveServices(id.to_string()));
        self.require_connected(id)?;
        Ok(self.services.clone())
    }

    fn request_mtu(&mut self, id: &str, mtu: u16) -> Result<u16> {
        self.calls.push(LinkCall::RequestMtu(id.to_string(), mtu));
        self.require_connected(id)?;
        Ok(self.negotiated_mtu.unwrap_or(mtu))
    }

    fn write_without_response(
        &mut self,
        id: &str,
        _service: &str,
        characteristic: &str,
        data: &[u8],
    ) -> Result<()> {
        self.calls.push(LinkCall::Write {
            id: id.to_string(),
            characteristic: characteristic.to_string(),
            data: data.to_vec(),
        });
        self.require_connected(id)
    }

    fn start_notification(&mut self, id: &str, _service: &str, characteristic: &str) -> Result<()> {
        self.calls
            .push(LinkCall::StartNotification(id.to_string(), characteristic.to_string()));
        self.require_connected(id)
    }

    fn stop_notification(&mut self, id: &str, _service: &str, characteristic: &str) -> Result<()> {
        self.calls
            .push(LinkCall::StopNotification(id.to_string(), characteristic.to_string()));
        self.require_connected(id)
    }
}
