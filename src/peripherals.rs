//! Bookkeeping for discovered BLE peripherals
//!
//! One coordinator owns the registry and changes it only through the
//! methods below; nothing hands out mutable references to entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::CAMERA_NAME_PREFIX;

/// Name shown for peripherals that advertise none
pub const UNNAMED_PERIPHERAL: &str = "NO NAME";

/// A discovered peripheral and its connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    /// Platform identifier (MAC address or UUID)
    pub id: String,
    /// Complete local name, or [`UNNAMED_PERIPHERAL`]
    pub name: String,
    /// Shortened advertising name, which may differ from `name`
    #[serde(default)]
    pub local_name: Option<String>,
    /// Last known signal strength in dBm
    #[serde(default)]
    pub rssi: Option<i16>,
    /// Whether a connection is established
    #[serde(default)]
    pub connected: bool,
    /// Whether a connection attempt is in flight
    #[serde(default)]
    pub connecting: bool,
}

impl Peripheral {
    /// Create an entry from a discovery event
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNNAMED_PERIPHERAL.to_string());
        Self {
            id: id.into(),
            name,
            local_name: None,
            rssi: None,
            connected: false,
            connecting: false,
        }
    }

    /// Set the signal strength
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Whether the advertised name looks like one of the camera boards
    pub fn is_camera_candidate(&self) -> bool {
        self.name.starts_with(CAMERA_NAME_PREFIX)
            || self
                .local_name
                .as_deref()
                .is_some_and(|n| n.starts_with(CAMERA_NAME_PREFIX))
    }
}

/// Keyed registry of peripherals seen during scanning
#[derive(Debug, Default, Clone)]
pub struct PeripheralRegistry {
    peripherals: BTreeMap<String, Peripheral>,
}

impl PeripheralRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything (a new scan starts from scratch)
    pub fn clear(&mut self) {
        self.peripherals.clear();
    }

    /// Record a discovery, keeping the connection flags of a known entry
    pub fn upsert_discovered(&mut self, mut peripheral: Peripheral) {
        if let Some(existing) = self.peripherals.get(&peripheral.id) {
            peripheral.connected = existing.connected;
            peripheral.connecting = existing.connecting;
            if peripheral.rssi.is_none() {
                peripheral.rssi = existing.rssi;
            }
        }
        if peripheral.is_camera_candidate() {
            log::info!("Found camera board {} ({})", peripheral.name, peripheral.id);
        } else {
            log::debug!("Discovered peripheral {} ({})", peripheral.name, peripheral.id);
        }
        self.peripherals.insert(peripheral.id.clone(), peripheral);
    }

    /// Mark a connection attempt as started. Returns false for unknown ids.
    pub fn mark_connecting(&mut self, id: &str) -> bool {
        self.update(id, |p| {
            p.connecting = true;
        })
    }

    /// Mark a peripheral connected. Returns false for unknown ids.
    pub fn mark_connected(&mut self, id: &str) -> bool {
        self.update(id, |p| {
            p.connecting = false;
            p.connected = true;
        })
    }

    /// Mark a peripheral disconnected. Returns false for unknown ids.
    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        self.update(id, |p| {
            p.connecting = false;
            p.connected = false;
        })
    }

    /// Record a fresh RSSI reading. Returns false for unknown ids.
    pub fn update_rssi(&mut self, id: &str, rssi: i16) -> bool {
        self.update(id, |p| {
            p.rssi = Some(rssi);
        })
    }

    /// Look up a peripheral
    pub fn get(&self, id: &str) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    /// All peripherals in id order
    pub fn iter(&self) -> impl Iterator<Item = &Peripheral> {
        self.peripherals.values()
    }

    /// Peripherals whose name marks them as camera boards
    pub fn camera_candidates(&self) -> impl Iterator<Item = &Peripheral> {
        self.iter().filter(|p| p.is_camera_candidate())
    }

    /// Number of known peripherals
    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    /// Whether no peripheral is known
    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    fn update(&mut self, id: &str, apply: impl FnOnce(&mut Peripheral)) -> bool {
        match self.peripherals.get_mut(id) {
            Some(peripheral) => {
                apply(peripheral);
                true
            }
            None => {
                log::debug!("Ignoring update for unknown peripheral {}", id);
                false
            }
        }
    }
}
