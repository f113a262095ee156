//! Discovered-device catalog.
//!
//! Keeps an in-memory, deduplicated view of the devices seen during the
//! current scan, sorted so the most plausible scale is first.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Name substrings that mark a device as likely to be the target instrument.
///
/// Matched case-insensitively against the advertised local name.
const SCALE_NAME_HINTS: &[&str] = &["scale", "weigh", "balance", "wh-", "bt-sc"];

/// A candidate instrument seen during scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaleDevice {
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Transport address (MAC-like identifier).
    pub address: String,
    /// Signal strength in dBm at the last sighting.
    pub rssi: Option<i16>,
    /// When the device was last sighted.
    pub last_seen: DateTime<Utc>,
}

impl ScaleDevice {
    /// Heuristic: does the advertised name look like a weighing instrument?
    pub fn is_likely_scale(&self) -> bool {
        let Some(name) = &self.name else {
            return false;
        };
        let lower = name.to_lowercase();
        SCALE_NAME_HINTS.iter().any(|hint| lower.contains(hint))
    }

    /// Display name for the UI layer: advertised name, or the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// One scan sighting as reported by the transport.
#[derive(Debug, Clone)]
pub struct Sighting {
    /// Transport address.
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Deduplicated, sorted view of devices seen during the current scan.
///
/// Sightings are keyed by address; a repeat sighting refreshes the entry
/// rather than duplicating it. Entries persist until the next scan clears
/// the catalog.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: HashMap<String, ScaleDevice>,
}

impl DeviceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all entries. Called when a new scan starts.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Record a sighting and return the full re-sorted device list.
    ///
    /// A repeat sighting refreshes the entry; a nameless refresh keeps the
    /// previously advertised name (not every advertisement carries one).
    pub fn upsert(&mut self, sighting: Sighting) -> Vec<ScaleDevice> {
        let name = sighting.name.or_else(|| {
            self.devices
                .get(&sighting.address)
                .and_then(|d| d.name.clone())
        });
        let device = ScaleDevice {
            name,
            address: sighting.address.clone(),
            rssi: sighting.rssi,
            last_seen: Utc::now(),
        };
        self.devices.insert(sighting.address, device);
        self.sorted()
    }

    /// Look up a device by address.
    pub fn get(&self, address: &str) -> Option<&ScaleDevice> {
        self.devices.get(address)
    }

    /// Number of devices currently catalogued.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Current device list: likely scales first, then by signal strength.
    pub fn sorted(&self) -> Vec<ScaleDevice> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| {
            (
                std::cmp::Reverse(d.is_likely_scale()),
                std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)),
            )
        });
        devices
    }
}
