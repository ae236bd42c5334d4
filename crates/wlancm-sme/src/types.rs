//! Shared identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use wlancm_commands::VdevId;

/// Pseudo vdev owning pdev-level commands (dual-MAC, antenna mode).
pub const PDEV_VDEV_ID: VdevId = VdevId::MAX;

/// 48-bit IEEE MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Broadcast address, used on the wire for all-peer TWT requests.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// All-zero address.
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// Error parsing a textual MAC address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ParseMacError(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }

        Ok(MacAddr(octets))
    }
}

/// Operating role of a virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdevRole {
    /// Station, associated to one AP
    Sta,
    /// Soft AP, serving many stations
    Sap,
}

impl fmt::Display for VdevRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VdevRole::Sta => write!(f, "sta"),
            VdevRole::Sap => write!(f, "sap"),
        }
    }
}

/// Registered virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdevInfo {
    pub vdev_id: VdevId,
    pub role: VdevRole,
    /// BSSID of the current association (STA only)
    pub bssid: Option<MacAddr>,
}

impl VdevInfo {
    pub fn new(vdev_id: VdevId, role: VdevRole) -> Self {
        Self {
            vdev_id,
            role,
            bssid: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bssid.is_some()
    }
}
