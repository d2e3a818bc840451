//! Radio addresses and neighbor entries.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Instant;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 6-byte hardware address of a badge radio. Serializable for the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MacAddress(#[serde(with = "bytes_6")] [u8; 6]);

mod bytes_6 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 6], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 6], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 6 bytes"))
    }
}

/// Address every badge listens on for presence beacons.
pub const DISCOVERY_ADDRESS: MacAddress = MacAddress([0xbb; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Random unicast, locally administered address. Used when the host has no hardware id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        MacAddress(bytes)
    }

    pub fn is_discovery(&self) -> bool {
        *self == DISCOVERY_ADDRESS
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid address {0:?}, expected six hex octets like aa:bb:cc:dd:ee:ff")]
pub struct ParseAddressError(String);

impl FromStr for MacAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseAddressError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseAddressError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

/// A neighbor as last heard on air. Identity is the address alone.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    pub address: MacAddress,
    pub display_name: String,
    /// Signal strength of the last beacon, dBm.
    pub signal_strength: i8,
    pub last_seen_at: Instant,
}

impl PeerAddress {
    pub fn new(address: MacAddress, display_name: String, signal_strength: i8, now: Instant) -> Self {
        Self {
            address,
            display_name,
            signal_strength,
            last_seen_at: now,
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}({})",
            self.address, self.display_name, self.signal_strength
        )
    }
}
