//! Device identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::util::{from_hex, hash_bits, to_hex};
use crate::{BusError, Result};

/// 64-bit device identifier, unique on a bus.
///
/// Displays as 16 lowercase hex digits, the same form used in role tables and traces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; 8]);

impl DeviceId {
    /// Build an identifier from its wire bytes.
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Random identifier, used for the host's own device and for simulated devices.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Identifier slot of a multi-command packet: the service class in the first four bytes.
    pub fn from_service_class(service_class: u32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&service_class.to_le_bytes());
        Self(bytes)
    }

    /// Build from a byte slice that must be exactly 8 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            BusError::parse("device identifier", format!("expected 8 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Four character human id (two letters, two digits) derived from a hash of the identifier.
    pub fn short_id(&self) -> String {
        let h = hash_bits(&self.0, 30);
        let chars = [
            b'A' + (h % 26) as u8,
            b'A' + (h / 26 % 26) as u8,
            b'0' + (h / (26 * 26) % 10) as u8,
            b'0' + (h / (26 * 26 * 10) % 10) as u8,
        ];
        chars.iter().map(|&c| c as char).collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", to_hex(&self.0))
    }
}

impl FromStr for DeviceId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = from_hex(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_hex() {
        let id: DeviceId = "0123456789abcdef".parse().unwrap();
        assert_eq!(id.as_bytes(), &[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
        assert_eq!(id.to_string(), "0123456789abcdef");
        assert!("0123".parse::<DeviceId>().is_err());
    }

    #[test]
    fn short_id_has_letter_letter_digit_digit_shape() {
        for _ in 0..32 {
            let short = DeviceId::random().short_id();
            let bytes = short.as_bytes();
            assert_eq!(bytes.len(), 4);
            assert!(bytes[0].is_ascii_uppercase());
            assert!(bytes[1].is_ascii_uppercase());
            assert!(bytes[2].is_ascii_digit());
            assert!(bytes[3].is_ascii_digit());
        }
    }

    #[test]
    fn short_id_is_stable() {
        let id = DeviceId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(id.short_id(), id.short_id());
    }

    #[test]
    fn service_class_identifier_is_little_endian() {
        let id = DeviceId::from_service_class(0x1473_a263);
        assert_eq!(&id.as_bytes()[..4], &[0x63, 0xa2, 0x73, 0x14]);
        assert_eq!(&id.as_bytes()[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = DeviceId::new([0xaa; 8]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"aaaaaaaaaaaaaaaa\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
