//! Scalar types shared across the Join Server: EUIs, nonces, addresses,
//! root/session key material and MAC version identifiers.
//!
//! All of these are fixed-width values with a defined LoRaWAN wire order
//! (little-endian). In memory they are kept in display order (EUIs) or as
//! plain integers (nonces, addresses); conversion to wire order happens at
//! the codec and crypto boundaries, never implicitly.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when parsing the textual forms of these types.
#[derive(Debug, Error)]
pub enum ParseTypeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("unknown MAC version: {0}")]
    UnknownMacVersion(String),
    #[error("invalid EUI prefix: {0}")]
    InvalidPrefix(String),
}

/// 64-bit extended unique identifier (DevEUI, JoinEUI/AppEUI).
///
/// Stored in display order (big-endian); the LoRaWAN wire form is the
/// reverse. `to_le_bytes` produces the wire/derivation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EUI64(pub [u8; 8]);

impl EUI64 {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Wire order (little-endian) byte form.
    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut b = self.0;
        b.reverse();
        b
    }

    /// Build from wire order (little-endian) bytes.
    pub fn from_le_bytes(mut b: [u8; 8]) -> Self {
        b.reverse();
        Self(b)
    }
}

impl fmt::Display for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for EUI64 {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseTypeError::Length {
                expected: 8,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for EUI64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EUI64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A JoinEUI prefix: the top `length_bits` bits of `value` must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EUI64Prefix {
    pub value: EUI64,
    pub length_bits: u8,
}

impl EUI64Prefix {
    pub fn new(value: EUI64, length_bits: u8) -> Self {
        Self {
            value,
            length_bits: length_bits.min(64),
        }
    }

    /// True when the top `length_bits` of `eui` equal those of `value`.
    pub fn matches(&self, eui: EUI64) -> bool {
        let bits = self.length_bits as u32;
        if bits == 0 {
            return true;
        }
        let v = u64::from_be_bytes(self.value.0);
        let e = u64::from_be_bytes(eui.0);
        (v ^ e) >> (64 - bits) == 0
    }
}

impl fmt::Display for EUI64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length_bits)
    }
}

impl FromStr for EUI64Prefix {
    type Err = ParseTypeError;

    /// Parses the `"42ffffff00000000/16"` form. A bare EUI means a full
    /// 64-bit match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((eui, bits)) => {
                let value: EUI64 = eui.parse()?;
                let length_bits: u8 = bits
                    .parse()
                    .map_err(|_| ParseTypeError::InvalidPrefix(s.to_string()))?;
                if length_bits > 64 {
                    return Err(ParseTypeError::InvalidPrefix(s.to_string()));
                }
                Ok(Self { value, length_bits })
            }
            None => Ok(Self {
                value: s.parse()?,
                length_bits: 64,
            }),
        }
    }
}

impl Serialize for EUI64Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EUI64Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Device-supplied anti-replay value from a Join-Request (2 bytes on the
/// wire, little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DevNonce(pub u16);

impl DevNonce {
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for DevNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Server-issued nonce in a Join-Accept (3 bytes on the wire,
/// little-endian). Only the low 24 bits are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinNonce(pub u32);

impl JoinNonce {
    pub fn to_le_bytes(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

impl fmt::Display for JoinNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0 & 0x00ff_ffff)
    }
}

/// 32-bit short device address, assigned per session by the NS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(b: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(b))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseTypeError::Length {
                expected: 4,
                got: bytes.len(),
            })?;
        Ok(Self(u32::from_be_bytes(arr)))
    }
}

impl Serialize for DevAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DevAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// 24-bit network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetID(pub u32);

impl NetID {
    pub fn to_le_bytes(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

impl fmt::Display for NetID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0 & 0x00ff_ffff)
    }
}

impl FromStr for NetID {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 3] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseTypeError::Length {
                expected: 3,
                got: bytes.len(),
            })?;
        Ok(Self(u32::from_be_bytes([0, arr[0], arr[1], arr[2]])))
    }
}

impl Serialize for NetID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// 128-bit AES key. The all-zero key means "absent" and is rejected wherever
/// a key is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AES128Key(pub [u8; 16]);

impl AES128Key {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AES128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for AES128Key {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseTypeError::Length {
                expected: 16,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for AES128Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AES128Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A key plus the label of the KEK it is wrapped under. An empty label means
/// the key is delivered in clear inside a trusted channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub key: AES128Key,
    #[serde(default)]
    pub kek_label: String,
}

impl KeyEnvelope {
    pub fn clear(key: AES128Key) -> Self {
        Self {
            key,
            kek_label: String::new(),
        }
    }
}

/// LoRaWAN MAC version. Ordered by protocol recency, so
/// `device_version >= selected_version` is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MacVersion {
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_0_3,
    V1_0_4,
    V1_1,
}

/// MAC versions the join procedure accepts.
pub const SUPPORTED_MAC_VERSIONS: [MacVersion; 4] = [
    MacVersion::V1_0,
    MacVersion::V1_0_1,
    MacVersion::V1_0_2,
    MacVersion::V1_1,
];

impl MacVersion {
    /// True for the 1.0.x family, which uses the single-NwkSKey scheme.
    pub fn is_legacy(&self) -> bool {
        *self < MacVersion::V1_1
    }
}

impl fmt::Display for MacVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MacVersion::V1_0 => "1.0",
            MacVersion::V1_0_1 => "1.0.1",
            MacVersion::V1_0_2 => "1.0.2",
            MacVersion::V1_0_3 => "1.0.3",
            MacVersion::V1_0_4 => "1.0.4",
            MacVersion::V1_1 => "1.1",
        };
        f.write_str(s)
    }
}

impl FromStr for MacVersion {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" | "1.0.0" => Ok(MacVersion::V1_0),
            "1.0.1" => Ok(MacVersion::V1_0_1),
            "1.0.2" => Ok(MacVersion::V1_0_2),
            "1.0.3" => Ok(MacVersion::V1_0_3),
            "1.0.4" => Ok(MacVersion::V1_0_4),
            "1.1" => Ok(MacVersion::V1_1),
            other => Err(ParseTypeError::UnknownMacVersion(other.to_string())),
        }
    }
}

impl Serialize for MacVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
