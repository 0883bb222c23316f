//! Development wire protocol between NS/AS and this Join Server.
//!
//! Each UDP datagram is a simple binary header followed by a JSON body:
//!
//!   version(1) | token(2, big-endian) | type(1) | JSON payload
//!
//! The token is echoed in the answer so callers can match responses.
//! EUIs and keys travel as hex strings, PHY payloads as base64.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::registry::SessionKeys;
use crate::types::{DevAddr, EUI64, KeyEnvelope, NetID};

/// Protocol version (always 0x01).
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Packet types (identifier byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    JoinReq = 0x00,
    JoinAns = 0x01,
    AppSKeyReq = 0x02,
    AppSKeyAns = 0x03,
    NwkSKeysReq = 0x04,
    NwkSKeysAns = 0x05,
    ErrorAns = 0x3F,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::JoinReq),
            0x01 => Ok(PacketType::JoinAns),
            0x02 => Ok(PacketType::AppSKeyReq),
            0x03 => Ok(PacketType::AppSKeyAns),
            0x04 => Ok(PacketType::NwkSKeysReq),
            0x05 => Ok(PacketType::NwkSKeysAns),
            0x3F => Ok(PacketType::ErrorAns),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// A parsed frame: header fields plus the raw JSON body.
#[derive(Debug)]
pub struct Packet {
    pub token: u16,
    pub packet_type: PacketType,
    pub body: Vec<u8>,
}

impl Packet {
    /// Parse a raw UDP datagram.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Frame too short: {} bytes", data.len()));
        }
        let mut buf = data;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }
        let token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;
        Ok(Packet {
            token,
            packet_type,
            body: buf.to_vec(),
        })
    }

    /// Build a frame for the given token, type and JSON body.
    pub fn encode(token: u16, packet_type: PacketType, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(token);
        buf.put_u8(packet_type as u8);
        buf.put_slice(body);
        buf.to_vec()
    }
}

/// JOIN_REQ body, sent by a Network Server.
///
/// `sender_address` is the caller's asserted hostname. This development
/// transport trusts it as-is; production deployments must derive the
/// caller identity from an authenticated channel (e.g. mTLS).
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinReqBody {
    pub sender_address: String,
    pub mac_version: String,
    pub net_id: NetID,
    #[serde(default)]
    pub dev_addr: Option<DevAddr>,
    #[serde(default)]
    pub dl_settings: u8,
    #[serde(default)]
    pub rx_delay: u8,
    /// Optional CFList, 32 hex characters.
    #[serde(default)]
    pub cf_list: Option<String>,
    /// Raw Join-Request PHY payload, base64.
    pub phy_payload: String,
}

/// JOIN_ANS body.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinAnsBody {
    /// Encrypted Join-Accept PHY payload, base64.
    pub phy_payload: String,
    pub session_keys: SessionKeys,
}

/// APP_SKEY_REQ / NWK_SKEYS_REQ body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionKeyReqBody {
    pub sender_address: String,
    pub dev_eui: EUI64,
    pub session_key_id: String,
}

/// APP_SKEY_ANS body.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppSKeyAnsBody {
    pub app_s_key: KeyEnvelope,
}

/// NWK_SKEYS_ANS body.
#[derive(Debug, Serialize, Deserialize)]
pub struct NwkSKeysAnsBody {
    pub nwk_s_enc_key: KeyEnvelope,
    pub f_nwk_s_int_key: KeyEnvelope,
    pub s_nwk_s_int_key: KeyEnvelope,
}

/// ERROR_ANS body: the semantic category plus a human-readable message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub category: String,
    pub message: String,
}

impl ErrorBody {
    pub fn input(message: impl Into<String>) -> Self {
        Self {
            category: "input".to_string(),
            message: message.into(),
        }
    }
}

impl From<&crate::joinserver::JoinError> for ErrorBody {
    fn from(err: &crate::joinserver::JoinError) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let body = br#"{"sender_address":"ns.example.com"}"#;
        let frame = Packet::encode(0x1234, PacketType::JoinReq, body);
        assert_eq!(frame[0], PROTOCOL_VERSION);

        let packet = Packet::parse(&frame).unwrap();
        assert_eq!(packet.token, 0x1234);
        assert_eq!(packet.packet_type, PacketType::JoinReq);
        assert_eq!(packet.body, body);
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(Packet::parse(&[0x01, 0x00]).is_err());
        // Wrong protocol version.
        assert!(Packet::parse(&[0x02, 0x00, 0x00, 0x00]).is_err());
        // Unknown packet type.
        assert!(Packet::parse(&[0x01, 0x00, 0x00, 0x7E]).is_err());
    }

    #[test]
    fn test_join_req_body_parses() {
        let json = r#"{
            "sender_address": "ns.example.com",
            "mac_version": "1.0.2",
            "net_id": "000001",
            "dev_addr": "01020304",
            "rx_delay": 1,
            "phy_payload": "AAECAwQ="
        }"#;
        let body: JoinReqBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.mac_version, "1.0.2");
        assert_eq!(body.net_id, NetID(1));
        assert_eq!(body.dev_addr, Some(DevAddr(0x0102_0304)));
        assert_eq!(body.dl_settings, 0);
        assert!(body.cf_list.is_none());
    }
}
