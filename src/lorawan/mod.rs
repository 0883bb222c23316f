//! LoRaWAN PHY payload codec for the join exchange.
//!
//! Wire layouts (all multi-byte fields little-endian):
//!
//!   Join-Request: MHDR(1) | JoinEUI(8) | DevEUI(8) | DevNonce(2) | MIC(4)
//!   Join-Accept:  MHDR(1) | JoinNonce(3) | NetID(3) | DevAddr(4)
//!                 | DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4)
//!
//! Decoding and encoding are pure; the MIC is carried verbatim and checked
//! by the join engine, never here.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::types::{DevAddr, DevNonce, EUI64, JoinNonce, NetID};

/// Exact length of a Join-Request PHY payload.
pub const JOIN_REQUEST_LEN: usize = 23;

/// Join-Accept PHY payload lengths, without and with a CFList.
pub const JOIN_ACCEPT_LEN: usize = 17;
pub const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

/// Codec failure, with the reason the payload is malformed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty PHY payload")]
    Empty,
    #[error("join-request must be 23 bytes, got {0}")]
    JoinRequestLength(usize),
    #[error("unexpected message type {0}")]
    UnexpectedMType(MType),
}

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn bits(self) -> u8 {
        match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        }
    }
}

impl From<u8> for MType {
    /// Extracts the MType from a full MHDR byte.
    fn from(value: u8) -> Self {
        match (value >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            0b111 => MType::Proprietary,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// LoRaWAN Major version (low two bits of the MHDR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Unknown(u8),
}

impl Major {
    fn bits(self) -> u8 {
        match self {
            Major::LoRaWANR1 => 0b00,
            Major::Unknown(v) => v & 0x03,
        }
    }
}

impl From<u8> for Major {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0b00 => Major::LoRaWANR1,
            other => Major::Unknown(other),
        }
    }
}

impl fmt::Display for Major {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Major::LoRaWANR1 => write!(f, "LoRaWAN R1"),
            Major::Unknown(v) => write!(f, "unknown ({v:#04b})"),
        }
    }
}

/// MAC header: message type plus major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHDR {
    pub mtype: MType,
    pub major: Major,
}

impl MHDR {
    pub fn byte(self) -> u8 {
        (self.mtype.bits() << 5) | self.major.bits()
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            mtype: MType::from(b),
            major: Major::from(b),
        }
    }
}

/// Join-Request MACPayload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub join_eui: EUI64,
    pub dev_eui: EUI64,
    pub dev_nonce: DevNonce,
}

/// DLSettings byte of a Join-Accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DLSettings {
    /// LoRaWAN 1.1 negotiation flag (bit 7).
    pub opt_neg: bool,
    /// RX1 data-rate offset (bits 6:4).
    pub rx1_dr_offset: u8,
    /// RX2 data rate (bits 3:0).
    pub rx2_data_rate: u8,
}

impl DLSettings {
    pub fn byte(self) -> u8 {
        (u8::from(self.opt_neg) << 7)
            | ((self.rx1_dr_offset & 0x07) << 4)
            | (self.rx2_data_rate & 0x0F)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            opt_neg: b & 0x80 != 0,
            rx1_dr_offset: (b >> 4) & 0x07,
            rx2_data_rate: b & 0x0F,
        }
    }
}

/// Optional 16-byte channel frequency list, carried opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CFList(pub [u8; 16]);

/// Join-Accept MACPayload fields (plaintext form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    pub join_nonce: JoinNonce,
    pub net_id: NetID,
    pub dev_addr: DevAddr,
    pub dl_settings: DLSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CFList>,
}

impl JoinAcceptPayload {
    /// Appends the MACPayload wire form (12 or 28 bytes, no MHDR, no MIC).
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&self.join_nonce.to_le_bytes());
        buf.put_slice(&self.net_id.to_le_bytes());
        buf.put_slice(&self.dev_addr.to_le_bytes());
        buf.put_u8(self.dl_settings.byte());
        buf.put_u8(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            buf.put_slice(&cf_list.0);
        }
    }
}

/// Decoded MACPayload variants of the join exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacPayload {
    JoinRequest(JoinRequestPayload),
    JoinAccept(JoinAcceptPayload),
}

impl MacPayload {
    pub fn as_join_request(&self) -> Option<&JoinRequestPayload> {
        match self {
            MacPayload::JoinRequest(pld) => Some(pld),
            MacPayload::JoinAccept(_) => None,
        }
    }
}

/// A parsed PHY payload: header, MACPayload and the MIC as carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub mhdr: MHDR,
    pub payload: MacPayload,
    pub mic: [u8; 4],
}

impl Message {
    /// Parses a raw Join-Request PHY payload. Any length other than 23
    /// bytes, or any MType other than JoinRequest, is malformed.
    pub fn parse_join_request(data: &[u8]) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Empty);
        }
        let mhdr = MHDR::from_byte(data[0]);
        if mhdr.mtype != MType::JoinRequest {
            return Err(CodecError::UnexpectedMType(mhdr.mtype));
        }
        if data.len() != JOIN_REQUEST_LEN {
            return Err(CodecError::JoinRequestLength(data.len()));
        }

        let mut buf = &data[1..];
        let mut join_eui = [0u8; 8];
        buf.copy_to_slice(&mut join_eui);
        let mut dev_eui = [0u8; 8];
        buf.copy_to_slice(&mut dev_eui);
        let dev_nonce = buf.get_u16_le();
        let mut mic = [0u8; 4];
        buf.copy_to_slice(&mut mic);

        Ok(Self {
            mhdr,
            payload: MacPayload::JoinRequest(JoinRequestPayload {
                join_eui: EUI64::from_le_bytes(join_eui),
                dev_eui: EUI64::from_le_bytes(dev_eui),
                dev_nonce: DevNonce(dev_nonce),
            }),
            mic,
        })
    }

    /// Serializes to the canonical wire form, MIC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.payload {
            MacPayload::JoinRequest(pld) => {
                let mut buf = Vec::with_capacity(JOIN_REQUEST_LEN);
                buf.put_u8(self.mhdr.byte());
                buf.put_slice(&pld.join_eui.to_le_bytes());
                buf.put_slice(&pld.dev_eui.to_le_bytes());
                buf.put_slice(&pld.dev_nonce.to_le_bytes());
                buf.put_slice(&self.mic);
                buf
            }
            MacPayload::JoinAccept(pld) => {
                let cap = if pld.cf_list.is_some() {
                    JOIN_ACCEPT_CFLIST_LEN
                } else {
                    JOIN_ACCEPT_LEN
                };
                let mut buf = Vec::with_capacity(cap);
                buf.put_u8(self.mhdr.byte());
                pld.append_to(&mut buf);
                buf.put_slice(&self.mic);
                buf
            }
        }
    }
}
