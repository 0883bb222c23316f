//! LoRaWAN cryptographic primitives for the join procedure.
//!
//! Three families, all over AES-128:
//! - MICs: CMAC (RFC 4493) truncated to 4 bytes.
//! - Session key derivation: one ECB encryption of a tagged block.
//! - Join-Accept encryption: ECB *decryption* of the plaintext, so the
//!   device recovers it with a plain AES encrypt.
//!
//! Multi-byte derivation inputs (JoinNonce, JoinEUI, DevNonce, NetID,
//! DevEUI) enter the blocks in wire order (little-endian).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use thiserror::Error;

use crate::types::{AES128Key, DevNonce, EUI64, JoinNonce, NetID};

/// MIC size in bytes.
pub const MIC_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;

/// Internal primitive failure.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("payload length {0} is not a multiple of the AES block size")]
    InvalidBlockLength(usize),
}

fn cmac4(key: &AES128Key, chunks: &[&[u8]]) -> Result<[u8; MIC_SIZE], CryptoError> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    for chunk in chunks {
        mac.update(chunk);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    Ok(mic)
}

/// MIC over the first 19 bytes of a Join-Request (MHDR through DevNonce).
/// Keyed with NwkKey (1.1) or AppKey (1.0.x).
pub fn join_request_mic(key: &AES128Key, data: &[u8]) -> Result<[u8; MIC_SIZE], CryptoError> {
    cmac4(key, &[data])
}

/// LoRaWAN 1.1 Join-Accept MIC, keyed with JSIntKey. The CMAC input is
/// `JoinReqType(1) | JoinEUI(8 LE) | DevNonce(2 LE) | plaintext`; a
/// join-accept answering a Join-Request uses type 0xFF.
pub fn join_accept_mic(
    js_int_key: &AES128Key,
    join_req_type: u8,
    join_eui: EUI64,
    dev_nonce: DevNonce,
    plaintext: &[u8],
) -> Result<[u8; MIC_SIZE], CryptoError> {
    cmac4(
        js_int_key,
        &[
            &[join_req_type],
            &join_eui.to_le_bytes(),
            &dev_nonce.to_le_bytes(),
            plaintext,
        ],
    )
}

/// LoRaWAN 1.0.x Join-Accept MIC: CMAC of the plaintext under AppKey.
pub fn legacy_join_accept_mic(
    key: &AES128Key,
    plaintext: &[u8],
) -> Result<[u8; MIC_SIZE], CryptoError> {
    cmac4(key, &[plaintext])
}

/// Encrypts a Join-Accept body (everything after the MHDR, MIC included).
/// Per the LoRaWAN specification this is an AES-ECB decrypt.
pub fn encrypt_join_accept(key: &AES128Key, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if body.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(body.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = body.to_vec();
    for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Recovers a Join-Accept body from its encrypted form; this is what the
/// end device does (a plain AES encrypt).
pub fn decrypt_join_accept(key: &AES128Key, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if body.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(body.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = body.to_vec();
    for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

fn derive(key: &AES128Key, block: [u8; BLOCK_SIZE]) -> AES128Key {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut b = GenericArray::from(block);
    cipher.encrypt_block(&mut b);
    AES128Key(b.into())
}

/// Tagged derivation block for the 1.1 session keys:
/// `tag | JoinNonce(3 LE) | JoinEUI(8 LE) | DevNonce(2 LE) | pad`.
fn session_block_1_1(tag: u8, jn: JoinNonce, join_eui: EUI64, dn: DevNonce) -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = tag;
    b[1..4].copy_from_slice(&jn.to_le_bytes());
    b[4..12].copy_from_slice(&join_eui.to_le_bytes());
    b[12..14].copy_from_slice(&dn.to_le_bytes());
    b
}

/// Tagged derivation block for the 1.0.x session keys:
/// `tag | JoinNonce(3 LE) | NetID(3 LE) | DevNonce(2 LE) | pad`.
fn session_block_legacy(tag: u8, jn: JoinNonce, net_id: NetID, dn: DevNonce) -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = tag;
    b[1..4].copy_from_slice(&jn.to_le_bytes());
    b[4..7].copy_from_slice(&net_id.to_le_bytes());
    b[7..9].copy_from_slice(&dn.to_le_bytes());
    b
}

/// Join Server integrity key, used to key the 1.1 Join-Accept MIC:
/// `aes128_encrypt(NwkKey, 0x06 | DevEUI(8 LE) | pad)`.
pub fn derive_js_int_key(nwk_key: &AES128Key, dev_eui: EUI64) -> AES128Key {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = 0x06;
    b[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    derive(nwk_key, b)
}

pub fn derive_f_nwk_s_int_key(
    nwk_key: &AES128Key,
    jn: JoinNonce,
    join_eui: EUI64,
    dn: DevNonce,
) -> AES128Key {
    derive(nwk_key, session_block_1_1(0x01, jn, join_eui, dn))
}

pub fn derive_app_s_key(
    app_key: &AES128Key,
    jn: JoinNonce,
    join_eui: EUI64,
    dn: DevNonce,
) -> AES128Key {
    derive(app_key, session_block_1_1(0x02, jn, join_eui, dn))
}

pub fn derive_s_nwk_s_int_key(
    nwk_key: &AES128Key,
    jn: JoinNonce,
    join_eui: EUI64,
    dn: DevNonce,
) -> AES128Key {
    derive(nwk_key, session_block_1_1(0x03, jn, join_eui, dn))
}

pub fn derive_nwk_s_enc_key(
    nwk_key: &AES128Key,
    jn: JoinNonce,
    join_eui: EUI64,
    dn: DevNonce,
) -> AES128Key {
    derive(nwk_key, session_block_1_1(0x04, jn, join_eui, dn))
}

/// 1.0.x NwkSKey; the engine reuses it for all three network session keys.
pub fn derive_legacy_nwk_s_key(
    app_key: &AES128Key,
    jn: JoinNonce,
    net_id: NetID,
    dn: DevNonce,
) -> AES128Key {
    derive(app_key, session_block_legacy(0x01, jn, net_id, dn))
}

pub fn derive_legacy_app_s_key(
    app_key: &AES128Key,
    jn: JoinNonce,
    net_id: NetID,
    dn: DevNonce,
) -> AES128Key {
    derive(app_key, session_block_legacy(0x02, jn, net_id, dn))
}
