//! The Join Server engine.
//!
//! `handle_join` runs one join transaction: validate the request, look the
//! device up, authenticate the caller, check the MIC and the nonce
//! discipline for the selected MAC version, build and encrypt the
//! Join-Accept, derive the session keys, and persist the nonce advance and
//! session rotation before the response leaves the engine.
//!
//! `get_app_s_key` / `get_nwk_s_keys` let the Application/Network Server
//! retrieve the issued keys later, by DevEUI and session key ID, falling
//! back to the previous session across one rotation.
//!
//! The engine holds only immutable configuration; per-device serialization
//! comes from the registry's optimistic `store` plus a bounded retry of the
//! whole procedure, so no failed join ever mutates a record.

pub mod error;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::lorawan::{
    CFList, CodecError, DLSettings, JoinAcceptPayload, MType, Major, Message, MHDR,
    JOIN_ACCEPT_CFLIST_LEN, JOIN_ACCEPT_LEN, JOIN_REQUEST_LEN,
};
use crate::registry::{
    DeviceRegistry, EndDevice, RegistryError, Session, SessionKeys, VersionedDevice,
};
use crate::types::{
    AES128Key, DevAddr, EUI64, EUI64Prefix, JoinNonce, KeyEnvelope, MacVersion, NetID,
    SUPPORTED_MAC_VERSIONS,
};

pub use error::{Component, CorruptRegistryError, ErrorCategory, JoinError, MicError};

/// Attempts at the optimistic read-validate-store cycle before giving up.
const MAX_STORE_ATTEMPTS: usize = 3;

/// JoinReqType byte of a Join-Accept answering a Join-Request (rejoin
/// types 0/1/2 use their own values; they are out of scope here).
const JOIN_REQ_TYPE: u8 = 0xFF;

/// Caller identity as asserted by the transport. The transport must derive
/// `net_address` from an authenticated channel; trusting an unauthenticated
/// claim voids the caller checks entirely.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub net_address: String,
}

/// A join transaction as handed over by the Network Server.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub selected_mac_version: MacVersion,
    pub net_id: NetID,
    /// DevAddr the NS assigned for the new session.
    pub dev_addr: Option<DevAddr>,
    pub downlink_settings: DLSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CFList>,
    /// Raw 23-byte Join-Request PHY payload; authoritative for the MIC.
    pub raw_payload: Option<Vec<u8>>,
    /// Parsed payload; authoritative for interpretation when present.
    pub payload: Option<Message>,
}

#[derive(Debug, Clone)]
pub struct JoinResponse {
    /// Encrypted Join-Accept PHY payload (17 or 33 bytes).
    pub raw_payload: Vec<u8>,
    pub session_keys: SessionKeys,
    pub lifetime: Option<chrono::Duration>,
}

/// Request body of the two key-retrieval operations.
#[derive(Debug, Clone)]
pub struct SessionKeyRequest {
    pub dev_eui: EUI64,
    pub session_key_id: String,
}

#[derive(Debug, Clone)]
pub struct AppSKeyResponse {
    pub app_s_key: KeyEnvelope,
}

#[derive(Debug, Clone)]
pub struct NwkSKeysResponse {
    pub nwk_s_enc_key: KeyEnvelope,
    pub f_nwk_s_int_key: KeyEnvelope,
    pub s_nwk_s_int_key: KeyEnvelope,
}

/// Hook for delivering session keys wrapped under an operator KEK. The
/// default implementation emits clear keys with an empty label.
pub trait KeyWrapper: Send + Sync {
    fn wrap(&self, key: AES128Key, purpose: &str) -> KeyEnvelope;
}

pub struct PlaintextWrapper;

impl KeyWrapper for PlaintextWrapper {
    fn wrap(&self, key: AES128Key, _purpose: &str) -> KeyEnvelope {
        KeyEnvelope::clear(key)
    }
}

/// The Join Server core. Immutable after construction; safe to share
/// across request handlers.
pub struct JoinServer {
    registry: Arc<dyn DeviceRegistry>,
    join_eui_prefixes: Vec<EUI64Prefix>,
    key_wrapper: Arc<dyn KeyWrapper>,
}

impl JoinServer {
    pub fn new(registry: Arc<dyn DeviceRegistry>, join_eui_prefixes: Vec<EUI64Prefix>) -> Self {
        Self {
            registry,
            join_eui_prefixes,
            key_wrapper: Arc::new(PlaintextWrapper),
        }
    }

    /// Replaces the key-delivery hook, e.g. to wrap keys under AS/NS KEKs.
    pub fn with_key_wrapper(mut self, key_wrapper: Arc<dyn KeyWrapper>) -> Self {
        self.key_wrapper = key_wrapper;
        self
    }

    /// Handles one Join-Request and returns the encrypted Join-Accept plus
    /// the derived session keys.
    ///
    /// The response is only returned once the nonce advance and session
    /// rotation are durable in the registry; an optimistic-store conflict
    /// re-runs the entire validation chain.
    pub async fn handle_join(
        &self,
        ctx: &CallerContext,
        req: &JoinRequest,
    ) -> Result<JoinResponse, JoinError> {
        for attempt in 1..=MAX_STORE_ATTEMPTS {
            match self.try_join(ctx, req).await {
                Err(JoinError::Registry(RegistryError::Conflict)) => {
                    debug!(
                        "Join store conflicted (attempt {}), re-running validation",
                        attempt
                    );
                }
                other => return other,
            }
        }
        warn!(
            "Join gave up after {} contended store attempts",
            MAX_STORE_ATTEMPTS
        );
        Err(JoinError::Busy)
    }

    async fn try_join(
        &self,
        ctx: &CallerContext,
        req: &JoinRequest,
    ) -> Result<JoinResponse, JoinError> {
        let ver = req.selected_mac_version;
        if !SUPPORTED_MAC_VERSIONS.contains(&ver) {
            return Err(JoinError::UnsupportedMacVersion { version: ver });
        }

        let dev_addr = req.dev_addr.ok_or(JoinError::MissingDevAddr)?;

        // The structured payload is authoritative for interpretation; a
        // raw-only request is parsed here.
        let msg = match (req.payload.as_ref(), req.raw_payload.as_deref()) {
            (Some(msg), _) => *msg,
            (None, Some(raw)) => Message::parse_join_request(raw).map_err(|e| match e {
                CodecError::UnexpectedMType(mtype) => JoinError::WrongPayloadType { mtype },
                other => JoinError::UnmarshalPayloadFailed(other),
            })?,
            (None, None) => return Err(JoinError::MissingPayload),
        };

        if msg.mhdr.major != Major::LoRaWANR1 {
            return Err(JoinError::UnsupportedLorawanVersion {
                major: msg.mhdr.major,
            });
        }
        if msg.mhdr.mtype != MType::JoinRequest {
            return Err(JoinError::WrongPayloadType {
                mtype: msg.mhdr.mtype,
            });
        }
        let pld = *msg
            .payload
            .as_join_request()
            .ok_or(JoinError::MissingJoinRequest)?;

        if pld.dev_eui.is_zero() {
            return Err(JoinError::MissingDevEui);
        }
        if pld.join_eui.is_zero() {
            return Err(JoinError::MissingJoinEui);
        }

        // The raw payload, when provided, is authoritative for the MIC;
        // otherwise the canonical serialization stands in.
        let raw_payload = match req.raw_payload.clone() {
            Some(raw) => raw,
            None => msg.to_bytes(),
        };

        let mut dev = self
            .registry
            .find_by_identifiers(Some(pld.join_eui), pld.dev_eui)
            .await?;

        // Caller check runs before any key material is touched.
        if ctx.net_address != dev.device.network_server_address {
            return Err(JoinError::AddressMismatch {
                component: Component::NetworkServer,
            });
        }

        if !self.join_eui_prefixes.iter().any(|p| p.matches(pld.join_eui)) {
            // 1.0 calls this field AppEUI; for newer devices the request
            // belongs to another cluster.
            return if dev.device.lorawan_version == MacVersion::V1_0 {
                Err(JoinError::UnknownAppEui)
            } else {
                Err(JoinError::ForwardJoinRequest)
            };
        }

        if dev.device.lorawan_version < ver {
            return Err(JoinError::MacVersionMismatch {
                registered: dev.device.lorawan_version,
                selected: ver,
            });
        }

        let app_key = required_root_key(
            dev.device.root_keys.app_key.as_ref(),
            CorruptRegistryError::AppKeyMissing,
        )?;

        let dn = pld.dev_nonce;
        if !dev.device.disable_join_nonce_check {
            match ver {
                MacVersion::V1_1 => {
                    if dev.device.next_dev_nonce == u32::MAX {
                        return Err(JoinError::DevNonceTooHigh);
                    }
                    if u32::from(dn.0) < dev.device.next_dev_nonce {
                        return Err(JoinError::DevNonceTooSmall);
                    }
                    dev.device.next_dev_nonce = u32::from(dn.0) + 1;
                }
                _ => {
                    if dev.device.used_dev_nonces.contains(&u32::from(dn.0)) {
                        return Err(JoinError::DevNonceReused);
                    }
                }
            }
        }

        // MIC key is NwkKey for 1.1, AppKey for the 1.0.x family.
        let mic_key = if ver == MacVersion::V1_1 {
            required_root_key(
                dev.device.root_keys.nwk_key.as_ref(),
                CorruptRegistryError::NwkKeyMissing,
            )?
        } else {
            app_key
        };
        check_mic(&mic_key, &raw_payload).map_err(JoinError::MicCheckFailed)?;

        let jn = JoinNonce(dev.device.next_join_nonce);
        let accept_mhdr = MHDR {
            mtype: MType::JoinAccept,
            major: msg.mhdr.major,
        };
        let cap = if req.cf_list.is_some() {
            JOIN_ACCEPT_CFLIST_LEN
        } else {
            JOIN_ACCEPT_LEN
        };
        let mut plaintext = Vec::with_capacity(cap);
        plaintext.push(accept_mhdr.byte());
        JoinAcceptPayload {
            join_nonce: jn,
            net_id: req.net_id,
            dev_addr,
            dl_settings: req.downlink_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        }
        .append_to(&mut plaintext);

        let skid = session_key_id(jn, pld.dev_eui);
        let (mic, session_keys) = if ver == MacVersion::V1_1 {
            let nwk_key = mic_key;
            let js_int_key = crypto::derive_js_int_key(&nwk_key, pld.dev_eui);
            let mic = crypto::join_accept_mic(&js_int_key, JOIN_REQ_TYPE, pld.join_eui, dn, &plaintext)
                .map_err(JoinError::ComputeMic)?;
            let keys = SessionKeys {
                session_key_id: skid,
                f_nwk_s_int_key: Some(self.key_wrapper.wrap(
                    crypto::derive_f_nwk_s_int_key(&nwk_key, jn, pld.join_eui, dn),
                    "FNwkSIntKey",
                )),
                s_nwk_s_int_key: Some(self.key_wrapper.wrap(
                    crypto::derive_s_nwk_s_int_key(&nwk_key, jn, pld.join_eui, dn),
                    "SNwkSIntKey",
                )),
                nwk_s_enc_key: Some(self.key_wrapper.wrap(
                    crypto::derive_nwk_s_enc_key(&nwk_key, jn, pld.join_eui, dn),
                    "NwkSEncKey",
                )),
                app_s_key: Some(self.key_wrapper.wrap(
                    crypto::derive_app_s_key(&app_key, jn, pld.join_eui, dn),
                    "AppSKey",
                )),
            };
            (mic, keys)
        } else {
            let mic = crypto::legacy_join_accept_mic(&app_key, &plaintext)
                .map_err(JoinError::ComputeMic)?;
            // The single legacy NwkSKey serves all three network purposes
            // on the NS side; it is delivered in the FNwkSIntKey slot.
            let keys = SessionKeys {
                session_key_id: skid,
                f_nwk_s_int_key: Some(self.key_wrapper.wrap(
                    crypto::derive_legacy_nwk_s_key(&app_key, jn, req.net_id, dn),
                    "NwkSKey",
                )),
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: Some(self.key_wrapper.wrap(
                    crypto::derive_legacy_app_s_key(&app_key, jn, req.net_id, dn),
                    "AppSKey",
                )),
            };
            (mic, keys)
        };

        // Join-Accept encryption covers everything after the MHDR, MIC
        // included.
        let mut body = plaintext[1..].to_vec();
        body.extend_from_slice(&mic);
        let enc = crypto::encrypt_join_accept(&mic_key, &body)
            .map_err(JoinError::EncryptPayloadFailed)?;
        let mut raw_response = Vec::with_capacity(1 + enc.len());
        raw_response.push(plaintext[0]);
        raw_response.extend_from_slice(&enc);

        // Commit: nonce bookkeeping, join-nonce advance, session rotation.
        // The store must succeed before the response leaves the engine, so
        // a captured request can never be replayed against stale state.
        if ver.is_legacy() {
            dev.device.used_dev_nonces.push(u32::from(dn.0));
        }
        dev.device.next_join_nonce += 1;
        dev.device.rotate_session(Session {
            dev_addr,
            started_at: Utc::now(),
            keys: session_keys.clone(),
        });

        let device_id = dev.device.device_id.clone();
        self.registry.store(dev).await?;

        info!(
            "Join accepted for device {} (DevEUI {}, MAC {}, DevNonce {})",
            device_id, pld.dev_eui, ver, dn
        );
        Ok(JoinResponse {
            raw_payload: raw_response,
            session_keys,
            lifetime: None,
        })
    }

    /// Returns the AppSKey envelope for the session matching the request.
    /// Callable by the device's Application Server only.
    pub async fn get_app_s_key(
        &self,
        ctx: &CallerContext,
        req: &SessionKeyRequest,
    ) -> Result<AppSKeyResponse, JoinError> {
        let dev = self.session_lookup(req).await?;
        if ctx.net_address != dev.device.application_server_address {
            return Err(JoinError::AddressMismatch {
                component: Component::ApplicationServer,
            });
        }
        let session = select_session(&dev.device, &req.session_key_id)?;
        let app_s_key = session.keys.app_s_key.clone().ok_or(JoinError::CorruptRegistry(
            CorruptRegistryError::AppSKeyEnvelopeNotFound,
        ))?;
        Ok(AppSKeyResponse { app_s_key })
    }

    /// Returns the three network session key envelopes for the session
    /// matching the request. Callable by the device's Network Server only.
    pub async fn get_nwk_s_keys(
        &self,
        ctx: &CallerContext,
        req: &SessionKeyRequest,
    ) -> Result<NwkSKeysResponse, JoinError> {
        let dev = self.session_lookup(req).await?;
        if ctx.net_address != dev.device.network_server_address {
            return Err(JoinError::AddressMismatch {
                component: Component::NetworkServer,
            });
        }
        let session = select_session(&dev.device, &req.session_key_id)?;
        let nwk_s_enc_key = session.keys.nwk_s_enc_key.clone().ok_or(
            JoinError::CorruptRegistry(CorruptRegistryError::NwkSEncKeyEnvelopeNotFound),
        )?;
        let f_nwk_s_int_key = session.keys.f_nwk_s_int_key.clone().ok_or(
            JoinError::CorruptRegistry(CorruptRegistryError::FNwkSIntKeyEnvelopeNotFound),
        )?;
        let s_nwk_s_int_key = session.keys.s_nwk_s_int_key.clone().ok_or(
            JoinError::CorruptRegistry(CorruptRegistryError::SNwkSIntKeyEnvelopeNotFound),
        )?;
        Ok(NwkSKeysResponse {
            nwk_s_enc_key,
            f_nwk_s_int_key,
            s_nwk_s_int_key,
        })
    }

    async fn session_lookup(
        &self,
        req: &SessionKeyRequest,
    ) -> Result<VersionedDevice, JoinError> {
        if req.dev_eui.is_zero() {
            return Err(JoinError::MissingDevEui);
        }
        if req.session_key_id.is_empty() {
            return Err(JoinError::MissingSessionKeyId);
        }
        Ok(self.registry.find_by_identifiers(None, req.dev_eui).await?)
    }
}

fn required_root_key(
    envelope: Option<&KeyEnvelope>,
    missing: CorruptRegistryError,
) -> Result<AES128Key, JoinError> {
    match envelope {
        Some(ke) if !ke.key.is_zero() => Ok(ke.key),
        _ => Err(JoinError::CorruptRegistry(missing)),
    }
}

/// Verifies the Join-Request MIC: CMAC over the first 19 bytes of the raw
/// payload against the trailing 4.
fn check_mic(key: &AES128Key, raw_payload: &[u8]) -> Result<(), MicError> {
    if raw_payload.len() != JOIN_REQUEST_LEN {
        return Err(MicError::Length(raw_payload.len()));
    }
    let computed = crypto::join_request_mic(key, &raw_payload[..19]).map_err(MicError::Compute)?;
    if computed[..] != raw_payload[19..] {
        return Err(MicError::Mismatch);
    }
    Ok(())
}

/// Deterministic session key ID: hex of `JoinNonce(3 LE) || DevEUI(8)`.
/// Opaque to callers; stable across the session's lifetime.
fn session_key_id(jn: JoinNonce, dev_eui: EUI64) -> String {
    let mut bytes = Vec::with_capacity(11);
    bytes.extend_from_slice(&jn.to_le_bytes());
    bytes.extend_from_slice(dev_eui.as_bytes());
    hex::encode(bytes)
}

/// Picks the current session when its key ID matches, otherwise the
/// fallback kept across one rotation.
fn select_session<'a>(device: &'a EndDevice, session_key_id: &str) -> Result<&'a Session, JoinError> {
    let session = device.session.as_ref().ok_or(JoinError::NoSession)?;
    if session.keys.session_key_id == session_key_id {
        return Ok(session);
    }
    match device.session_fallback.as_ref() {
        Some(fallback) if fallback.keys.session_key_id == session_key_id => Ok(fallback),
        _ => Err(JoinError::SessionKeyIdMismatch),
    }
}
