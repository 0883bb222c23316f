use std::sync::Arc;

use super::*;
use crate::crypto;
use crate::lorawan::MacPayload;
use crate::registry::{DeviceRegistry, EndDevice, InMemoryRegistry, RootKeys};
use crate::types::{AES128Key, DevAddr, EUI64, KeyEnvelope, MacVersion, NetID};

const NS_ADDR: &str = "ns.cluster.example.com";
const AS_ADDR: &str = "as.cluster.example.com";

fn app_key() -> AES128Key {
    "000102030405060708090a0b0c0d0e0f".parse().unwrap()
}

fn nwk_key() -> AES128Key {
    "101112131415161718191a1b1c1d1e1f".parse().unwrap()
}

fn join_eui() -> EUI64 {
    "42ffffffffffffff".parse().unwrap()
}

fn dev_eui() -> EUI64 {
    "4242ffffffffffff".parse().unwrap()
}

fn device(version: MacVersion) -> EndDevice {
    EndDevice {
        device_id: "test-dev".to_string(),
        application_id: "test-app".to_string(),
        join_eui: join_eui(),
        dev_eui: dev_eui(),
        lorawan_version: version,
        network_server_address: NS_ADDR.to_string(),
        application_server_address: AS_ADDR.to_string(),
        root_keys: RootKeys {
            app_key: Some(KeyEnvelope::clear(app_key())),
            nwk_key: (version == MacVersion::V1_1).then(|| KeyEnvelope::clear(nwk_key())),
        },
        next_join_nonce: 1,
        next_dev_nonce: 0,
        used_dev_nonces: vec![],
        disable_join_nonce_check: false,
        session: None,
        session_fallback: None,
    }
}

async fn server_with(dev: EndDevice) -> (JoinServer, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.create(dev).await.unwrap();
    let prefixes = vec!["42ff000000000000/16".parse().unwrap()];
    (JoinServer::new(registry.clone(), prefixes), registry)
}

fn ns_ctx() -> CallerContext {
    CallerContext {
        net_address: NS_ADDR.to_string(),
    }
}

fn as_ctx() -> CallerContext {
    CallerContext {
        net_address: AS_ADDR.to_string(),
    }
}

/// A MIC-valid 23-byte Join-Request for the test device.
fn raw_join_request(mic_key: &AES128Key, dev_nonce: u16) -> Vec<u8> {
    let mut raw = Vec::with_capacity(23);
    raw.push(0x00); // MHDR: JoinRequest, LoRaWAN R1
    raw.extend_from_slice(&join_eui().to_le_bytes());
    raw.extend_from_slice(&dev_eui().to_le_bytes());
    raw.extend_from_slice(&dev_nonce.to_le_bytes());
    let mic = crypto::join_request_mic(mic_key, &raw).unwrap();
    raw.extend_from_slice(&mic);
    raw
}

fn join_request(version: MacVersion, mic_key: &AES128Key, dev_nonce: u16) -> JoinRequest {
    JoinRequest {
        selected_mac_version: version,
        net_id: NetID(0x00_0001),
        dev_addr: Some(DevAddr(0x0102_0304)),
        downlink_settings: DLSettings::default(),
        rx_delay: 1,
        cf_list: None,
        raw_payload: Some(raw_join_request(mic_key, dev_nonce)),
        payload: None,
    }
}

async fn stored_device(registry: &InMemoryRegistry) -> VersionedDevice {
    registry
        .find_by_identifiers(None, dev_eui())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_v1_0_2_happy_path() {
    let (js, registry) = server_with(device(MacVersion::V1_0_2)).await;
    let req = join_request(MacVersion::V1_0_2, &app_key(), 0x0042);

    let resp = js.handle_join(&ns_ctx(), &req).await.unwrap();

    // 17-byte accept, MHDR 0x20 (JoinAccept, R1).
    assert_eq!(resp.raw_payload.len(), 17);
    assert_eq!(resp.raw_payload[0], 0x20);
    assert!(resp.lifetime.is_none());

    // Legacy responses carry the NwkSKey (FNwkSIntKey slot) and AppSKey.
    assert!(resp.session_keys.f_nwk_s_int_key.is_some());
    assert!(resp.session_keys.app_s_key.is_some());
    assert!(resp.session_keys.s_nwk_s_int_key.is_none());
    assert!(resp.session_keys.nwk_s_enc_key.is_none());

    // Decrypt as the device would and verify content plus MIC.
    let body = crypto::decrypt_join_accept(&app_key(), &resp.raw_payload[1..]).unwrap();
    assert_eq!(&body[0..3], &[0x01, 0x00, 0x00]); // JoinNonce 1 (LE)
    assert_eq!(&body[3..6], &[0x01, 0x00, 0x00]); // NetID (LE)
    assert_eq!(&body[6..10], &[0x04, 0x03, 0x02, 0x01]); // DevAddr (LE)
    let mut plaintext = vec![resp.raw_payload[0]];
    plaintext.extend_from_slice(&body[..body.len() - 4]);
    let mic = crypto::legacy_join_accept_mic(&app_key(), &plaintext).unwrap();
    assert_eq!(&body[body.len() - 4..], &mic);

    // Registry state: nonce recorded, join nonce advanced, session stored.
    let dev = stored_device(&registry).await.device;
    assert_eq!(dev.used_dev_nonces, vec![0x42]);
    assert_eq!(dev.next_join_nonce, 2);
    assert_eq!(dev.session.as_ref().unwrap().keys, resp.session_keys);
    assert_eq!(dev.session.as_ref().unwrap().dev_addr, DevAddr(0x0102_0304));
    assert!(dev.session_fallback.is_none());
}

#[tokio::test]
async fn test_v1_1_happy_path() {
    let (js, registry) = server_with(device(MacVersion::V1_1)).await;
    let req = join_request(MacVersion::V1_1, &nwk_key(), 0x0000);

    let resp = js.handle_join(&ns_ctx(), &req).await.unwrap();
    assert_eq!(resp.raw_payload.len(), 17);

    // All four session keys, matching the direct derivations.
    let jn = crate::types::JoinNonce(1);
    let dn = crate::types::DevNonce(0);
    let keys = &resp.session_keys;
    assert_eq!(
        keys.f_nwk_s_int_key.as_ref().unwrap().key,
        crypto::derive_f_nwk_s_int_key(&nwk_key(), jn, join_eui(), dn)
    );
    assert_eq!(
        keys.s_nwk_s_int_key.as_ref().unwrap().key,
        crypto::derive_s_nwk_s_int_key(&nwk_key(), jn, join_eui(), dn)
    );
    assert_eq!(
        keys.nwk_s_enc_key.as_ref().unwrap().key,
        crypto::derive_nwk_s_enc_key(&nwk_key(), jn, join_eui(), dn)
    );
    assert_eq!(
        keys.app_s_key.as_ref().unwrap().key,
        crypto::derive_app_s_key(&app_key(), jn, join_eui(), dn)
    );

    // Accept is encrypted under NwkKey and its MIC keyed with JSIntKey.
    let body = crypto::decrypt_join_accept(&nwk_key(), &resp.raw_payload[1..]).unwrap();
    let mut plaintext = vec![resp.raw_payload[0]];
    plaintext.extend_from_slice(&body[..body.len() - 4]);
    let js_int_key = crypto::derive_js_int_key(&nwk_key(), dev_eui());
    let mic = crypto::join_accept_mic(&js_int_key, 0xFF, join_eui(), dn, &plaintext).unwrap();
    assert_eq!(&body[body.len() - 4..], &mic);

    let dev = stored_device(&registry).await.device;
    assert_eq!(dev.next_dev_nonce, 1);
    assert!(dev.used_dev_nonces.is_empty());
    assert_eq!(dev.next_join_nonce, 2);
    assert_eq!(dev.session.as_ref().unwrap().keys, resp.session_keys);
}

#[tokio::test]
async fn test_v1_0_replayed_dev_nonce_rejected() {
    let (js, registry) = server_with(device(MacVersion::V1_0_2)).await;
    let req = join_request(MacVersion::V1_0_2, &app_key(), 0x0042);

    js.handle_join(&ns_ctx(), &req).await.unwrap();
    let before = stored_device(&registry).await;

    let err = js.handle_join(&ns_ctx(), &req).await.unwrap_err();
    assert!(matches!(err, JoinError::DevNonceReused));

    // No state change on a failed join.
    let after = stored_device(&registry).await;
    assert_eq!(after.version, before.version);
    assert_eq!(after.device.next_join_nonce, before.device.next_join_nonce);
}

#[tokio::test]
async fn test_v1_1_dev_nonce_must_increase() {
    let mut dev = device(MacVersion::V1_1);
    dev.next_dev_nonce = 5;
    let (js, _) = server_with(dev).await;

    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 4))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::DevNonceTooSmall));

    // Equal to the expected next value is accepted.
    js.handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_v1_1_dev_nonce_counter_exhausted() {
    let mut dev = device(MacVersion::V1_1);
    dev.next_dev_nonce = u32::MAX;
    let (js, _) = server_with(dev).await;

    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 0xFFFF))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::DevNonceTooHigh));
}

#[tokio::test]
async fn test_disable_join_nonce_check_bypasses_replay_only() {
    let mut dev = device(MacVersion::V1_0_2);
    dev.disable_join_nonce_check = true;
    dev.used_dev_nonces = vec![0x42];
    let (js, _) = server_with(dev).await;

    // The replayed nonce goes through, but the MIC is still enforced.
    js.handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 0x0042))
        .await
        .unwrap();

    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &nwk_key(), 0x0043))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::MicCheckFailed(MicError::Mismatch)));
}

#[tokio::test]
async fn test_wrong_caller_rejected_before_mic() {
    let (js, registry) = server_with(device(MacVersion::V1_0_2)).await;

    // Garbage MIC: the caller check must fire first, so no MIC error
    // leaks whether key material exists.
    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 0x0042);
    if let Some(raw) = req.raw_payload.as_mut() {
        raw[19] ^= 0xFF;
    }
    let ctx = CallerContext {
        net_address: "rogue.example.com".to_string(),
    };
    let err = js.handle_join(&ctx, &req).await.unwrap_err();
    assert!(matches!(
        err,
        JoinError::AddressMismatch {
            component: Component::NetworkServer
        }
    ));
    assert_eq!(stored_device(&registry).await.version, 0);
}

#[tokio::test]
async fn test_unknown_join_eui() {
    // No configured prefix covers the device's JoinEUI.
    let registry = Arc::new(InMemoryRegistry::new());
    registry.create(device(MacVersion::V1_0)).await.unwrap();
    let js = JoinServer::new(
        registry.clone(),
        vec!["aa00000000000000/16".parse().unwrap()],
    );

    // 1.0 terminology: unknown AppEUI.
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::UnknownAppEui));

    // Newer devices: the request belongs to another cluster.
    registry.delete(dev_eui()).await.unwrap();
    registry.create(device(MacVersion::V1_1)).await.unwrap();
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::ForwardJoinRequest));
}

#[tokio::test]
async fn test_mac_version_gates() {
    // Selected version newer than the registered one.
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::MacVersionMismatch { .. }));

    // A version outside the supported set is rejected outright.
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_3, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::UnsupportedMacVersion { .. }));
}

#[tokio::test]
async fn test_missing_inputs() {
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;

    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 1);
    req.dev_addr = None;
    assert!(matches!(
        js.handle_join(&ns_ctx(), &req).await.unwrap_err(),
        JoinError::MissingDevAddr
    ));

    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 1);
    req.raw_payload = None;
    assert!(matches!(
        js.handle_join(&ns_ctx(), &req).await.unwrap_err(),
        JoinError::MissingPayload
    ));

    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 1);
    req.raw_payload = Some(vec![0x00; 22]);
    assert!(matches!(
        js.handle_join(&ns_ctx(), &req).await.unwrap_err(),
        JoinError::UnmarshalPayloadFailed(_)
    ));
}

#[tokio::test]
async fn test_short_raw_payload_fails_mic_length() {
    // With a structured payload present, the raw one is only used for the
    // MIC, where its length is checked.
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;
    let good = raw_join_request(&app_key(), 1);
    let msg = Message::parse_join_request(&good).unwrap();

    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 1);
    req.payload = Some(msg);
    req.raw_payload = Some(good[..22].to_vec());

    let err = js.handle_join(&ns_ctx(), &req).await.unwrap_err();
    assert!(matches!(
        err,
        JoinError::MicCheckFailed(MicError::Length(22))
    ));
}

#[tokio::test]
async fn test_mic_mismatch() {
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;
    // MIC computed under the wrong key.
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &nwk_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::MicCheckFailed(MicError::Mismatch)));
}

#[tokio::test]
async fn test_corrupt_registry_keys() {
    // Zero AppKey is "absent", not a key.
    let mut dev = device(MacVersion::V1_0_2);
    dev.root_keys.app_key = Some(KeyEnvelope::clear(AES128Key::default()));
    let (js, _) = server_with(dev).await;
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::CorruptRegistry(CorruptRegistryError::AppKeyMissing)
    ));

    // 1.1 requires the NwkKey envelope as well.
    let mut dev = device(MacVersion::V1_1);
    dev.root_keys.nwk_key = None;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.create(dev).await.unwrap();
    let js = JoinServer::new(
        registry,
        vec!["42ff000000000000/16".parse().unwrap()],
    );
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::CorruptRegistry(CorruptRegistryError::NwkKeyMissing)
    ));
}

#[tokio::test]
async fn test_device_not_found() {
    let registry = Arc::new(InMemoryRegistry::new());
    let js = JoinServer::new(registry, vec!["42ff000000000000/16".parse().unwrap()]);
    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::Registry(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn test_cf_list_produces_33_byte_accept() {
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;
    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 1);
    req.cf_list = Some(CFList([0x5A; 16]));

    let resp = js.handle_join(&ns_ctx(), &req).await.unwrap();
    assert_eq!(resp.raw_payload.len(), 33);

    let body = crypto::decrypt_join_accept(&app_key(), &resp.raw_payload[1..]).unwrap();
    assert_eq!(&body[12..28], &[0x5A; 16]);
}

#[tokio::test]
async fn test_get_app_s_key_across_rotation() {
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;

    let first = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap();
    let second = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 2))
        .await
        .unwrap();
    assert_ne!(
        first.session_keys.session_key_id,
        second.session_keys.session_key_id
    );

    // The current session resolves...
    let resp = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: second.session_keys.session_key_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        Some(&resp.app_s_key),
        second.session_keys.app_s_key.as_ref()
    );

    // ...and so does the previous one, via the fallback.
    let resp = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: first.session_keys.session_key_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(Some(&resp.app_s_key), first.session_keys.app_s_key.as_ref());

    // Two rotations back is gone.
    let third = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 3))
        .await
        .unwrap();
    assert!(third.session_keys.app_s_key.is_some());
    let err = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: first.session_keys.session_key_id.clone(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::SessionKeyIdMismatch));
}

#[tokio::test]
async fn test_get_app_s_key_validation() {
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;

    let err = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: EUI64::default(),
                session_key_id: "x".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::MissingDevEui));

    let err = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::MissingSessionKeyId));

    // No join has happened yet.
    let err = js
        .get_app_s_key(
            &as_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: "unknown".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::NoSession));

    // Only the Application Server may fetch the AppSKey.
    js.handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap();
    let err = js
        .get_app_s_key(
            &ns_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: "unknown".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::AddressMismatch {
            component: Component::ApplicationServer
        }
    ));
}

#[tokio::test]
async fn test_get_nwk_s_keys_v1_1() {
    let (js, _) = server_with(device(MacVersion::V1_1)).await;
    let resp = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_1, &nwk_key(), 0))
        .await
        .unwrap();

    let keys = js
        .get_nwk_s_keys(
            &ns_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: resp.session_keys.session_key_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        Some(&keys.f_nwk_s_int_key),
        resp.session_keys.f_nwk_s_int_key.as_ref()
    );
    assert_eq!(
        Some(&keys.s_nwk_s_int_key),
        resp.session_keys.s_nwk_s_int_key.as_ref()
    );
    assert_eq!(
        Some(&keys.nwk_s_enc_key),
        resp.session_keys.nwk_s_enc_key.as_ref()
    );
}

#[tokio::test]
async fn test_get_nwk_s_keys_legacy_session_incomplete() {
    // A legacy session only fills the FNwkSIntKey slot; asking for the
    // full 1.1 triple surfaces the missing envelope, not "not found".
    let (js, _) = server_with(device(MacVersion::V1_0_2)).await;
    let resp = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap();

    let err = js
        .get_nwk_s_keys(
            &ns_ctx(),
            &SessionKeyRequest {
                dev_eui: dev_eui(),
                session_key_id: resp.session_keys.session_key_id.clone(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::CorruptRegistry(CorruptRegistryError::NwkSEncKeyEnvelopeNotFound)
    ));
}

#[tokio::test]
async fn test_join_nonce_strictly_increases() {
    let (js, registry) = server_with(device(MacVersion::V1_0_2)).await;
    let mut seen = Vec::new();
    for dn in 1..=3u16 {
        let resp = js
            .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), dn))
            .await
            .unwrap();
        let body = crypto::decrypt_join_accept(&app_key(), &resp.raw_payload[1..]).unwrap();
        let jn = u32::from_le_bytes([body[0], body[1], body[2], 0]);
        seen.push(jn);
    }
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(stored_device(&registry).await.device.next_join_nonce, 4);
}

#[tokio::test]
async fn test_contended_store_surfaces_busy() {
    use async_trait::async_trait;
    use crate::registry::{RegistryError, VersionedDevice};

    /// Reads succeed, writes always conflict, as if another writer keeps
    /// winning the race.
    struct ContendedRegistry(InMemoryRegistry);

    #[async_trait]
    impl DeviceRegistry for ContendedRegistry {
        async fn find_by_identifiers(
            &self,
            join_eui: Option<EUI64>,
            dev_eui: EUI64,
        ) -> Result<VersionedDevice, RegistryError> {
            self.0.find_by_identifiers(join_eui, dev_eui).await
        }
        async fn create(&self, device: EndDevice) -> Result<(), RegistryError> {
            self.0.create(device).await
        }
        async fn store(&self, _device: VersionedDevice) -> Result<(), RegistryError> {
            Err(RegistryError::Conflict)
        }
        async fn list(&self) -> Result<Vec<EndDevice>, RegistryError> {
            self.0.list().await
        }
        async fn delete(&self, dev_eui: EUI64) -> Result<(), RegistryError> {
            self.0.delete(dev_eui).await
        }
    }

    let registry = Arc::new(ContendedRegistry(InMemoryRegistry::new()));
    registry.create(device(MacVersion::V1_0_2)).await.unwrap();
    let js = JoinServer::new(registry, vec!["42ff000000000000/16".parse().unwrap()]);

    let err = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::Busy));
}

#[tokio::test]
async fn test_key_wrapper_hook_labels_envelopes() {
    /// Stand-in for a real KEK: tags every envelope with the purpose.
    struct LabelWrapper;

    impl KeyWrapper for LabelWrapper {
        fn wrap(&self, key: AES128Key, purpose: &str) -> KeyEnvelope {
            KeyEnvelope {
                key,
                kek_label: format!("kek/{purpose}"),
            }
        }
    }

    let registry = Arc::new(InMemoryRegistry::new());
    registry.create(device(MacVersion::V1_0_2)).await.unwrap();
    let js = JoinServer::new(registry, vec!["42ff000000000000/16".parse().unwrap()])
        .with_key_wrapper(Arc::new(LabelWrapper));

    let resp = js
        .handle_join(&ns_ctx(), &join_request(MacVersion::V1_0_2, &app_key(), 1))
        .await
        .unwrap();
    assert_eq!(
        resp.session_keys.f_nwk_s_int_key.as_ref().unwrap().kek_label,
        "kek/NwkSKey"
    );
    assert_eq!(
        resp.session_keys.app_s_key.as_ref().unwrap().kek_label,
        "kek/AppSKey"
    );
}

#[tokio::test]
async fn test_structured_payload_is_authoritative() {
    // Raw and structured disagree on the DevNonce: interpretation (nonce
    // bookkeeping, derivations) follows the structured payload while the
    // MIC runs over the raw bytes.
    let (js, registry) = server_with(device(MacVersion::V1_0_2)).await;
    let raw = raw_join_request(&app_key(), 7);
    let mut msg = Message::parse_join_request(&raw).unwrap();
    if let MacPayload::JoinRequest(ref mut pld) = msg.payload {
        pld.dev_nonce = crate::types::DevNonce(9);
    }

    let mut req = join_request(MacVersion::V1_0_2, &app_key(), 7);
    req.payload = Some(msg);
    req.raw_payload = Some(raw);

    js.handle_join(&ns_ctx(), &req).await.unwrap();
    assert_eq!(
        stored_device(&registry).await.device.used_dev_nonces,
        vec![9]
    );
}
