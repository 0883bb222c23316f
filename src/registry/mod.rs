//! Device registry: the end-device records the join engine reads and
//! updates, the storage abstraction, and the in-memory implementation.
//!
//! Records are created out-of-band (provisioning file or the admin surface)
//! and mutated only by the join engine. Writes are optimistic: `store`
//! carries the version the caller read, and fails with `Conflict` when the
//! record moved underneath it.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{DevAddr, EUI64, KeyEnvelope, MacVersion};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device not found")]
    NotFound,
    #[error("device already exists")]
    Exists,
    #[error("device record was concurrently modified")]
    Conflict,
    #[error("registry backend failure: {0}")]
    Backend(String),
}

/// Root key envelopes held for a device. `nwk_key` exists only for
/// LoRaWAN 1.1 devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootKeys {
    pub app_key: Option<KeyEnvelope>,
    #[serde(default)]
    pub nwk_key: Option<KeyEnvelope>,
}

/// The session keys issued by a join. For 1.0.x devices the single NwkSKey
/// fills all three network slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub session_key_id: String,
    #[serde(default)]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default)]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default)]
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    #[serde(default)]
    pub app_s_key: Option<KeyEnvelope>,
}

/// One activation: the address, keys and start time of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub dev_addr: DevAddr,
    pub started_at: DateTime<Utc>,
    pub keys: SessionKeys,
}

/// End-device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndDevice {
    pub device_id: String,
    pub application_id: String,
    pub join_eui: EUI64,
    pub dev_eui: EUI64,
    /// Highest MAC version the device supports.
    pub lorawan_version: MacVersion,
    /// Hostname of the Network Server allowed to join this device.
    pub network_server_address: String,
    /// Hostname of the Application Server allowed to fetch its AppSKey.
    pub application_server_address: String,
    pub root_keys: RootKeys,
    /// Next JoinNonce to issue; strictly increasing, never reused.
    #[serde(default)]
    pub next_join_nonce: u32,
    /// Next accepted DevNonce (1.1 devices).
    #[serde(default)]
    pub next_dev_nonce: u32,
    /// Every DevNonce ever accepted (1.0.x devices).
    #[serde(default)]
    pub used_dev_nonces: Vec<u32>,
    /// Test-only escape hatch: skips the replay checks.
    #[serde(default)]
    pub disable_join_nonce_check: bool,
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub session_fallback: Option<Session>,
}

impl EndDevice {
    /// Installs a new session, keeping the previous one as the fallback so
    /// late AS/NS key queries for the old SessionKeyID still resolve.
    pub fn rotate_session(&mut self, session: Session) {
        self.session_fallback = self.session.take();
        self.session = Some(session);
    }
}

/// A device together with the registry version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedDevice {
    pub device: EndDevice,
    pub version: u64,
}

/// Storage abstraction consumed by the join engine and the admin surface.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Looks a device up by DevEUI, optionally constrained to a JoinEUI.
    async fn find_by_identifiers(
        &self,
        join_eui: Option<EUI64>,
        dev_eui: EUI64,
    ) -> Result<VersionedDevice, RegistryError>;

    async fn create(&self, device: EndDevice) -> Result<(), RegistryError>;

    /// Optimistic write: fails with `Conflict` unless the stored version
    /// still equals the one the caller read.
    async fn store(&self, device: VersionedDevice) -> Result<(), RegistryError>;

    async fn list(&self) -> Result<Vec<EndDevice>, RegistryError>;

    async fn delete(&self, dev_eui: EUI64) -> Result<(), RegistryError>;
}

/// In-memory registry keyed by DevEUI.
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<EUI64, (u64, EndDevice)>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn find_by_identifiers(
        &self,
        join_eui: Option<EUI64>,
        dev_eui: EUI64,
    ) -> Result<VersionedDevice, RegistryError> {
        let devices = self.devices.read().await;
        let (version, device) = devices.get(&dev_eui).ok_or(RegistryError::NotFound)?;
        if let Some(join_eui) = join_eui {
            if device.join_eui != join_eui {
                return Err(RegistryError::NotFound);
            }
        }
        Ok(VersionedDevice {
            device: device.clone(),
            version: *version,
        })
    }

    async fn create(&self, device: EndDevice) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.dev_eui) {
            return Err(RegistryError::Exists);
        }
        devices.insert(device.dev_eui, (0, device));
        Ok(())
    }

    async fn store(&self, device: VersionedDevice) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(&device.device.dev_eui)
            .ok_or(RegistryError::NotFound)?;
        if entry.0 != device.version {
            return Err(RegistryError::Conflict);
        }
        *entry = (device.version + 1, device.device);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<EndDevice>, RegistryError> {
        let devices = self.devices.read().await;
        Ok(devices.values().map(|(_, d)| d.clone()).collect())
    }

    async fn delete(&self, dev_eui: EUI64) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        devices
            .remove(&dev_eui)
            .map(|_| ())
            .ok_or(RegistryError::NotFound)
    }
}

/// Loads a JSON provisioning file (an array of device records) into the
/// registry. Returns the number of devices created.
pub async fn load_provisioning(
    path: &Path,
    registry: &dyn DeviceRegistry,
) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read provisioning file {:?}: {}", path, e))?;
    let devices: Vec<EndDevice> = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse provisioning file: {}", e))?;

    let mut created = 0;
    for device in devices {
        let dev_eui = device.dev_eui;
        let device_id = device.device_id.clone();
        registry
            .create(device)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to provision device {}: {}", dev_eui, e))?;
        info!("Provisioned device {} (DevEUI {})", device_id, dev_eui);
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AES128Key;

    fn device(dev_eui: &str) -> EndDevice {
        EndDevice {
            device_id: "test-dev".to_string(),
            application_id: "test-app".to_string(),
            join_eui: "42ffffffffffffff".parse().unwrap(),
            dev_eui: dev_eui.parse().unwrap(),
            lorawan_version: MacVersion::V1_0_2,
            network_server_address: "ns.example.com".to_string(),
            application_server_address: "as.example.com".to_string(),
            root_keys: RootKeys {
                app_key: Some(KeyEnvelope::clear(
                    "000102030405060708090a0b0c0d0e0f".parse().unwrap(),
                )),
                nwk_key: None,
            },
            next_join_nonce: 1,
            next_dev_nonce: 0,
            used_dev_nonces: vec![],
            disable_join_nonce_check: false,
            session: None,
            session_fallback: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let registry = InMemoryRegistry::new();
        registry.create(device("4242ffffffffffff")).await.unwrap();

        let found = registry
            .find_by_identifiers(None, "4242ffffffffffff".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(found.version, 0);
        assert_eq!(found.device.device_id, "test-dev");

        // A JoinEUI constraint that doesn't match means not found.
        let err = registry
            .find_by_identifiers(
                Some("0000000000000001".parse().unwrap()),
                "4242ffffffffffff".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let registry = InMemoryRegistry::new();
        registry.create(device("4242ffffffffffff")).await.unwrap();
        assert_eq!(
            registry.create(device("4242ffffffffffff")).await.unwrap_err(),
            RegistryError::Exists
        );
    }

    #[tokio::test]
    async fn test_optimistic_store_conflict() {
        let registry = InMemoryRegistry::new();
        registry.create(device("4242ffffffffffff")).await.unwrap();

        let dev_eui: EUI64 = "4242ffffffffffff".parse().unwrap();
        let a = registry.find_by_identifiers(None, dev_eui).await.unwrap();
        let b = registry.find_by_identifiers(None, dev_eui).await.unwrap();

        registry.store(a).await.unwrap();
        // The second writer read version 0, which has moved on.
        assert_eq!(registry.store(b).await.unwrap_err(), RegistryError::Conflict);

        let current = registry.find_by_identifiers(None, dev_eui).await.unwrap();
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn test_rotate_session_keeps_one_fallback() {
        let mut dev = device("4242ffffffffffff");
        let session = |id: &str| Session {
            dev_addr: DevAddr(1),
            started_at: Utc::now(),
            keys: SessionKeys {
                session_key_id: id.to_string(),
                ..Default::default()
            },
        };

        dev.rotate_session(session("first"));
        assert!(dev.session_fallback.is_none());

        dev.rotate_session(session("second"));
        assert_eq!(
            dev.session_fallback.as_ref().unwrap().keys.session_key_id,
            "first"
        );

        dev.rotate_session(session("third"));
        assert_eq!(
            dev.session_fallback.as_ref().unwrap().keys.session_key_id,
            "second"
        );
    }

    #[test]
    fn test_provisioning_record_parses() {
        let json = r#"[{
            "device_id": "sensor-1",
            "application_id": "app-1",
            "join_eui": "42ffffffffffffff",
            "dev_eui": "4242ffffffffffff",
            "lorawan_version": "1.0.2",
            "network_server_address": "ns.example.com",
            "application_server_address": "as.example.com",
            "root_keys": {
                "app_key": { "key": "000102030405060708090a0b0c0d0e0f" }
            },
            "next_join_nonce": 1
        }]"#;
        let devices: Vec<EndDevice> = serde_json::from_str(json).unwrap();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.lorawan_version, MacVersion::V1_0_2);
        assert_eq!(dev.next_join_nonce, 1);
        assert!(dev.used_dev_nonces.is_empty());
        assert!(!dev.disable_join_nonce_check);
        let app_key = dev.root_keys.app_key.as_ref().unwrap();
        assert_eq!(
            app_key.key,
            "000102030405060708090a0b0c0d0e0f".parse::<AES128Key>().unwrap()
        );
        assert!(app_key.kek_label.is_empty());
    }
}
