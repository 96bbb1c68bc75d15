//! Device registry persistence
//!
//! The registry is a single JSON file holding the global configuration
//! plus one `DeviceProfile` per key. All writes go through the atomic
//! write path so a crash never leaves a torn file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::FlashError;
use crate::models::{DeviceProfile, GlobalConfig};
use crate::storage::layout::StorageLayout;

/// Complete registry file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryData {
    #[serde(default)]
    pub global: GlobalConfig,

    /// key -> profile; BTreeMap keeps listing order stable
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceProfile>,
}

/// Device registry backed by devices.json
pub struct Registry {
    layout: StorageLayout,
}

impl Registry {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Load the registry, returning defaults when no file exists yet
    pub async fn load(&self) -> Result<RegistryData, FlashError> {
        let file = self.layout.registry_file();
        if !file.exists().await {
            return Ok(RegistryData::default());
        }
        file.read_json().await
    }

    /// Persist the registry atomically
    pub async fn save(&self, data: &RegistryData) -> Result<(), FlashError> {
        self.layout.registry_file().write_json(data).await
    }

    /// Look up one device profile
    pub async fn get(&self, key: &str) -> Result<Option<DeviceProfile>, FlashError> {
        Ok(self.load().await?.devices.get(key).cloned())
    }

    /// All registered device profiles in key order
    pub async fn list_all(&self) -> Result<Vec<DeviceProfile>, FlashError> {
        Ok(self.load().await?.devices.into_values().collect())
    }

    /// Insert or replace a profile under its key
    pub async fn upsert(&self, profile: DeviceProfile) -> Result<(), FlashError> {
        let mut data = self.load().await?;
        data.devices.insert(profile.key.clone(), profile);
        self.save(&data).await
    }

    /// Remove a profile; true when it existed
    pub async fn remove(&self, key: &str) -> Result<bool, FlashError> {
        let mut data = self.load().await?;
        let existed = data.devices.remove(key).is_some();
        if existed {
            self.save(&data).await?;
        }
        Ok(existed)
    }

    /// Mark a device flashable or not
    pub async fn set_flashable(&self, key: &str, flashable: bool) -> Result<(), FlashError> {
        let mut data = self.load().await?;
        let profile = data
            .devices
            .get_mut(key)
            .ok_or_else(|| FlashError::DeviceNotRegistered(key.to_string()))?;
        profile.flashable = flashable;
        self.save(&data).await
    }
}
