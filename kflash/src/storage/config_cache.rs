//! Per-device build configuration cache
//!
//! One cache entry per device key: the Kconfig `.config` produced by the
//! last successful configuration, from which the recorded MCU identifier
//! is parsed (`CONFIG_MCU="stm32h723xx"`).

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::FlashError;
use crate::storage::file::File;
use crate::storage::layout::StorageLayout;

/// A cached build configuration bound to a device key
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigArtifact {
    /// Cached .config location
    pub path: PathBuf,

    /// MCU identifier recorded in the cached config, when present
    pub mcu: Option<String>,
}

/// Extract the MCU type from Kconfig contents.
///
/// Matches lines of the form `CONFIG_MCU="stm32h723xx"`.
pub fn parse_mcu_from_config(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        line.strip_prefix("CONFIG_MCU=\"")
            .and_then(|rest| rest.strip_suffix('"'))
            .filter(|mcu| !mcu.is_empty())
            .map(String::from)
    })
}

/// Config cache backed by one directory per device key
pub struct ConfigCache {
    layout: StorageLayout,
}

impl ConfigCache {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Load the cached artifact for a device key, if one exists
    pub async fn load(&self, key: &str) -> Result<Option<ConfigArtifact>, FlashError> {
        let path = self.layout.cached_config_file(key);
        let file = File::new(&path);
        if !file.exists().await {
            return Ok(None);
        }
        let contents = file.read_string().await?;
        Ok(Some(ConfigArtifact {
            path,
            mcu: parse_mcu_from_config(&contents),
        }))
    }

    /// Save new config contents as the cache entry for a device key
    pub async fn save(&self, key: &str, contents: &str) -> Result<ConfigArtifact, FlashError> {
        let path = self.layout.cached_config_file(key);
        File::new(&path).write_atomic(contents.as_bytes()).await?;
        Ok(ConfigArtifact {
            path,
            mcu: parse_mcu_from_config(contents),
        })
    }

    /// Copy the cached config into the firmware source tree as `.config`
    /// so the build picks it up
    pub async fn stage(&self, key: &str, firmware_dir: &Path) -> Result<(), FlashError> {
        let cached = self.layout.cached_config_file(key);
        let contents = File::new(&cached).read_string().await?;
        File::new(firmware_dir.join(".config"))
            .write_atomic(contents.as_bytes())
            .await
    }

    /// Remove the cache entry for a device key
    pub async fn remove(&self, key: &str) -> Result<(), FlashError> {
        let dir = self.layout.config_cache_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Klipper firmware config\nCONFIG_MCU=\"stm32h723xx\"\nCONFIG_CLOCK_FREQ=550000000\n";

    #[test]
    fn test_parse_mcu() {
        assert_eq!(
            parse_mcu_from_config(SAMPLE),
            Some("stm32h723xx".to_string())
        );
        assert_eq!(parse_mcu_from_config("CONFIG_CLOCK_FREQ=12000000\n"), None);
        assert_eq!(parse_mcu_from_config("CONFIG_MCU=\"\"\n"), None);
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConfigCache::new(StorageLayout::new(dir.path()));

        assert!(cache.load("octo").await.unwrap().is_none());

        let saved = cache.save("octo", SAMPLE).await.unwrap();
        assert_eq!(saved.mcu.as_deref(), Some("stm32h723xx"));

        let loaded = cache.load("octo").await.unwrap().unwrap();
        assert_eq!(loaded, saved);

        cache.remove("octo").await.unwrap();
        assert!(cache.load("octo").await.unwrap().is_none());
        // Idempotent
        cache.remove("octo").await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_copies_into_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConfigCache::new(StorageLayout::new(dir.path().join("store")));
        cache.save("octo", SAMPLE).await.unwrap();

        let tree = dir.path().join("klipper");
        tokio::fs::create_dir_all(&tree).await.unwrap();
        cache.stage("octo", &tree).await.unwrap();

        let staged = tokio::fs::read_to_string(tree.join(".config")).await.unwrap();
        assert_eq!(staged, SAMPLE);
    }
}
