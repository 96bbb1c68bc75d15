//! Storage layout configuration

use std::path::PathBuf;

use crate::storage::file::File;

/// On-disk layout: one registry file plus one config-cache entry per
/// device key
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the device registry file path
    pub fn registry_file(&self) -> File {
        File::new(self.base_dir.join("devices.json"))
    }

    /// Get the config cache directory for a device key
    pub fn config_cache_dir(&self, device_key: &str) -> PathBuf {
        self.base_dir.join("configs").join(device_key)
    }

    /// Get the cached .config path for a device key
    pub fn cached_config_file(&self, device_key: &str) -> PathBuf {
        self.config_cache_dir(device_key).join(".config")
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // XDG config dir, falling back to ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config")
            });
        Self::new(base.join("kalico-flash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/tmp/kf");
        assert_eq!(
            layout.registry_file().path(),
            PathBuf::from("/tmp/kf/devices.json")
        );
        assert_eq!(
            layout.cached_config_file("octopus-pro"),
            PathBuf::from("/tmp/kf/configs/octopus-pro/.config")
        );
    }
}
