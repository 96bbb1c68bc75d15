//! Build configuration resolution
//!
//! Resolves the `.config` used for a device's build: a cached artifact when
//! one exists and its recorded MCU agrees with the profile, otherwise an
//! interactive configuration session through the `Configurator` trait. In
//! non-interactive runs a missing cache is an error, never a silent prompt.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::FlashError;
use crate::models::DeviceProfile;
use crate::storage::config_cache::{ConfigArtifact, ConfigCache};

/// External configuration session (menuconfig lives outside this crate)
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Produce fresh config contents for a device, e.g. by launching an
    /// interactive menuconfig session in the firmware tree
    async fn configure(&self, device: &DeviceProfile) -> Result<String, FlashError>;
}

/// Whether a config-recorded MCU agrees with the profile's expected one.
///
/// Kconfig records the full variant (`stm32h723xx`) while serial filenames
/// yield the base type (`stm32h723`), so comparison is prefix-based in
/// either direction.
pub fn mcu_matches(expected: &str, found: &str) -> bool {
    let expected = expected.to_lowercase();
    let found = found.to_lowercase();
    found.starts_with(&expected) || expected.starts_with(&found)
}

/// Resolves and validates the per-device build configuration
pub struct ConfigResolver<'a> {
    cache: &'a ConfigCache,
    configurator: Option<&'a dyn Configurator>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(cache: &'a ConfigCache, configurator: Option<&'a dyn Configurator>) -> Self {
        Self {
            cache,
            configurator,
        }
    }

    /// Resolve the config artifact for a device.
    ///
    /// A cache hit with a mismatched MCU fails with `McuMismatch`; a miss
    /// with `skip_interactive` set fails with `ConfigCacheMissing`. On
    /// success the artifact's MCU always agrees with the profile.
    pub async fn resolve(
        &self,
        device: &DeviceProfile,
        skip_interactive: bool,
    ) -> Result<ConfigArtifact, FlashError> {
        if let Some(artifact) = self.cache.load(&device.key).await? {
            if let Some(found) = &artifact.mcu {
                if !mcu_matches(&device.mcu, found) {
                    return Err(FlashError::McuMismatch {
                        expected: device.mcu.clone(),
                        found: found.clone(),
                    });
                }
            }
            debug!("config cache hit for '{}'", device.key);
            return Ok(artifact);
        }

        if skip_interactive {
            return Err(FlashError::ConfigCacheMissing {
                device: device.key.clone(),
            });
        }

        let configurator = self
            .configurator
            .ok_or_else(|| FlashError::ConfigCacheMissing {
                device: device.key.clone(),
            })?;

        info!("no cached config for '{}', configuring", device.key);
        let contents = configurator.configure(device).await?;
        let artifact = self.cache.save(&device.key, &contents).await?;

        if let Some(found) = &artifact.mcu {
            if !mcu_matches(&device.mcu, found) {
                return Err(FlashError::McuMismatch {
                    expected: device.mcu.clone(),
                    found: found.clone(),
                });
            }
        }
        Ok(artifact)
    }
}
