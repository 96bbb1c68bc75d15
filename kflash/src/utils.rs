//! Utility functions

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub git_describe: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        git_describe: option_env!("GIT_DESCRIBE").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Expand a leading `~` to the user's home directory.
///
/// Registry paths like `~/klipper` are stored unexpanded so the registry
/// stays portable between hosts.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info_present() {
        let info = version_info();
        assert!(!info.version.is_empty());
        // Build metadata falls back to "unknown" outside a git checkout,
        // but is never empty.
        assert!(!info.git_hash.is_empty());
        assert!(!info.git_describe.is_empty());
        assert!(!info.build_time.is_empty());
    }

    #[test]
    fn test_expand_home() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(
            expand_home("~/klipper"),
            PathBuf::from(&home).join("klipper")
        );
        assert_eq!(expand_home("/opt/klipper"), PathBuf::from("/opt/klipper"));
    }
}
