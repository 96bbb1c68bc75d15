//! Firmware version descriptor parsing
//!
//! Klipper reports versions in git-describe form: `v0.12.0-45-g7ce409d`
//! (tag, commits ahead of tag, short hash), optionally with a `-dirty`
//! suffix. Parsing is best-effort; malformed strings yield None and the
//! caller degrades to a warning, never an error.

/// Parsed git-describe style version descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDescriptor {
    /// Leading tag, e.g. "v0.12.0"
    pub tag: String,
    /// Commits ahead of the tag; None when the descriptor was tag-only
    pub commits: Option<u64>,
    /// Short hash without the leading 'g'; None when tag-only
    pub hash: Option<String>,
}

impl VersionDescriptor {
    /// Parse forms like `v0.12.0-45-g7ce409d`, `v0.12.0-0-g7ce409d-dirty`
    /// and bare tags like `v2026.01.00`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut v = raw.trim();
        if v.is_empty() || !v.starts_with('v') {
            return None;
        }
        if let Some(stripped) = v.strip_suffix("-dirty") {
            v = stripped;
        }

        // Work backwards: tag may itself contain dashes, so split off
        // `-<count>-g<hash>` from the right when present.
        let parts: Vec<&str> = v.rsplitn(3, '-').collect();
        if parts.len() == 3 {
            let hash_part = parts[0];
            let count_part = parts[1];
            let tag_part = parts[2];
            if let Some(hash) = hash_part.strip_prefix('g') {
                let is_hex = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
                if is_hex {
                    if let Ok(count) = count_part.parse::<u64>() {
                        return Some(Self {
                            tag: tag_part.to_string(),
                            commits: Some(count),
                            hash: Some(hash.to_string()),
                        });
                    }
                }
            }
        }

        // Tag-only descriptor
        Some(Self {
            tag: v.to_string(),
            commits: None,
            hash: None,
        })
    }
}

/// Commit-count delta between host and MCU under a matching tag.
///
/// Positive means the MCU is behind the host. None when either side is
/// unparseable, tags differ, or commit counts are missing.
pub fn commit_delta(host: &str, mcu: &str) -> Option<i64> {
    let host = VersionDescriptor::parse(host)?;
    let mcu = VersionDescriptor::parse(mcu)?;
    if host.tag != mcu.tag {
        return None;
    }
    Some(host.commits? as i64 - mcu.commits? as i64)
}

/// Whether MCU firmware appears behind the host. Informational only,
/// never used to block a flash.
pub fn is_mcu_outdated(host_version: &str, mcu_version: &str) -> bool {
    let host_raw = host_version.trim();
    let mcu_raw = mcu_version.trim();
    if host_raw.is_empty() || mcu_raw.is_empty() {
        return false;
    }

    match (
        VersionDescriptor::parse(host_raw),
        VersionDescriptor::parse(mcu_raw),
    ) {
        (Some(host), Some(mcu)) => {
            if host.tag != mcu.tag {
                return true;
            }
            match (host.commits, mcu.commits) {
                (Some(h), Some(m)) => h != m,
                // Equal tags with missing commit counts: don't warn
                _ => false,
            }
        }
        _ => host_raw != mcu_raw,
    }
}
