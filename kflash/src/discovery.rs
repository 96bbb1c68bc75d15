//! USB serial scanning and pattern matching

use std::path::PathBuf;

use glob::Pattern;
use tracing::debug;

use crate::models::DiscoveredDevice;

/// Default scan directory for USB serial devices
pub const SERIAL_BY_ID: &str = "/dev/serial/by-id";

/// Supported filename prefixes for Klipper/Katapult USB IDs
/// (case-insensitive)
pub const SUPPORTED_PREFIXES: [&str; 2] = ["usb-klipper_", "usb-katapult_"];

/// Abstraction over serial device discovery, injectable for tests
pub trait SerialScanner: Send + Sync {
    /// All USB serial devices currently enumerated
    fn scan(&self) -> Vec<DiscoveredDevice>;

    /// First device matching a glob pattern, prefix-agnostic
    fn find_path(&self, pattern: &str) -> Option<DiscoveredDevice> {
        let devices = self.scan();
        match_device(pattern, &devices).cloned()
    }
}

/// Scans /dev/serial/by-id on the host
pub struct ByIdScanner {
    dir: PathBuf,
}

impl ByIdScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for ByIdScanner {
    fn default() -> Self {
        Self::new(SERIAL_BY_ID)
    }
}

impl SerialScanner for ByIdScanner {
    fn scan(&self) -> Vec<DiscoveredDevice> {
        // The directory can vanish briefly during USB re-enumeration
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut devices: Vec<DiscoveredDevice> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| DiscoveredDevice {
                path: entry.path().to_string_lossy().into_owned(),
                filename: entry.file_name().to_string_lossy().into_owned(),
            })
            .collect();
        devices.sort_by(|a, b| a.filename.cmp(&b.filename));
        debug!("scanned {}: {} device(s)", self.dir.display(), devices.len());
        devices
    }
}

/// Return True if filename looks like a Klipper/Katapult USB device
pub fn is_supported_device(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    SUPPORTED_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Pattern variants with both Klipper_ and katapult_ prefixes.
///
/// A pattern like `usb-katapult_rp2040_30*` also yields
/// `usb-Klipper_rp2040_30*` so matching works regardless of which
/// bootloader mode the device booted into.
fn prefix_variants(pattern: &str) -> Vec<String> {
    let lower = pattern.to_lowercase();
    if let Some(rest) = lower
        .starts_with("usb-klipper_")
        .then(|| &pattern["usb-Klipper_".len()..])
    {
        return vec![pattern.to_string(), format!("usb-katapult_{rest}")];
    }
    if let Some(rest) = lower
        .starts_with("usb-katapult_")
        .then(|| &pattern["usb-katapult_".len()..])
    {
        return vec![pattern.to_string(), format!("usb-Klipper_{rest}")];
    }
    vec![pattern.to_string()]
}

fn matches_any_variant(filename: &str, variants: &[String]) -> bool {
    variants.iter().any(|variant| {
        Pattern::new(variant)
            .map(|p| p.matches(filename))
            .unwrap_or(false)
    })
}

/// Find all devices whose filename matches a glob pattern, prefix-agnostic
pub fn match_devices<'a>(
    pattern: &str,
    devices: &'a [DiscoveredDevice],
) -> Vec<&'a DiscoveredDevice> {
    let variants = prefix_variants(pattern);
    devices
        .iter()
        .filter(|device| matches_any_variant(&device.filename, &variants))
        .collect()
}

/// Find the first device whose filename matches a glob pattern
pub fn match_device<'a>(
    pattern: &str,
    devices: &'a [DiscoveredDevice],
) -> Option<&'a DiscoveredDevice> {
    match_devices(pattern, devices).into_iter().next()
}

/// Extract the MCU type from a /dev/serial/by-id filename.
///
/// `usb-Klipper_stm32h723xx_290...` -> `stm32h723`,
/// `usb-katapult_rp2040_303...` -> `rp2040`. Returns None for devices
/// that are not Klipper/Katapult.
pub fn extract_mcu_from_serial(filename: &str) -> Option<String> {
    let lower = filename.to_lowercase();
    let rest = SUPPORTED_PREFIXES
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))?;
    let mcu_part = rest.split('_').next()?;
    if mcu_part.is_empty() {
        return None;
    }
    // Strip variant suffix: stm32h723xx -> stm32h723, stm32f411xe -> stm32f411
    let trimmed = match mcu_part.find('x') {
        Some(idx) if idx >= 4 => &mcu_part[..idx],
        _ => mcu_part,
    };
    Some(trimmed.to_string())
}

/// Generate a serial glob pattern from a full device filename.
///
/// Strips the `-ifNN` interface suffix and appends a wildcard:
/// `usb-Klipper_stm32h723xx_29001A...-if00` ->
/// `usb-Klipper_stm32h723xx_29001A...*`
pub fn generate_serial_pattern(filename: &str) -> String {
    let base = match filename.rfind("-if") {
        Some(idx) if filename[idx + 3..].chars().all(|c| c.is_ascii_digit()) => &filename[..idx],
        _ => filename,
    };
    format!("{base}*")
}
