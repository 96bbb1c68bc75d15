//! Device profile and global configuration models

use serde::{Deserialize, Serialize};

/// A registered device in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Unique key, user-chosen (used as the --device flag)
    pub key: String,

    /// Display name, e.g. "Octopus Pro v1.1"
    pub name: String,

    /// Expected MCU identifier, e.g. "stm32h723"
    pub mcu: String,

    /// Serial glob pattern for bootloader mode,
    /// e.g. "usb-katapult_stm32h723xx_29001A*"
    pub bootloader_pattern: String,

    /// Serial glob pattern for run mode. Devices flashable only via the
    /// bootloader method have none.
    #[serde(default)]
    pub run_pattern: Option<String>,

    /// Non-flashable devices are excluded from flash selection
    #[serde(default = "default_true")]
    pub flashable: bool,
}

fn default_true() -> bool {
    true
}

/// Global settings shared across all devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Klipper source directory
    #[serde(default = "default_klipper_dir")]
    pub klipper_dir: String,

    /// Katapult source directory (for flashtool.py)
    #[serde(default = "default_katapult_dir")]
    pub katapult_dir: String,

    /// Name of the systemd service controlling the printer
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Fall back to make flash when the bootloader method fails
    #[serde(default = "default_true")]
    pub allow_flash_fallback: bool,

    /// Seconds between devices in a batch run (0-60)
    #[serde(default = "default_stagger_delay")]
    pub stagger_delay_secs: f64,

    /// Pre-batch countdown in seconds (0-30)
    #[serde(default = "default_countdown")]
    pub countdown_secs: f64,

    /// Post-flash verification ceiling in seconds (15-30).
    /// RP2040-class MCUs need the longer end.
    #[serde(default = "default_verify_ceiling")]
    pub verify_ceiling_secs: u64,

    /// Moonraker base URL
    #[serde(default = "default_moonraker_url")]
    pub moonraker_url: String,
}

fn default_klipper_dir() -> String {
    "~/klipper".to_string()
}

fn default_katapult_dir() -> String {
    "~/katapult".to_string()
}

fn default_service_name() -> String {
    "klipper".to_string()
}

fn default_stagger_delay() -> f64 {
    2.0
}

fn default_countdown() -> f64 {
    5.0
}

fn default_verify_ceiling() -> u64 {
    30
}

fn default_moonraker_url() -> String {
    "http://localhost:7125".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            klipper_dir: default_klipper_dir(),
            katapult_dir: default_katapult_dir(),
            service_name: default_service_name(),
            allow_flash_fallback: true,
            stagger_delay_secs: default_stagger_delay(),
            countdown_secs: default_countdown(),
            verify_ceiling_secs: default_verify_ceiling(),
            moonraker_url: default_moonraker_url(),
        }
    }
}

impl GlobalConfig {
    /// Clamp user-configurable delays into their allowed ranges
    pub fn clamped(mut self) -> Self {
        self.stagger_delay_secs = self.stagger_delay_secs.clamp(0.0, 60.0);
        self.countdown_secs = self.countdown_secs.clamp(0.0, 30.0);
        self.verify_ceiling_secs = self.verify_ceiling_secs.clamp(15, 30);
        self
    }
}

/// A USB serial device found during scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Full path, e.g. "/dev/serial/by-id/usb-Klipper_stm32h723xx_..."
    pub path: String,

    /// Filename component only
    pub filename: String,
}

/// Current print job status from Moonraker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintStatus {
    /// standby, printing, paused, complete, error, cancelled
    pub state: String,

    /// None if no file loaded
    pub filename: Option<String>,

    /// 0.0 to 1.0
    pub progress: f64,
}

impl PrintStatus {
    /// Active prints block flashing
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "printing" | "paused")
    }
}
