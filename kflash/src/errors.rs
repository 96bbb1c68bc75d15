//! Error types for kflash

use thiserror::Error;

/// Main error type for flash orchestration
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("No cached config for '{device}'")]
    ConfigCacheMissing { device: String },

    #[error("MCU mismatch: config has '{found}', device expects '{expected}'")]
    McuMismatch { expected: String, found: String },

    #[error("Build failed (exit code {exit_code:?}): {detail}")]
    BuildFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Flash tool error ({method}): {detail}")]
    FlashToolError { method: String, detail: String },

    #[error("No bootloader response from '{device}': {detail}")]
    NoBootloaderResponse { device: String, detail: String },

    #[error("Service control failed ({action}): {detail}")]
    ServiceControlError { action: String, detail: String },

    #[error("Device did not reappear matching '{pattern}' within {timeout_secs}s")]
    VerificationTimeout { pattern: String, timeout_secs: u64 },

    #[error("Moonraker unreachable: {0}")]
    MoonrakerUnreachable(String),

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Device not registered: {0}")]
    DeviceNotRegistered(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FlashError {
    fn from(err: anyhow::Error) -> Self {
        FlashError::Internal(err.to_string())
    }
}
