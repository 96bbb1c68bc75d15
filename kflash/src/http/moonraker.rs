//! Moonraker API client for print status and version detection
//!
//! Every query is bounded by a 5-second timeout and maps transport or
//! decode failures to `FlashError::MoonrakerUnreachable`. Callers treat
//! that error as non-fatal: the user may be flashing precisely to fix a
//! broken Klipper, so an unreachable host degrades to a warning.
//!
//! Endpoints used:
//! - `/printer/objects/query?print_stats&virtual_sdcard` - print status
//! - `/printer/info` - host software version
//! - `/printer/objects/list` - discover MCU objects
//! - `/printer/objects/query?mcu&mcu%20nhk` - MCU firmware versions

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::errors::FlashError;
use crate::models::PrintStatus;

/// Query timeout for all Moonraker calls
pub const TIMEOUT_QUERY: Duration = Duration::from_secs(5);

/// Host status collaborator consumed by the safety gates and verifier
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Current print job state
    async fn query_print_state(&self) -> Result<PrintStatus, FlashError>;

    /// Host Klipper software version descriptor
    async fn query_host_version(&self) -> Result<String, FlashError>;

    /// Firmware version of the MCU matching the given type, if any
    async fn query_mcu_version(&self, mcu: &str) -> Result<Option<String>, FlashError>;

    /// Whether the MCU matching the given type responds without protocol
    /// errors
    async fn query_mcu_health(&self, mcu: &str) -> Result<bool, FlashError>;
}

/// HTTP client for the Moonraker REST API
pub struct MoonrakerClient {
    client: Client,
    base_url: String,
}

impl MoonrakerClient {
    pub fn new(base_url: &str) -> Result<Self, FlashError> {
        let client = Client::builder().timeout(TIMEOUT_QUERY).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, FlashError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FlashError::MoonrakerUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FlashError::MoonrakerUnreachable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| FlashError::MoonrakerUnreachable(e.to_string()))
    }

    /// All MCU firmware versions, normalized: "mcu" -> "main",
    /// "mcu nhk" -> "nhk"
    async fn mcu_versions(&self) -> Result<HashMap<String, String>, FlashError> {
        let list = self.get_json("/printer/objects/list").await?;
        let objects = list["result"]["objects"]
            .as_array()
            .ok_or_else(|| FlashError::MoonrakerUnreachable("malformed objects list".into()))?;

        let mcu_objects: Vec<String> = objects
            .iter()
            .filter_map(|obj| obj.as_str())
            .filter(|name| *name == "mcu" || name.starts_with("mcu "))
            .map(|name| name.to_string())
            .collect();

        if mcu_objects.is_empty() {
            return Ok(HashMap::new());
        }

        let query: String = mcu_objects
            .iter()
            .map(|name| name.replace(' ', "%20"))
            .collect::<Vec<_>>()
            .join("&");
        let data = self
            .get_json(&format!("/printer/objects/query?{query}"))
            .await?;

        let mut versions = HashMap::new();
        if let Some(status) = data["result"]["status"].as_object() {
            for (mcu_name, mcu_data) in status {
                if let Some(version) = mcu_data["mcu_version"].as_str() {
                    let name = if mcu_name == "mcu" {
                        "main".to_string()
                    } else {
                        mcu_name.trim_start_matches("mcu ").to_string()
                    };
                    versions.insert(name, version.to_string());
                }
            }
        }
        Ok(versions)
    }
}

/// Match a device MCU type against Moonraker MCU names.
///
/// Order: exact match, substring match either way, then "main" as the
/// primary-MCU fallback.
pub fn version_for_mcu<'a>(
    versions: &'a HashMap<String, String>,
    mcu_type: &str,
) -> Option<&'a str> {
    let wanted = mcu_type.to_lowercase();

    if let Some((_, version)) = versions
        .iter()
        .find(|(name, _)| name.to_lowercase() == wanted)
    {
        return Some(version);
    }

    if let Some((_, version)) = versions.iter().find(|(name, _)| {
        let name = name.to_lowercase();
        wanted.contains(&name) || name.contains(&wanted)
    }) {
        return Some(version);
    }

    versions.get("main").map(String::as_str)
}

#[async_trait]
impl StatusClient for MoonrakerClient {
    async fn query_print_state(&self) -> Result<PrintStatus, FlashError> {
        let data = self
            .get_json("/printer/objects/query?print_stats&virtual_sdcard")
            .await?;
        let status = &data["result"]["status"];

        Ok(PrintStatus {
            state: status["print_stats"]["state"]
                .as_str()
                .unwrap_or("standby")
                .to_string(),
            filename: status["print_stats"]["filename"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(String::from),
            progress: status["virtual_sdcard"]["progress"].as_f64().unwrap_or(0.0),
        })
    }

    async fn query_host_version(&self) -> Result<String, FlashError> {
        let data = self.get_json("/printer/info").await?;
        data["result"]["software_version"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| FlashError::MoonrakerUnreachable("no software_version".into()))
    }

    async fn query_mcu_version(&self, mcu: &str) -> Result<Option<String>, FlashError> {
        let versions = self.mcu_versions().await?;
        Ok(version_for_mcu(&versions, mcu).map(String::from))
    }

    async fn query_mcu_health(&self, mcu: &str) -> Result<bool, FlashError> {
        // An MCU that reports a firmware version is communicating without
        // protocol errors
        let versions = self.mcu_versions().await?;
        Ok(version_for_mcu(&versions, mcu).is_some())
    }
}
