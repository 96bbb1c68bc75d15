//! Pre-flash safety gates
//!
//! Two sequential gates run before any destructive step. The print-status
//! gate is the only one that can block; the version gate only informs. An
//! unreachable Moonraker never blocks: the user may be flashing precisely
//! to recover a broken host.

use tracing::{debug, warn};

use crate::http::moonraker::StatusClient;
use crate::models::DeviceProfile;
use crate::version;

/// Decision produced by one safety gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed,
    /// Proceed after surfacing a warning. `confirm_default` is the
    /// suggested answer for an interactive "continue?" prompt.
    ProceedWithWarning {
        reason: String,
        confirm_default: bool,
    },
    /// Refuse to continue. No override exists.
    Block {
        reason: String,
        recovery: Vec<String>,
    },
}

impl GateDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GateDecision::Block { .. })
    }
}

/// Evaluates pre-flash safety conditions against the host status client
pub struct SafetyGates<'a> {
    status: &'a dyn StatusClient,
}

impl<'a> SafetyGates<'a> {
    pub fn new(status: &'a dyn StatusClient) -> Self {
        Self { status }
    }

    /// Block when a print job is active. standby/complete/cancelled/error
    /// all proceed; an unreachable host degrades to a warning.
    pub async fn print_status_gate(&self) -> GateDecision {
        let status = match self.status.query_print_state().await {
            Ok(status) => status,
            Err(e) => {
                warn!("print status unavailable: {e}");
                return GateDecision::ProceedWithWarning {
                    reason: format!("Could not query print status ({e}); verify the printer is idle"),
                    confirm_default: false,
                };
            }
        };

        if status.is_active() {
            let filename = status.filename.as_deref().unwrap_or("unknown file");
            let percent = (status.progress * 100.0).round() as u32;
            return GateDecision::Block {
                reason: format!(
                    "A print is {} ({filename}, {percent}%)",
                    status.state
                ),
                recovery: vec![
                    "1. Wait for the print to finish, or cancel it".to_string(),
                    "2. Re-run the flash once the printer is idle".to_string(),
                ],
            };
        }

        debug!("print status gate: state={} -> proceed", status.state);
        GateDecision::Proceed
    }

    /// Compare host and MCU firmware versions. Informational only: outdated
    /// firmware suggests a default-yes confirmation, current firmware a
    /// default-no one, and anything unqueryable degrades to a generic
    /// warning.
    pub async fn version_gate(&self, device: &DeviceProfile) -> GateDecision {
        let versions = async {
            let host = self.status.query_host_version().await?;
            let mcu = self.status.query_mcu_version(&device.mcu).await?;
            Ok::<_, crate::errors::FlashError>((host, mcu))
        }
        .await;

        let (host, mcu) = match versions {
            Ok((host, Some(mcu))) => (host, mcu),
            Ok((_, None)) => {
                return GateDecision::ProceedWithWarning {
                    reason: format!("No firmware version reported for MCU '{}'", device.mcu),
                    confirm_default: true,
                };
            }
            Err(e) => {
                warn!("version check unavailable: {e}");
                return GateDecision::ProceedWithWarning {
                    reason: "Version check skipped (host status unavailable)".to_string(),
                    confirm_default: true,
                };
            }
        };

        if version::is_mcu_outdated(&host, &mcu) {
            let delta = version::commit_delta(&host, &mcu)
                .map(|d| format!(" ({d} commits behind)"))
                .unwrap_or_default();
            GateDecision::ProceedWithWarning {
                reason: format!("MCU firmware {mcu} is behind host {host}{delta}"),
                confirm_default: true,
            }
        } else {
            GateDecision::ProceedWithWarning {
                reason: format!("MCU firmware {mcu} already matches host {host}"),
                confirm_default: false,
            }
        }
    }
}
