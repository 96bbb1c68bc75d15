//! Post-flash verification
//!
//! After an upload the device should re-enumerate under its run-mode
//! serial pattern. The verifier polls for it at 500 ms up to a
//! configurable ceiling, then optionally confirms over the host status
//! client that the MCU is actually communicating. Verification never
//! fails a run: the worst it produces is a warning with recovery steps.

use std::time::Duration;

use tracing::{info, warn};

use crate::discovery::{is_supported_device, match_device, SerialScanner};
use crate::flash::poll::{poll_until, PollConfig, PollOutcome};
use crate::http::moonraker::StatusClient;
use crate::models::{DeviceProfile, Phase, PhaseOutcome, Verification};

/// Spacing between reappearance checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Watches for a flashed device to come back in run mode
pub struct Verifier<'a> {
    scanner: &'a dyn SerialScanner,
    status: Option<&'a dyn StatusClient>,
    ceiling: Duration,
}

impl<'a> Verifier<'a> {
    pub fn new(
        scanner: &'a dyn SerialScanner,
        status: Option<&'a dyn StatusClient>,
        ceiling_secs: u64,
    ) -> Self {
        Self {
            scanner,
            status,
            ceiling: Duration::from_secs(ceiling_secs),
        }
    }

    /// Wait for the device to reappear and judge the result
    pub async fn verify(&self, device: &DeviceProfile) -> Verification {
        // Bootloader-only devices have no run-mode identity to wait for
        let pattern = device
            .run_pattern
            .as_deref()
            .unwrap_or(&device.bootloader_pattern);
        let bootloader_expected = device.run_pattern.is_none();

        let config = PollConfig::new(POLL_INTERVAL, self.ceiling);
        let found = poll_until(config, || {
            let devices = self.scanner.scan();
            match_device(pattern, &devices).cloned()
        })
        .await;

        let (target, elapsed) = match found {
            PollOutcome::Found { value, elapsed } => (value, elapsed),
            PollOutcome::TimedOut { elapsed } => {
                warn!(
                    "'{}' did not reappear within {:?}",
                    device.key, elapsed
                );
                return Verification::Unverified {
                    reason: format!(
                        "Device did not reappear matching '{pattern}' within {}s",
                        self.ceiling.as_secs()
                    ),
                };
            }
        };

        // Reappearing in bootloader mode means the upload never took
        let in_bootloader = target
            .filename
            .to_lowercase()
            .starts_with("usb-katapult_");
        if in_bootloader && !bootloader_expected {
            return Verification::Unverified {
                reason: format!(
                    "Device reappeared in bootloader mode ({}); the flash likely did not take",
                    target.filename
                ),
            };
        }

        if is_supported_device(&target.filename) {
            info!("'{}' reappeared at {} after {:?}", device.key, target.path, elapsed);
        }

        match self.mcu_healthy(&device.mcu).await {
            Some(true) => Verification::Confirmed {
                path: target.path,
                elapsed,
            },
            _ => Verification::PathOnly {
                path: target.path,
                elapsed,
            },
        }
    }

    async fn mcu_healthy(&self, mcu: &str) -> Option<bool> {
        let status = self.status?;
        status.query_mcu_health(mcu).await.ok()
    }
}

/// Render a verification as the run's Verify phase outcome
pub fn verification_outcome(verification: &Verification, service_name: &str) -> PhaseOutcome {
    match verification {
        Verification::Confirmed { path, elapsed } => {
            PhaseOutcome::ok(Phase::Verify, format!("Device confirmed at {path}"))
                .with_elapsed(*elapsed)
        }
        Verification::PathOnly { path, elapsed } => PhaseOutcome::warned(
            Phase::Verify,
            format!("Device present at {path}; MCU health not confirmed"),
        )
        .with_elapsed(*elapsed),
        Verification::Unverified { reason } => PhaseOutcome::warned(Phase::Verify, reason.clone())
            .with_recovery([
                "1. Check the USB cable and connector".to_string(),
                "2. Verify the device with: ls /dev/serial/by-id".to_string(),
                format!("3. Restart the host service: sudo systemctl restart {service_name}"),
                "4. Re-run the flash if the device stays in bootloader mode".to_string(),
            ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FlashError;
    use crate::models::{DiscoveredDevice, PrintStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Appears after a configurable number of scans
    struct LateScanner {
        appears_after: u32,
        filename: String,
        scans: AtomicU32,
    }

    impl SerialScanner for LateScanner {
        fn scan(&self) -> Vec<DiscoveredDevice> {
            let n = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.appears_after {
                vec![DiscoveredDevice {
                    path: format!("/dev/serial/by-id/{}", self.filename),
                    filename: self.filename.clone(),
                }]
            } else {
                Vec::new()
            }
        }
    }

    struct HealthyStatus;

    #[async_trait]
    impl StatusClient for HealthyStatus {
        async fn query_print_state(&self) -> Result<PrintStatus, FlashError> {
            Err(FlashError::MoonrakerUnreachable("unused".into()))
        }
        async fn query_host_version(&self) -> Result<String, FlashError> {
            Err(FlashError::MoonrakerUnreachable("unused".into()))
        }
        async fn query_mcu_version(&self, _mcu: &str) -> Result<Option<String>, FlashError> {
            Ok(None)
        }
        async fn query_mcu_health(&self, _mcu: &str) -> Result<bool, FlashError> {
            Ok(true)
        }
    }

    fn device() -> DeviceProfile {
        DeviceProfile {
            key: "nitehawk".to_string(),
            name: "Nitehawk SB".to_string(),
            mcu: "rp2040".to_string(),
            bootloader_pattern: "usb-katapult_rp2040_30*".to_string(),
            run_pattern: Some("usb-Klipper_rp2040_30*".to_string()),
            flashable: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reappearance_at_2500ms_confirmed() {
        // Device appears between the 5th and 6th scan, i.e. found at 2.5s
        let scanner = LateScanner {
            appears_after: 5,
            filename: "usb-Klipper_rp2040_3039343B-if00".to_string(),
            scans: AtomicU32::new(0),
        };
        let status = HealthyStatus;
        let verifier = Verifier::new(&scanner, Some(&status), 30);

        let verification = verifier.verify(&device()).await;
        let Verification::Confirmed { elapsed, .. } = verification else {
            panic!("expected Confirmed, got {verification:?}");
        };
        assert_eq!(elapsed, Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_health_client_degrades_to_path_only() {
        let scanner = LateScanner {
            appears_after: 0,
            filename: "usb-Klipper_rp2040_3039343B-if00".to_string(),
            scans: AtomicU32::new(0),
        };
        let verifier = Verifier::new(&scanner, None, 30);

        let verification = verifier.verify(&device()).await;
        assert!(matches!(verification, Verification::PathOnly { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader_reappearance_is_unverified() {
        let scanner = LateScanner {
            appears_after: 0,
            filename: "usb-katapult_rp2040_3039343B-if00".to_string(),
            scans: AtomicU32::new(0),
        };
        let status = HealthyStatus;
        let verifier = Verifier::new(&scanner, Some(&status), 30);

        let verification = verifier.verify(&device()).await;
        let Verification::Unverified { reason } = verification else {
            panic!("expected Unverified");
        };
        assert!(reason.contains("bootloader mode"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_recovery_steps() {
        let scanner = LateScanner {
            appears_after: u32::MAX,
            filename: String::new(),
            scans: AtomicU32::new(0),
        };
        let verifier = Verifier::new(&scanner, None, 15);

        let verification = verifier.verify(&device()).await;
        assert!(matches!(verification, Verification::Unverified { .. }));

        let outcome = verification_outcome(&verification, "klipper");
        assert!(outcome.is_ok()); // warned, never fatal
        let recovery = outcome.context.unwrap().recovery;
        assert!(recovery.iter().any(|s| s.contains("systemctl restart")));
    }
}
