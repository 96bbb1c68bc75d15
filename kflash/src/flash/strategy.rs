//! Dual-method flash strategy
//!
//! Driven by an explicit state machine: Idle -> TryPreferred ->
//! {Success | TryFallback} -> {Success | Failed}. The preferred method is
//! the Katapult flashtool against the bootloader-mode serial path; the
//! fallback is the build system's flash target against the run-mode path.
//! At most one fallback attempt, and none at all when the device has no
//! run-mode pattern registered.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::discovery::{match_device, SerialScanner};
use crate::errors::FlashError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::models::{DeviceProfile, FlashMethod};

/// Per-attempt upload ceiling
pub const TIMEOUT_FLASH: Duration = Duration::from_secs(60);

const TAIL_LINES: usize = 10;

/// Flash attempt state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashState {
    /// Not started
    Idle,

    /// Preferred (Katapult) attempt in progress
    TryPreferred,

    /// Fallback (make flash) attempt in progress
    TryFallback,

    /// An upload completed
    Success(FlashMethod),

    /// Both avenues exhausted
    Failed,
}

/// Flash attempt event
#[derive(Debug, Clone)]
pub enum FlashEvent {
    Begin,
    PreferredSucceeded,
    /// Preferred failed; true when a fallback attempt is permitted
    PreferredFailed { fallback_available: bool },
    FallbackSucceeded,
    FallbackFailed,
}

/// Tagged state machine for one device's flash attempt
#[derive(Debug, Clone)]
pub struct FlashFsm {
    state: FlashState,
}

impl FlashFsm {
    pub fn new() -> Self {
        Self {
            state: FlashState::Idle,
        }
    }

    pub fn state(&self) -> &FlashState {
        &self.state
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: FlashEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (FlashState::Idle, FlashEvent::Begin) => FlashState::TryPreferred,

            (FlashState::TryPreferred, FlashEvent::PreferredSucceeded) => {
                FlashState::Success(FlashMethod::Katapult)
            }
            (
                FlashState::TryPreferred,
                FlashEvent::PreferredFailed {
                    fallback_available: true,
                },
            ) => FlashState::TryFallback,
            (
                FlashState::TryPreferred,
                FlashEvent::PreferredFailed {
                    fallback_available: false,
                },
            ) => FlashState::Failed,

            (FlashState::TryFallback, FlashEvent::FallbackSucceeded) => {
                FlashState::Success(FlashMethod::MakeFlash)
            }
            (FlashState::TryFallback, FlashEvent::FallbackFailed) => FlashState::Failed,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for FlashFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed upload
#[derive(Debug, Clone, PartialEq)]
pub struct FlashSuccess {
    pub method: FlashMethod,
    pub elapsed: Duration,
}

/// Executes the flash strategy against real serial paths and tools
pub struct FlashStrategy<'a> {
    runner: &'a dyn CommandRunner,
    scanner: &'a dyn SerialScanner,
    klipper_dir: PathBuf,
    katapult_dir: PathBuf,
    allow_fallback: bool,
}

impl<'a> FlashStrategy<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        scanner: &'a dyn SerialScanner,
        klipper_dir: impl Into<PathBuf>,
        katapult_dir: impl Into<PathBuf>,
        allow_fallback: bool,
    ) -> Self {
        Self {
            runner,
            scanner,
            klipper_dir: klipper_dir.into(),
            katapult_dir: katapult_dir.into(),
            allow_fallback,
        }
    }

    /// Upload firmware to a device, preferring the bootloader method
    pub async fn flash(
        &self,
        device: &DeviceProfile,
        firmware: &Path,
    ) -> Result<FlashSuccess, FlashError> {
        let mut fsm = FlashFsm::new();
        fsm.process(FlashEvent::Begin)
            .map_err(FlashError::Internal)?;

        let fallback_available = self.allow_fallback && device.run_pattern.is_some();
        let mut saw_path = false;
        let mut preferred_detail = String::new();
        let mut elapsed = Duration::ZERO;

        match self.try_katapult(device, firmware).await {
            Ok(took) => {
                fsm.process(FlashEvent::PreferredSucceeded)
                    .map_err(FlashError::Internal)?;
                return Ok(FlashSuccess {
                    method: FlashMethod::Katapult,
                    elapsed: took,
                });
            }
            Err(attempt) => {
                saw_path = attempt.saw_path;
                preferred_detail = attempt.detail;
                elapsed += attempt.elapsed;
                warn!("katapult flash failed: {}", preferred_detail);
                fsm.process(FlashEvent::PreferredFailed { fallback_available })
                    .map_err(FlashError::Internal)?;
            }
        }

        if fsm.state() == &FlashState::Failed {
            return Err(terminal_error(device, saw_path, preferred_detail));
        }

        match self.try_make_flash(device, firmware).await {
            Ok(took) => {
                fsm.process(FlashEvent::FallbackSucceeded)
                    .map_err(FlashError::Internal)?;
                Ok(FlashSuccess {
                    method: FlashMethod::MakeFlash,
                    elapsed: elapsed + took,
                })
            }
            Err(attempt) => {
                fsm.process(FlashEvent::FallbackFailed)
                    .map_err(FlashError::Internal)?;
                Err(terminal_error(
                    device,
                    saw_path || attempt.saw_path,
                    format!(
                        "katapult: {preferred_detail}; make flash: {}",
                        attempt.detail
                    ),
                ))
            }
        }
    }

    async fn try_katapult(
        &self,
        device: &DeviceProfile,
        firmware: &Path,
    ) -> Result<Duration, Attempt> {
        let devices = self.scanner.scan();
        let Some(target) = match_device(&device.bootloader_pattern, &devices) else {
            return Err(Attempt {
                saw_path: false,
                detail: format!("no device matching '{}'", device.bootloader_pattern),
                elapsed: Duration::ZERO,
            });
        };

        info!("flashing '{}' via katapult at {}", device.key, target.path);
        let flashtool = self.katapult_dir.join("scripts/flashtool.py");
        let output = self
            .runner
            .run(
                CommandSpec::new("python3", TIMEOUT_FLASH)
                    .arg(flashtool.to_string_lossy())
                    .arg("-d")
                    .arg(&target.path)
                    .arg("-f")
                    .arg(firmware.to_string_lossy()),
            )
            .await
            .map_err(|e| Attempt {
                saw_path: true,
                detail: e.to_string(),
                elapsed: Duration::ZERO,
            })?;

        if output.success() {
            Ok(output.elapsed)
        } else {
            Err(Attempt {
                saw_path: true,
                detail: attempt_detail(&output),
                elapsed: output.elapsed,
            })
        }
    }

    async fn try_make_flash(
        &self,
        device: &DeviceProfile,
        _firmware: &Path,
    ) -> Result<Duration, Attempt> {
        // Callers guarantee a run pattern exists before attempting fallback
        let pattern = device.run_pattern.as_deref().unwrap_or_default();
        let devices = self.scanner.scan();
        let Some(target) = match_device(pattern, &devices) else {
            return Err(Attempt {
                saw_path: false,
                detail: format!("no device matching '{pattern}'"),
                elapsed: Duration::ZERO,
            });
        };

        info!("flashing '{}' via make flash at {}", device.key, target.path);
        let output = self
            .runner
            .run(
                CommandSpec::new("make", TIMEOUT_FLASH)
                    .arg(format!("FLASH_DEVICE={}", target.path))
                    .arg("flash")
                    .cwd(&self.klipper_dir),
            )
            .await
            .map_err(|e| Attempt {
                saw_path: true,
                detail: e.to_string(),
                elapsed: Duration::ZERO,
            })?;

        if output.success() {
            Ok(output.elapsed)
        } else {
            Err(Attempt {
                saw_path: true,
                detail: attempt_detail(&output),
                elapsed: output.elapsed,
            })
        }
    }
}

/// One failed attempt, tracking whether a serial path was ever observed
struct Attempt {
    saw_path: bool,
    detail: String,
    elapsed: Duration,
}

fn attempt_detail(output: &crate::exec::CommandOutput) -> String {
    if output.timed_out {
        format!("timed out after {}s", TIMEOUT_FLASH.as_secs())
    } else {
        format!(
            "exit code {:?}: {}",
            output.exit_code,
            output.tail(TAIL_LINES)
        )
    }
}

fn terminal_error(device: &DeviceProfile, saw_path: bool, detail: String) -> FlashError {
    if saw_path {
        FlashError::FlashToolError {
            method: "flash".to_string(),
            detail,
        }
    } else {
        FlashError::NoBootloaderResponse {
            device: device.key.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::models::DiscoveredDevice;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeScanner {
        devices: Vec<DiscoveredDevice>,
    }

    impl SerialScanner for FakeScanner {
        fn scan(&self) -> Vec<DiscoveredDevice> {
            self.devices.clone()
        }
    }

    struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, FlashError> {
            self.calls.lock().unwrap().push(spec.display());
            Ok(self.outputs.lock().unwrap().remove(0))
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_secs(3),
            timed_out: false,
        }
    }

    fn failed_output(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_secs(3),
            timed_out: false,
        }
    }

    fn device(run_pattern: Option<&str>) -> DeviceProfile {
        DeviceProfile {
            key: "nitehawk".to_string(),
            name: "Nitehawk SB".to_string(),
            mcu: "rp2040".to_string(),
            bootloader_pattern: "usb-katapult_rp2040_30*".to_string(),
            run_pattern: run_pattern.map(String::from),
            flashable: true,
        }
    }

    fn discovered(filename: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            path: format!("/dev/serial/by-id/{filename}"),
            filename: filename.to_string(),
        }
    }

    #[test]
    fn test_fsm_transition_table() {
        let mut fsm = FlashFsm::new();
        assert_eq!(fsm.state(), &FlashState::Idle);

        fsm.process(FlashEvent::Begin).unwrap();
        assert_eq!(fsm.state(), &FlashState::TryPreferred);

        fsm.process(FlashEvent::PreferredFailed {
            fallback_available: true,
        })
        .unwrap();
        assert_eq!(fsm.state(), &FlashState::TryFallback);

        fsm.process(FlashEvent::FallbackSucceeded).unwrap();
        assert_eq!(fsm.state(), &FlashState::Success(FlashMethod::MakeFlash));

        // Terminal state rejects further events
        assert!(fsm.process(FlashEvent::Begin).is_err());
    }

    #[test]
    fn test_fsm_no_fallback_goes_terminal() {
        let mut fsm = FlashFsm::new();
        fsm.process(FlashEvent::Begin).unwrap();
        fsm.process(FlashEvent::PreferredFailed {
            fallback_available: false,
        })
        .unwrap();
        assert_eq!(fsm.state(), &FlashState::Failed);
    }

    #[tokio::test]
    async fn test_preferred_success_skips_fallback() {
        let scanner = FakeScanner {
            devices: vec![discovered("usb-katapult_rp2040_3039343B-if00")],
        };
        let runner = ScriptedRunner::new(vec![ok_output()]);
        let strategy = FlashStrategy::new(&runner, &scanner, "/k", "/kat", true);

        let success = strategy
            .flash(&device(Some("usb-Klipper_rp2040_30*")), Path::new("/fw.bin"))
            .await
            .unwrap();
        assert_eq!(success.method, FlashMethod::Katapult);
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.calls()[0].starts_with("python3"));
    }

    #[tokio::test]
    async fn test_preferred_failure_falls_back_once() {
        let scanner = FakeScanner {
            devices: vec![discovered("usb-Klipper_rp2040_3039343B-if00")],
        };
        let runner = ScriptedRunner::new(vec![failed_output("connect failed"), ok_output()]);
        let strategy = FlashStrategy::new(&runner, &scanner, "/k", "/kat", true);

        let success = strategy
            .flash(&device(Some("usb-Klipper_rp2040_30*")), Path::new("/fw.bin"))
            .await
            .unwrap();
        assert_eq!(success.method, FlashMethod::MakeFlash);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("FLASH_DEVICE=/dev/serial/by-id/usb-Klipper_rp2040_3039343B-if00"));
    }

    #[tokio::test]
    async fn test_no_run_pattern_fails_fast_without_fallback() {
        // No serial path at all: preferred never observes the device
        let scanner = FakeScanner { devices: vec![] };
        let runner = ScriptedRunner::new(vec![]);
        let strategy = FlashStrategy::new(&runner, &scanner, "/k", "/kat", true);

        let err = strategy
            .flash(&device(None), Path::new("/fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::NoBootloaderResponse { .. }));
        // Neither tool was ever invoked
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_disabled_by_config() {
        let scanner = FakeScanner {
            devices: vec![discovered("usb-katapult_rp2040_3039343B-if00")],
        };
        let runner = ScriptedRunner::new(vec![failed_output("boom")]);
        let strategy = FlashStrategy::new(&runner, &scanner, "/k", "/kat", false);

        let err = strategy
            .flash(&device(Some("usb-Klipper_rp2040_30*")), Path::new("/fw.bin"))
            .await
            .unwrap_err();
        // The tool ran against a real path, so this is a tool error
        assert!(matches!(err, FlashError::FlashToolError { .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_both_methods_failing_reports_both() {
        let scanner = FakeScanner {
            devices: vec![discovered("usb-katapult_rp2040_3039343B-if00")],
        };
        let runner = ScriptedRunner::new(vec![failed_output("no ack"), failed_output("no dfu")]);
        let strategy = FlashStrategy::new(&runner, &scanner, "/k", "/kat", true);

        let err = strategy
            .flash(&device(Some("usb-Klipper_rp2040_30*")), Path::new("/fw.bin"))
            .await
            .unwrap_err();
        let FlashError::FlashToolError { detail, .. } = err else {
            panic!("expected FlashToolError");
        };
        assert!(detail.contains("no ack"));
        assert!(detail.contains("no dfu"));
    }
}
