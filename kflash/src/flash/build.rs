//! Firmware build pipeline
//!
//! Stages the device's cached config into the firmware tree, runs
//! `make clean` followed by a parallel `make`, and checks that the build
//! actually produced `out/klipper.bin`. A zero exit without the artifact
//! is still a failure. No retries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::errors::FlashError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::flash::config_check::ConfigResolver;
use crate::models::DeviceProfile;
use crate::storage::config_cache::ConfigCache;

/// Ceiling for the compile step
pub const TIMEOUT_BUILD: Duration = Duration::from_secs(300);

/// Ceiling for `make clean`
pub const TIMEOUT_CLEAN: Duration = Duration::from_secs(60);

/// Firmware binary relative to the source tree
pub const FIRMWARE_ARTIFACT: &str = "out/klipper.bin";

/// Lines of tool output kept in failure diagnostics
const TAIL_LINES: usize = 15;

/// A completed build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    /// Absolute path of the produced firmware binary
    pub firmware: PathBuf,
    pub elapsed: Duration,
}

/// Runs the configure-clean-compile sequence for one device
pub struct BuildPipeline<'a> {
    runner: &'a dyn CommandRunner,
    cache: &'a ConfigCache,
    klipper_dir: PathBuf,
    jobs: usize,
}

impl<'a> BuildPipeline<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cache: &'a ConfigCache,
        klipper_dir: impl Into<PathBuf>,
    ) -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            runner,
            cache,
            klipper_dir: klipper_dir.into(),
            jobs,
        }
    }

    /// Build firmware for a device whose config was already resolved by
    /// [`ConfigResolver::resolve`]
    pub async fn build(&self, device: &DeviceProfile) -> Result<BuildOutput, FlashError> {
        self.cache.stage(&device.key, &self.klipper_dir).await?;

        let clean = self
            .runner
            .run(
                CommandSpec::new("make", TIMEOUT_CLEAN)
                    .arg("clean")
                    .cwd(&self.klipper_dir),
            )
            .await?;
        if !clean.success() {
            return Err(FlashError::BuildFailed {
                exit_code: clean.exit_code,
                detail: format!("make clean failed: {}", clean.tail(TAIL_LINES)),
            });
        }

        info!("building firmware for '{}' (-j{})", device.key, self.jobs);
        let compile = self
            .runner
            .run(
                CommandSpec::new("make", TIMEOUT_BUILD)
                    .arg(format!("-j{}", self.jobs))
                    .cwd(&self.klipper_dir),
            )
            .await?;
        if compile.timed_out {
            return Err(FlashError::BuildFailed {
                exit_code: None,
                detail: format!("build timed out after {}s", TIMEOUT_BUILD.as_secs()),
            });
        }
        if !compile.success() {
            return Err(FlashError::BuildFailed {
                exit_code: compile.exit_code,
                detail: compile.tail(TAIL_LINES),
            });
        }

        let firmware = self.klipper_dir.join(FIRMWARE_ARTIFACT);
        if !artifact_exists(&firmware).await {
            return Err(FlashError::BuildFailed {
                exit_code: compile.exit_code,
                detail: format!("build succeeded but {FIRMWARE_ARTIFACT} was not produced"),
            });
        }

        Ok(BuildOutput {
            firmware,
            elapsed: clean.elapsed + compile.elapsed,
        })
    }
}

async fn artifact_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::storage::layout::StorageLayout;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records invocations and replays scripted outputs
    struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: Mutex<Vec<String>>,
        artifact: Option<PathBuf>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
                artifact: None,
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
            let mut outputs = self.outputs.lock().unwrap();
            let output = outputs.remove(0);
            // Scripted success of the compile step materializes the artifact
            if output.success() && spec.display() != "make clean" {
                if let Some(path) = &self.artifact {
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, b"firmware").unwrap();
                }
            }
            Ok(output)
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_secs(1),
            timed_out: false,
        }
    }

    fn failed_output(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_secs(1),
            timed_out: false,
        }
    }

    fn device() -> DeviceProfile {
        DeviceProfile {
            key: "octo".to_string(),
            name: "Octopus".to_string(),
            mcu: "stm32h723".to_string(),
            bootloader_pattern: "usb-katapult_*".to_string(),
            run_pattern: None,
            flashable: true,
        }
    }

    async fn cache_with_config(dir: &Path) -> ConfigCache {
        let cache = ConfigCache::new(StorageLayout::new(dir));
        cache
            .save("octo", "CONFIG_MCU=\"stm32h723xx\"\n")
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_successful_build_stages_config_and_finds_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let klipper = dir.path().join("klipper");
        tokio::fs::create_dir_all(&klipper).await.unwrap();
        let cache = cache_with_config(dir.path()).await;

        let mut runner = ScriptedRunner::new(vec![ok_output(), ok_output()]);
        runner.artifact = Some(klipper.join(FIRMWARE_ARTIFACT));

        let pipeline = BuildPipeline::new(&runner, &cache, &klipper);
        let output = pipeline.build(&device()).await.unwrap();

        assert_eq!(output.firmware, klipper.join(FIRMWARE_ARTIFACT));
        let calls = runner.calls();
        assert_eq!(calls[0], "make clean");
        assert!(calls[1].starts_with("make -j"));
        // Config was staged into the tree
        let staged = tokio::fs::read_to_string(klipper.join(".config")).await.unwrap();
        assert!(staged.contains("CONFIG_MCU"));
    }

    #[tokio::test]
    async fn test_compile_failure_carries_exit_code_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let klipper = dir.path().join("klipper");
        tokio::fs::create_dir_all(&klipper).await.unwrap();
        let cache = cache_with_config(dir.path()).await;

        let runner = ScriptedRunner::new(vec![
            ok_output(),
            failed_output(2, "error: 'PA13' undeclared"),
        ]);
        let pipeline = BuildPipeline::new(&runner, &cache, &klipper);

        let err = pipeline.build(&device()).await.unwrap_err();
        let FlashError::BuildFailed { exit_code, detail } = err else {
            panic!("expected BuildFailed");
        };
        assert_eq!(exit_code, Some(2));
        assert!(detail.contains("PA13"));
    }

    #[tokio::test]
    async fn test_zero_exit_without_artifact_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let klipper = dir.path().join("klipper");
        tokio::fs::create_dir_all(&klipper).await.unwrap();
        let cache = cache_with_config(dir.path()).await;

        // No artifact is ever written
        let runner = ScriptedRunner::new(vec![ok_output(), ok_output()]);
        let pipeline = BuildPipeline::new(&runner, &cache, &klipper);

        let err = pipeline.build(&device()).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::BuildFailed { detail, .. } if detail.contains("was not produced")
        ));
    }

    #[tokio::test]
    async fn test_clean_failure_skips_compile() {
        let dir = tempfile::tempdir().unwrap();
        let klipper = dir.path().join("klipper");
        tokio::fs::create_dir_all(&klipper).await.unwrap();
        let cache = cache_with_config(dir.path()).await;

        let runner = ScriptedRunner::new(vec![failed_output(1, "no makefile")]);
        let pipeline = BuildPipeline::new(&runner, &cache, &klipper);

        pipeline.build(&device()).await.unwrap_err();
        assert_eq!(runner.calls().len(), 1);
    }
}
