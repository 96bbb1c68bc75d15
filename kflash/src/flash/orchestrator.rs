//! Per-device flash orchestration
//!
//! Sequences one device through safety gates, config resolution, build,
//! the service-stopped flash scope and post-flash verification. Every
//! phase leaves a `PhaseOutcome` in the result; raw errors never cross
//! this boundary. Cancellation is honored between phases and inside the
//! flash scope, where the service restart still runs.

use std::path::PathBuf;

use tokio::time::Instant;
use tracing::info;

use crate::discovery::SerialScanner;
use crate::errors::FlashError;
use crate::exec::CommandRunner;
use crate::flash::build::BuildPipeline;
use crate::flash::cancel::CancelToken;
use crate::flash::config_check::{ConfigResolver, Configurator};
use crate::flash::gates::{GateDecision, SafetyGates};
use crate::flash::service::ServiceLifecycle;
use crate::flash::strategy::{FlashStrategy, FlashSuccess};
use crate::flash::verify::{verification_outcome, Verifier};
use crate::http::moonraker::StatusClient;
use crate::models::{
    DeviceProfile, FlashResult, GlobalConfig, Phase, PhaseOutcome, RunStatus, Verification,
};
use crate::storage::config_cache::ConfigCache;
use crate::storage::registry::Registry;
use crate::utils::expand_home;

/// Render a gate decision as a phase outcome
fn gate_outcome(decision: &GateDecision, ok_message: &str) -> PhaseOutcome {
    match decision {
        GateDecision::Proceed => PhaseOutcome::ok(Phase::Safety, ok_message),
        GateDecision::ProceedWithWarning { reason, .. } => {
            PhaseOutcome::warned(Phase::Safety, reason.clone())
        }
        GateDecision::Block { reason, recovery } => {
            PhaseOutcome::blocked(Phase::Safety, reason.clone()).with_recovery(recovery.clone())
        }
    }
}

/// Drives the full flash pipeline for registered devices
pub struct DeviceOrchestrator<'a> {
    registry: &'a Registry,
    cache: &'a ConfigCache,
    runner: &'a dyn CommandRunner,
    scanner: &'a dyn SerialScanner,
    status: Option<&'a dyn StatusClient>,
    configurator: Option<&'a dyn Configurator>,
    global: GlobalConfig,
}

impl<'a> DeviceOrchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &'a Registry,
        cache: &'a ConfigCache,
        runner: &'a dyn CommandRunner,
        scanner: &'a dyn SerialScanner,
        status: Option<&'a dyn StatusClient>,
        configurator: Option<&'a dyn Configurator>,
        global: GlobalConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            runner,
            scanner,
            status,
            configurator,
            global: global.clamped(),
        }
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn klipper_dir(&self) -> PathBuf {
        expand_home(&self.global.klipper_dir)
    }

    /// Flash one registered device end to end
    pub async fn run(
        &self,
        device_key: &str,
        skip_interactive: bool,
        cancel: &CancelToken,
    ) -> Result<FlashResult, FlashError> {
        let profile = self
            .registry
            .get(device_key)
            .await?
            .ok_or_else(|| FlashError::DeviceNotRegistered(device_key.to_string()))?;

        if !profile.flashable {
            return Ok(FlashResult::skipped(device_key, "marked non-flashable"));
        }

        let start = Instant::now();
        let mut run = RunState::new(&profile);

        if !self.safety_phase(&profile, &mut run).await {
            return Ok(run.finish(RunStatus::Blocked, start));
        }
        if run.cancelled_before(Phase::Config, cancel) {
            return Ok(run.finish(RunStatus::Failed, start));
        }

        if !self.config_phase(&profile, skip_interactive, &mut run).await {
            return Ok(run.finish(RunStatus::Failed, start));
        }
        if run.cancelled_before(Phase::Build, cancel) {
            return Ok(run.finish(RunStatus::Failed, start));
        }

        let Some(firmware) = self.build_phase(&profile, &mut run).await else {
            return Ok(run.finish(RunStatus::Failed, start));
        };
        if run.cancelled_before(Phase::Flash, cancel) {
            return Ok(run.finish(RunStatus::Failed, start));
        }

        let lifecycle = ServiceLifecycle::new(self.runner, &self.global.service_name);
        let scope = lifecycle
            .with_stopped(|| self.flash_body(&profile, &firmware, cancel))
            .await;

        let scope = match scope {
            Ok(scope) => scope,
            Err(e) => {
                run.phases.push(PhaseOutcome::failed(Phase::Service, e.to_string()));
                return Ok(run.finish(RunStatus::Failed, start));
            }
        };
        run.phases.push(PhaseOutcome::ok(
            Phase::Service,
            format!("Service '{}' stopped for flashing", self.global.service_name),
        ));
        if let Some(warning) = scope.restart_warning {
            run.phases.push(PhaseOutcome::warned(Phase::Service, warning));
        }

        if !run.record_flash(scope.value) {
            return Ok(run.finish(RunStatus::Failed, start));
        }

        self.verify_phase(&profile, &mut run).await;
        Ok(run.finish(RunStatus::Success, start))
    }

    /// Pipeline variant for batch runs: the print gate and the service
    /// scope belong to the batch, so this covers config through verify
    /// with the service assumed stopped.
    pub(crate) async fn run_in_scope(
        &self,
        profile: &DeviceProfile,
        skip_interactive: bool,
        cancel: &CancelToken,
    ) -> FlashResult {
        let start = Instant::now();
        let mut run = RunState::new(profile);

        if !self.config_phase(profile, skip_interactive, &mut run).await {
            return run.finish(RunStatus::Failed, start);
        }
        if run.cancelled_before(Phase::Build, cancel) {
            return run.finish(RunStatus::Failed, start);
        }

        let Some(firmware) = self.build_phase(profile, &mut run).await else {
            return run.finish(RunStatus::Failed, start);
        };
        if run.cancelled_before(Phase::Flash, cancel) {
            return run.finish(RunStatus::Failed, start);
        }

        if !run.record_flash(self.flash_body(profile, &firmware, cancel).await) {
            return run.finish(RunStatus::Failed, start);
        }

        self.verify_phase(profile, &mut run).await;
        run.finish(RunStatus::Success, start)
    }

    /// Returns false when a gate blocked the run
    async fn safety_phase(&self, profile: &DeviceProfile, run: &mut RunState) -> bool {
        let Some(status) = self.status else {
            run.phases.push(PhaseOutcome::warned(
                Phase::Safety,
                "Host status client unavailable; safety checks skipped",
            ));
            return true;
        };

        let gates = SafetyGates::new(status);
        let print_decision = gates.print_status_gate().await;
        let blocked = print_decision.is_blocked();
        run.phases
            .push(gate_outcome(&print_decision, "No active print job"));
        if blocked {
            return false;
        }

        let version_decision = gates.version_gate(profile).await;
        run.phases
            .push(gate_outcome(&version_decision, "Firmware versions compared"));
        true
    }

    /// Returns false on config resolution failure
    async fn config_phase(
        &self,
        profile: &DeviceProfile,
        skip_interactive: bool,
        run: &mut RunState,
    ) -> bool {
        let resolver = ConfigResolver::new(self.cache, self.configurator);
        match resolver.resolve(profile, skip_interactive).await {
            Ok(artifact) => {
                let mcu = artifact.mcu.as_deref().unwrap_or("unknown");
                run.phases.push(PhaseOutcome::ok(
                    Phase::Config,
                    format!("Config resolved (MCU {mcu})"),
                ));
                true
            }
            Err(e) => {
                run.phases.push(PhaseOutcome::failed(Phase::Config, e.to_string()));
                false
            }
        }
    }

    /// Returns the firmware path, or None on build failure
    async fn build_phase(&self, profile: &DeviceProfile, run: &mut RunState) -> Option<PathBuf> {
        let pipeline = BuildPipeline::new(self.runner, self.cache, self.klipper_dir());
        match pipeline.build(profile).await {
            Ok(output) => {
                run.phases.push(
                    PhaseOutcome::ok(
                        Phase::Build,
                        format!("Built {}", output.firmware.display()),
                    )
                    .with_elapsed(output.elapsed),
                );
                Some(output.firmware)
            }
            Err(e) => {
                let mut outcome = PhaseOutcome::failed(Phase::Build, e.to_string());
                if let FlashError::BuildFailed {
                    exit_code: Some(code),
                    ..
                } = e
                {
                    outcome = outcome.with_context(crate::models::PhaseContext {
                        exit_code: Some(code),
                        ..Default::default()
                    });
                }
                run.phases.push(outcome);
                None
            }
        }
    }

    /// The body run inside the stopped-service scope. Cancellation aborts
    /// the upload; the caller's scope still restarts the service.
    async fn flash_body(
        &self,
        profile: &DeviceProfile,
        firmware: &std::path::Path,
        cancel: &CancelToken,
    ) -> Result<FlashSuccess, FlashError> {
        let strategy = FlashStrategy::new(
            self.runner,
            self.scanner,
            self.klipper_dir(),
            expand_home(&self.global.katapult_dir),
            self.global.allow_flash_fallback,
        );
        tokio::select! {
            result = strategy.flash(profile, firmware) => result,
            _ = cancel.cancelled() => Err(FlashError::UserCancelled),
        }
    }

    async fn verify_phase(&self, profile: &DeviceProfile, run: &mut RunState) {
        let verifier = Verifier::new(self.scanner, self.status, self.global.verify_ceiling_secs);
        let verification = verifier.verify(profile).await;
        run.phases
            .push(verification_outcome(&verification, &self.global.service_name));
        run.verification = Some(verification);
    }
}

/// Accumulates phase outcomes while a run is in flight
struct RunState {
    device_key: String,
    phases: Vec<PhaseOutcome>,
    method: Option<crate::models::FlashMethod>,
    verification: Option<Verification>,
}

impl RunState {
    fn new(profile: &DeviceProfile) -> Self {
        Self {
            device_key: profile.key.clone(),
            phases: Vec::new(),
            method: None,
            verification: None,
        }
    }

    /// Record a cancellation check; true when the run must stop
    fn cancelled_before(&mut self, phase: Phase, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            self.phases.push(PhaseOutcome::failed(
                phase,
                format!("Cancelled by user before {phase}"),
            ));
            true
        } else {
            false
        }
    }

    /// Record the flash attempt; true on success
    fn record_flash(&mut self, result: Result<FlashSuccess, FlashError>) -> bool {
        match result {
            Ok(success) => {
                self.phases.push(
                    PhaseOutcome::ok(
                        Phase::Flash,
                        format!("Flashed via {}", success.method),
                    )
                    .with_elapsed(success.elapsed),
                );
                self.method = Some(success.method);
                true
            }
            Err(e) => {
                self.phases.push(PhaseOutcome::failed(Phase::Flash, e.to_string()));
                false
            }
        }
    }

    fn finish(self, status: RunStatus, start: Instant) -> FlashResult {
        info!("run for '{}' finished: {:?}", self.device_key, status);
        FlashResult {
            device_key: self.device_key,
            status,
            phases: self.phases,
            elapsed: start.elapsed(),
            method: self.method,
            verification: self.verification,
        }
    }
}
