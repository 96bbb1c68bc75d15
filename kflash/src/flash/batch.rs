//! Batch flashing across all registered devices
//!
//! One cancellable countdown, one print-status gate and exactly one
//! service-stopped scope for the whole batch. Devices run strictly
//! sequentially with a cancellable stagger delay between them, and a
//! failure on one device never aborts the rest. The report covers every
//! requested device, whatever happened to it.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::errors::FlashError;
use crate::exec::CommandRunner;
use crate::flash::cancel::{CancelToken, WaitOutcome};
use crate::flash::gates::{GateDecision, SafetyGates};
use crate::flash::orchestrator::DeviceOrchestrator;
use crate::flash::service::ServiceLifecycle;
use crate::http::moonraker::StatusClient;
use crate::models::{BatchReport, DeviceProfile, FlashResult, Phase, PhaseOutcome, RunStatus};
use crate::storage::registry::Registry;

/// Drives a sequential flash run over many devices
pub struct BatchOrchestrator<'a> {
    orchestrator: &'a DeviceOrchestrator<'a>,
    registry: &'a Registry,
    runner: &'a dyn CommandRunner,
    status: Option<&'a dyn StatusClient>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        orchestrator: &'a DeviceOrchestrator<'a>,
        registry: &'a Registry,
        runner: &'a dyn CommandRunner,
        status: Option<&'a dyn StatusClient>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            runner,
            status,
        }
    }

    /// Flash every named device in order.
    ///
    /// Cancellation during the countdown aborts before any side effect;
    /// later cancellation skips the remaining devices while the service
    /// restart still runs.
    pub async fn run_all(
        &self,
        keys: &[String],
        skip_interactive: bool,
        cancel: &CancelToken,
    ) -> Result<BatchReport, FlashError> {
        let global = self.orchestrator.global();

        let mut skipped: Vec<FlashResult> = Vec::new();
        let mut queue: Vec<DeviceProfile> = Vec::new();
        for key in keys {
            match self.registry.get(key).await? {
                Some(profile) if profile.flashable => queue.push(profile),
                Some(_) => skipped.push(FlashResult::skipped(key, "marked non-flashable")),
                None => skipped.push(FlashResult::skipped(key, "not registered")),
            }
        }

        if queue.is_empty() {
            return Ok(BatchReport::new(skipped));
        }

        if global.countdown_secs > 0.0 {
            info!(
                "flashing {} device(s) in {:.0}s",
                queue.len(),
                global.countdown_secs
            );
            let countdown = Duration::from_secs_f64(global.countdown_secs);
            if cancel.sleep(countdown).await == WaitOutcome::Cancelled {
                return Err(FlashError::UserCancelled);
            }
        }

        // One print gate covers the whole batch; per-device gates would
        // query a host we are about to stop
        if let Some(status) = self.status {
            match SafetyGates::new(status).print_status_gate().await {
                GateDecision::Block { reason, recovery } => {
                    let results = queue
                        .into_iter()
                        .map(|profile| FlashResult {
                            device_key: profile.key,
                            status: RunStatus::Blocked,
                            phases: vec![PhaseOutcome::blocked(Phase::Safety, reason.clone())
                                .with_recovery(recovery.clone())],
                            elapsed: Duration::ZERO,
                            method: None,
                            verification: None,
                        })
                        .chain(skipped)
                        .collect();
                    return Ok(BatchReport::new(results));
                }
                GateDecision::ProceedWithWarning { reason, .. } => warn!("{reason}"),
                GateDecision::Proceed => {}
            }
        }

        let stagger = Duration::from_secs_f64(global.stagger_delay_secs);
        let lifecycle = ServiceLifecycle::new(self.runner, &global.service_name);
        let scope = lifecycle
            .with_stopped(|| self.flash_queue(&queue, skip_interactive, stagger, cancel))
            .await;

        let (mut results, restart_warning) = match scope {
            Ok(scope) => (scope.value, scope.restart_warning),
            Err(e) => {
                // Stop failed: nothing was flashed, every queued device
                // reports the service failure
                let results = queue
                    .iter()
                    .map(|profile| FlashResult {
                        device_key: profile.key.clone(),
                        status: RunStatus::Failed,
                        phases: vec![PhaseOutcome::failed(Phase::Service, e.to_string())],
                        elapsed: Duration::ZERO,
                        method: None,
                        verification: None,
                    })
                    .collect();
                (results, None)
            }
        };

        if let Some(warning) = &restart_warning {
            error!("{warning}");
        }

        results.extend(skipped);
        Ok(BatchReport::new(results).with_restart_warning(restart_warning))
    }

    async fn flash_queue(
        &self,
        queue: &[DeviceProfile],
        skip_interactive: bool,
        stagger: Duration,
        cancel: &CancelToken,
    ) -> Vec<FlashResult> {
        let mut results = Vec::with_capacity(queue.len());
        for (index, profile) in queue.iter().enumerate() {
            if index > 0 && !stagger.is_zero() && !cancel.is_cancelled() {
                cancel.sleep(stagger).await;
            }
            if cancel.is_cancelled() {
                results.push(FlashResult::skipped(&profile.key, "cancelled by user"));
                continue;
            }

            info!(
                "batch device {}/{}: {}",
                index + 1,
                queue.len(),
                profile.key
            );
            results.push(
                self.orchestrator
                    .run_in_scope(profile, skip_interactive, cancel)
                    .await,
            );
        }
        results
    }
}
