//! Phase outcomes and per-run result records

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestration phase label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Safety,
    Config,
    Build,
    Service,
    Flash,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Safety => "Safety",
            Phase::Config => "Config",
            Phase::Build => "Build",
            Phase::Service => "Service",
            Phase::Flash => "Flash",
            Phase::Verify => "Verify",
        };
        f.write_str(label)
    }
}

/// Tagged kind of a phase outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Ok,
    Warned,
    Blocked,
    Failed,
}

/// Structured context attached to a phase outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseContext {
    /// Wall-clock time the phase took
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,

    /// Exit code of the underlying tool, when one ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Numbered remediation steps for the user
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<String>,
}

/// Result of one orchestration phase. Phases never return raw errors past
/// this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub kind: OutcomeKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PhaseContext>,
}

impl PhaseOutcome {
    pub fn ok(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind: OutcomeKind::Ok,
            message: message.into(),
            context: None,
        }
    }

    pub fn warned(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind: OutcomeKind::Warned,
            message: message.into(),
            context: None,
        }
    }

    pub fn blocked(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind: OutcomeKind::Blocked,
            message: message.into(),
            context: None,
        }
    }

    pub fn failed(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind: OutcomeKind::Failed,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: PhaseContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.context.get_or_insert_with(PhaseContext::default).elapsed = Some(elapsed);
        self
    }

    pub fn with_recovery<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ctx = self.context.get_or_insert_with(PhaseContext::default);
        ctx.recovery = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.kind, OutcomeKind::Ok | OutcomeKind::Warned)
    }
}

/// Flash method used for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMethod {
    /// In-application bootloader upload (Katapult flashtool)
    Katapult,
    /// Full reflash via the build system's flash target
    MakeFlash,
}

impl fmt::Display for FlashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashMethod::Katapult => f.write_str("katapult"),
            FlashMethod::MakeFlash => f.write_str("make_flash"),
        }
    }
}

/// Post-flash verification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verification {
    /// Run-mode path found and MCU reported healthy
    Confirmed { path: String, elapsed: Duration },
    /// Run-mode path found; health check failed or was unavailable
    PathOnly { path: String, elapsed: Duration },
    /// Device never reappeared (or appeared in the wrong mode)
    Unverified { reason: String },
}

/// Overall status of one device's run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failed,
    Blocked,
    Skipped,
}

/// Terminal record for one device's flash run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashResult {
    pub device_key: String,
    pub status: RunStatus,
    pub phases: Vec<PhaseOutcome>,
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<FlashMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl FlashResult {
    /// A run skipped before entering the pipeline
    pub fn skipped(device_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            status: RunStatus::Skipped,
            phases: vec![PhaseOutcome::warned(Phase::Safety, reason)],
            elapsed: Duration::ZERO,
            method: None,
            verification: None,
        }
    }
}

/// Aggregated outcome of a batch run. Never mutated after the batch
/// completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<FlashResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,

    /// Set when the post-batch service restart failed; carries the manual
    /// recovery instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_warning: Option<String>,
}

impl BatchReport {
    pub fn new(results: Vec<FlashResult>) -> Self {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut blocked = 0;
        let mut skipped = 0;
        for result in &results {
            match result.status {
                RunStatus::Success => succeeded += 1,
                RunStatus::Failed => failed += 1,
                RunStatus::Blocked => blocked += 1,
                RunStatus::Skipped => skipped += 1,
            }
        }
        Self {
            results,
            succeeded,
            failed,
            blocked,
            skipped,
            restart_warning: None,
        }
    }

    pub fn with_restart_warning(mut self, warning: Option<String>) -> Self {
        self.restart_warning = warning;
        self
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}
