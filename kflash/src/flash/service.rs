//! Klipper service lifecycle
//!
//! Firmware uploads must run while the host service is stopped, and the
//! service must be running again afterwards no matter what happened in
//! between. `with_stopped` encodes that guarantee: a failed stop aborts
//! before the body runs, and the restart is attempted on every exit path.
//! A failed restart surfaces as a warning carrying the manual command, and
//! never masks the body's own outcome.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

use crate::errors::FlashError;
use crate::exec::{CommandRunner, CommandSpec};

/// Ceiling for each systemctl invocation
pub const TIMEOUT_SERVICE: Duration = Duration::from_secs(30);

/// Outcome of a stopped-service scope
#[derive(Debug)]
pub struct ScopeResult<T> {
    /// What the body produced
    pub value: T,

    /// Set when the restart failed; contains the manual-recovery
    /// instruction to surface to the user
    pub restart_warning: Option<String>,
}

/// Controls the host's printer service via systemctl
pub struct ServiceLifecycle<'a> {
    runner: &'a dyn CommandRunner,
    service_name: String,
}

impl<'a> ServiceLifecycle<'a> {
    pub fn new(runner: &'a dyn CommandRunner, service_name: impl Into<String>) -> Self {
        Self {
            runner,
            service_name: service_name.into(),
        }
    }

    async fn systemctl(&self, action: &str) -> Result<(), FlashError> {
        let output = self
            .runner
            .run(
                CommandSpec::new("sudo", TIMEOUT_SERVICE)
                    .arg("systemctl")
                    .arg(action)
                    .arg(&self.service_name),
            )
            .await?;

        if output.success() {
            Ok(())
        } else {
            Err(FlashError::ServiceControlError {
                action: action.to_string(),
                detail: if output.timed_out {
                    format!("timed out after {}s", TIMEOUT_SERVICE.as_secs())
                } else {
                    output.tail(5)
                },
            })
        }
    }

    /// Run `body` with the service stopped, then restart it.
    ///
    /// A stop failure aborts before the body runs. The restart is
    /// attempted unconditionally; its failure is reported separately so
    /// the body's result is never lost.
    pub async fn with_stopped<T, F, Fut>(&self, body: F) -> Result<ScopeResult<T>, FlashError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        info!("stopping service '{}'", self.service_name);
        self.systemctl("stop").await?;

        let value = body().await;

        info!("restarting service '{}'", self.service_name);
        let restart_warning = match self.systemctl("start").await {
            Ok(()) => None,
            Err(e) => {
                error!("service restart failed: {e}");
                Some(format!(
                    "Could not restart '{0}' ({e}). Run: sudo systemctl start {0}",
                    self.service_name
                ))
            }
        };

        Ok(ScopeResult {
            value,
            restart_warning,
        })
    }
}
