//! Timed polling utility
//!
//! Replaces ad-hoc sleep loops: poll a probe at a fixed interval up to a
//! ceiling and return a tagged outcome instead of blocking indefinitely.
//! Deterministic under tokio's paused test clock.

use std::time::Duration;

use tokio::time::Instant;

/// Interval and ceiling for one poll loop
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }
}

/// Tagged outcome of a poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Found { value: T, elapsed: Duration },
    TimedOut { elapsed: Duration },
}

/// Poll `probe` every `interval` until it yields a value or the ceiling is
/// reached. The probe runs once immediately; the interval is the minimum
/// spacing between subsequent checks.
pub async fn poll_until<T, F>(config: PollConfig, mut probe: F) -> PollOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = probe() {
            return PollOutcome::Found {
                value,
                elapsed: start.elapsed(),
            };
        }
        if start.elapsed() + config.interval > config.ceiling {
            return PollOutcome::TimedOut {
                elapsed: start.elapsed(),
            };
        }
        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_found_after_delay() {
        let calls = Cell::new(0u32);
        let config = PollConfig::new(Duration::from_millis(500), Duration::from_secs(30));

        // Appears on the 6th check, i.e. after 2.5s of waiting
        let outcome = poll_until(config, || {
            calls.set(calls.get() + 1);
            (calls.get() >= 6).then_some("found")
        })
        .await;

        match outcome {
            PollOutcome::Found { value, elapsed } => {
                assert_eq!(value, "found");
                assert_eq!(elapsed, Duration::from_millis(2500));
            }
            PollOutcome::TimedOut { .. } => panic!("expected Found"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_never_below_configured() {
        let calls = Cell::new(0u32);
        let config = PollConfig::new(Duration::from_millis(500), Duration::from_secs(3));

        let outcome: PollOutcome<()> = poll_until(config, || {
            calls.set(calls.get() + 1);
            None
        })
        .await;

        let PollOutcome::TimedOut { elapsed } = outcome else {
            panic!("expected TimedOut");
        };
        // With a 500ms floor between checks, a 3s ceiling allows at most 7
        // probe invocations (t=0 through t=3000 exclusive of overshoot)
        assert!(calls.get() <= 7, "probed {} times", calls.get());
        assert!(elapsed <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_hit_skips_sleep() {
        let config = PollConfig::new(Duration::from_millis(500), Duration::from_secs(30));
        let outcome = poll_until(config, || Some(42)).await;
        assert_eq!(
            outcome,
            PollOutcome::Found {
                value: 42,
                elapsed: Duration::ZERO
            }
        );
    }
}
