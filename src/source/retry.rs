//! Bounded exponential backoff for source reconnects

use crate::config::RetrySettings;
use crate::error::SourceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which a backoff sleep checks the running flag
const SLEEP_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.initial_delay(),
            max_delay: settings.max_delay(),
            multiplier: settings.multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails unrecoverably, or the attempts run
    /// out. Returns `Ok(None)` if `running` is cleared while waiting.
    pub fn run<T>(
        &self,
        running: &AtomicBool,
        mut op: impl FnMut(u32) -> Result<T, SourceError>,
    ) -> Result<Option<T>, SourceError> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.max_retries {
            let delay = self.delay_for(attempt);
            tracing::info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt,
                self.max_retries,
                delay
            );
            if !sleep_while_running(delay, running) {
                return Ok(None);
            }
            match op(attempt) {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }
        Err(SourceError::RetriesExhausted {
            attempts: self.max_retries,
            last_error,
        })
    }
}

/// Sleep for `duration` unless `running` goes false first.
///
/// Returns whether the flag was still set at the end.
pub fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
