//! Exponential-backoff retry wrapper for sink round-trips.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::client::SinkError;

/// Backoff schedule: doubles from `initial` up to `max`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    next: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }
}

/// How many attempts a sink operation gets before its error is terminal.
pub const MAX_ATTEMPTS: u32 = 5;

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Terminal errors and exhausted attempts return the last error.
/// Cancellation is honored between attempts: a canceled wait returns the
/// error immediately rather than sleeping it out.
pub async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    what: &'static str,
    mut op: F,
) -> Result<T, SinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
{
    let mut backoff = ExponentialBackoff::default();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff.next().expect("backoff is infinite");
                warn!(
                    message = "Transient sink failure; backing off.",
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(error),
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
