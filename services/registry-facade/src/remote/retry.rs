//! Bounded exponential-backoff retry for upstream calls.

use std::error::Error as StdError;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub wait_min: Duration,

    /// Upper bound for any single delay.
    pub wait_max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.wait_min.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.wait_max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(0.0..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Classifies errors the retry loop may try again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Connection-level failures worth another attempt. Anything that got an
/// HTTP response back is permanent.
impl Transient for reqwest::Error {
    fn is_transient(&self) -> bool {
        if self.is_connect() {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                return is_transient_io(io_err.kind());
            }
            source = err.source();
        }
        false
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Runs `op` until it succeeds, fails permanently, or the policy's attempts
/// are used up. The last error is returned as is.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay(attempt - 1);
                debug!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient upstream error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
