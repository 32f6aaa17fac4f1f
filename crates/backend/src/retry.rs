//! Dialling agents' side of the transport with bounded retries.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use vigil_transport_ws::{Error, Session, TransportOptions, connect_with_cancel};

/// Exponential backoff between connection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Factor applied after every failure.
    pub multiplier: u32,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2,
            max_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, counting from zero.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Connects like [`vigil_transport_ws::connect`], retrying connection
/// failures and handshake timeouts.
///
/// Protocol violations are not retried: the peer answered, just wrongly.
///
/// # Errors
///
/// The last attempt's error once `max_attempts` is exhausted, `Cancelled` if
/// `cancel` fires, or the first non-retryable error.
pub async fn connect_with_backoff(
    url: &Url,
    options: &TransportOptions,
    backoff: Backoff,
    cancel: &CancellationToken,
) -> Result<Session, Error> {
    let mut attempt = 0;

    loop {
        let error = match connect_with_cancel(url, options, cancel).await {
            Ok(session) => return Ok(session),
            Err(e @ (Error::Connection(_) | Error::Timeout)) => e,
            Err(e) => return Err(e),
        };

        attempt += 1;
        if attempt >= backoff.max_attempts {
            return Err(error);
        }

        let delay = backoff.delay(attempt - 1);
        debug!(
            "connect to {} failed ({}), retrying in {:?}",
            url, error, delay
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
