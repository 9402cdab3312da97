//! Bounded polling with a fixed cadence.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// Polls a probe until it yields a value or the attempt budget runs out.
///
/// The first probe runs after `initial_delay`; later ones are spaced by
/// `interval`. No sleep follows the last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Poller {
    /// Waiting for a guest to power off after an ACPI shutdown.
    pub const SHUTDOWN: Poller = Poller {
        initial_delay: Duration::from_secs(1),
        interval: Duration::from_secs(1),
        max_attempts: 120,
    };

    /// Waiting for the guest to obtain a DHCP lease.
    pub const IP_ADDRESS: Poller = Poller {
        initial_delay: Duration::from_secs(5),
        interval: Duration::from_secs(3),
        max_attempts: 60,
    };

    pub fn new(initial_delay: Duration, interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            interval,
            max_attempts,
        }
    }

    /// Run `probe` until it returns `Some`.
    ///
    /// The probe gets the 1-based attempt number. `Ok(None)` means "not yet";
    /// a probe error aborts polling. Returns `Ok(None)` when every attempt
    /// came back empty.
    pub async fn until<T, E, F, Fut>(&self, mut probe: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        tokio::time::sleep(self.initial_delay).await;

        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt).await? {
                return Ok(Some(value));
            }
            trace!(attempt, max = self.max_attempts, "Condition not met yet");
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Ok(None)
    }
}
