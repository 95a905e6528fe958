//! Retry timing for failed `accept()` calls.

use std::time::Duration;

/// Exponential back-off applied when the listener fails to accept.
///
/// The first retry waits `initial_delay`. Each further failure doubles the
/// wait up to `max_delay`, and a successful accept resets it.
///
/// Defaults to 10 milliseconds initially, capped at 1 second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the wait.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Raise both delays to at least one millisecond and order them.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use wsengine::server::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::ZERO,
    ///     max_delay: Duration::from_millis(0),
    /// }
    /// .normalized();
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
    /// assert_eq!(cfg.max_delay, Duration::from_millis(1));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Duration::from_millis(5), Duration::from_millis(1), 1, 5)]
    #[case(Duration::ZERO, Duration::from_millis(50), 1, 50)]
    #[case(Duration::from_millis(10), Duration::from_millis(20), 10, 20)]
    fn normalized_orders_and_floors_delays(
        #[case] initial_delay: Duration,
        #[case] max_delay: Duration,
        #[case] expected_initial_ms: u64,
        #[case] expected_max_ms: u64,
    ) {
        let cfg = BackoffConfig {
            initial_delay,
            max_delay,
        }
        .normalized();
        assert_eq!(cfg.initial_delay, Duration::from_millis(expected_initial_ms));
        assert_eq!(cfg.max_delay, Duration::from_millis(expected_max_ms));
    }
}
