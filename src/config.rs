use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POLL_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff schedule applied when a failed row is reset to `AVAILABLE`.
///
/// The delay is a pure function of the row's error count, monotonically
/// non-decreasing and bounded, so a retried row never becomes claimable
/// before `now + delay(error_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    /// The same delay for every retry.
    Fixed(Duration),
    /// `base` doubled for each prior failure, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on the delay.
        max: Duration,
    },
}

impl RetryBackoff {
    /// Delay to apply after the `error_count`-th failure (1-based).
    pub fn delay(&self, error_count: i32) -> Duration {
        match *self {
            RetryBackoff::Fixed(delay) => delay,
            RetryBackoff::Exponential { base, max } => {
                // Doublings are capped well before the duration can overflow.
                let doublings = error_count.saturating_sub(1).clamp(0, 30) as u32;
                base.saturating_mul(1u32 << doublings).min(max)
            }
        }
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Configuration for one persistent bus instance.
///
/// Built with [`BusConfig::new`] and refined through the chained setters:
///
/// ```
/// use std::time::Duration;
/// use durabus::BusConfig;
///
/// let config = BusConfig::new("bus_events")
///     .nb_threads(8)
///     .poll_interval(Duration::from_millis(250))
///     .max_failure_retries(5);
/// assert_eq!(config.history_table_name(), "bus_events_history");
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Base live-table name; the history table is `<table_name>_history`.
    pub table_name: String,
    /// Identifies this process in `creator_name`/`processing_owner` when
    /// several processes share one queue table.
    pub instance_name: String,
    /// Upper bound on concurrently dispatched events.
    pub nb_threads: usize,
    /// Sleep between empty claim ticks.
    pub poll_interval: Duration,
    /// Maximum random addition to the poll sleep, reducing thundering-herd
    /// effects when several processes poll the same table.
    pub poll_jitter: Duration,
    /// Upper bound on rows per claim.
    pub claim_batch_size: usize,
    /// How long a claim remains exclusive before the row becomes
    /// reclaimable.
    pub claim_lease: Duration,
    /// Failure count beyond which a row is parked in history as `FAILED`.
    pub max_failure_retries: i32,
    /// Backoff schedule for rows reset to `AVAILABLE` after a failure.
    pub retry_backoff: RetryBackoff,
    /// How long `stop` waits for in-flight dispatches to drain.
    pub shutdown_timeout: Duration,
    /// Propagate publish errors from `post` instead of logging and
    /// swallowing them.
    pub strict_publish: bool,
}

impl BusConfig {
    /// Configuration with defaults for the given live-table name.
    pub fn new(table_name: impl Into<String>) -> Self {
        BusConfig {
            table_name: table_name.into(),
            instance_name: "main".to_owned(),
            nb_threads: 4,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: DEFAULT_POLL_JITTER,
            claim_batch_size: 10,
            claim_lease: DEFAULT_CLAIM_LEASE,
            max_failure_retries: 3,
            retry_backoff: RetryBackoff::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            strict_publish: false,
        }
    }

    /// Set the process identity used in owner and creator tags.
    pub fn instance_name(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = instance_name.into();
        self
    }

    /// Set the worker pool size.
    pub fn nb_threads(mut self, nb_threads: usize) -> Self {
        self.nb_threads = nb_threads.max(1);
        self
    }

    /// Set the sleep between empty claim ticks.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to the poll sleep.
    pub fn poll_jitter(mut self, poll_jitter: Duration) -> Self {
        self.poll_jitter = poll_jitter;
        self
    }

    /// Set the upper bound on rows per claim.
    pub fn claim_batch_size(mut self, claim_batch_size: usize) -> Self {
        self.claim_batch_size = claim_batch_size.max(1);
        self
    }

    /// Set the claim lease duration.
    pub fn claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Set the failure count beyond which a row transitions to `FAILED`.
    pub fn max_failure_retries(mut self, max_failure_retries: i32) -> Self {
        self.max_failure_retries = max_failure_retries;
        self
    }

    /// Set the retry backoff schedule.
    pub fn retry_backoff(mut self, retry_backoff: RetryBackoff) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Set how long `stop` waits for in-flight dispatches.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Propagate publish errors from `post` instead of swallowing them.
    pub fn strict_publish(mut self, strict_publish: bool) -> Self {
        self.strict_publish = strict_publish;
        self
    }

    /// Name of the history table paired with the live table.
    pub fn history_table_name(&self) -> String {
        format!("{}_history", self.table_name)
    }

    /// Tag recorded as `creator_name` on rows published by this process and
    /// as `processing_owner` on rows it claims.
    pub fn owner_tag(&self) -> String {
        format!("{}-{}", self.instance_name, std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = RetryBackoff::Fixed(Duration::from_secs(5));
        for error_count in 1..10 {
            assert_eq!(backoff.delay(error_count), Duration::from_secs(5));
        }
    }

    #[test]
    fn exponential_backoff_is_monotone_and_bounded() {
        let backoff = RetryBackoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));

        let mut previous = Duration::ZERO;
        for error_count in 1..100 {
            let delay = backoff.delay(error_count);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
    }

    #[test]
    fn owner_tag_carries_instance_and_pid() {
        let config = BusConfig::new("bus_events").instance_name("worker-a");
        let tag = config.owner_tag();
        assert!(tag.starts_with("worker-a-"));
    }
}
