use std::time;

#[derive(Copy, Clone, Debug)]
/// Exponential backoff used to schedule batch redelivery.
pub struct RetryPolicy {
    /// How many times a failed batch is retried before it is dead-lettered.
    max_retries: u32,
    /// Coefficient to multiply initial_interval with for every past retry.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a batch that has already failed `failures` times may be tried again.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Calculate the delay before the retry that follows the `failures`-th failure.
    pub fn retry_interval(&self, failures: u32) -> time::Duration {
        let exponent = failures.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    max_retries: u32,
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> RetryPolicyBuilder {
        self.max_retries = max_retries;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a RetryPolicy according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
