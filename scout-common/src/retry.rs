use std::time;

/// The policy used to space out repeated attempts at a failing delivery.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the backoff before the next attempt, given how many attempts
    /// have already failed. A `preferred_interval` (e.g. from a Retry-After
    /// header) acts as a lower bound, the policy maximum always wins.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match (preferred_interval, self.maximum_interval) {
            (Some(preferred), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), preferred),
                max_interval,
            ),
            (Some(preferred), None) => std::cmp::max(candidate_interval, preferred),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None);

        assert_eq!(policy.retry_interval(0, None), time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(1, None), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(3, None), time::Duration::from_secs(8));
    }

    #[test]
    fn maximum_interval_caps_backoff() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(4)),
        );

        assert_eq!(policy.retry_interval(10, None), time::Duration::from_secs(4));
    }

    #[test]
    fn preferred_interval_wins_over_shorter_backoff() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None);

        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(30))),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn preferred_interval_never_exceeds_maximum() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(10)),
        );

        assert_eq!(
            policy.retry_interval(0, Some(time::Duration::from_secs(120))),
            time::Duration::from_secs(10)
        );
    }
}
