//! Randomized pacing between site requests.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Sleeps for a random delay between two bounds before each site request.
///
/// Requests within a job are strictly sequential, so a jittered pause is the
/// only rate limiting the pipeline applies.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    min: Duration,
    max: Duration,
}

impl Pacing {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        if min > max {
            return Self { min: max, max: min };
        }
        Self { min, max }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_delay_min, config.request_delay_max)
    }

    /// Pick the next delay.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.max.is_zero() || self.min == self.max {
            return self.min;
        }
        let millis = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Wait for the next delay.
    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
