use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tracing::debug;

/// Limiter shared by every REST request.
///
/// Allows a burst of `capacity` requests and replenishes one permit every
/// `window / capacity`. `acquire` waits until a permit is available.
pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
        let period = (window / burst.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: DefaultDirectRateLimiter::direct(quota),
        }
    }

    pub async fn acquire(&self) {
        if self.limiter.check().is_ok() {
            return;
        }
        debug!("REST rate limit reached, waiting");
        self.limiter.until_ready().await;
    }
}
