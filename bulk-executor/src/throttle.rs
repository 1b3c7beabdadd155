/// A partitioned store provisions throughput per partition key range. When a client writes to a
/// range faster than that, the store answers with "request rate too large" and a hint of how long
/// to back off, instead of queueing the work.
///
/// The in-memory store uses this limiter to behave the same way: every range gets its own quota
/// of requests per second, and a request over quota is refused with the time until the range has
/// capacity again.
use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};

// See: https://docs.rs/governor/latest/governor/_guide/index.html#usage-in-multiple-threads
#[derive(Clone)]
pub struct CapacityLimiter {
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
    clock: DefaultClock,
}

impl CapacityLimiter {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let limiter = Arc::new(governor::RateLimiter::dashmap(quota));

        CapacityLimiter {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    /// Take one request from the range's quota, or say how long until one is available.
    pub fn check(&self, range_id: &str) -> Result<(), Duration> {
        self.limiter
            .check_key(&range_id.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}
