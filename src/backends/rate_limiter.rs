//! Minimum-spacing limiter for one external service.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use log::debug;

use super::clock::Clock;

/// Spacing used by both the fingerprint and metadata services unless configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1100);

/// Adapts the crate clock to governor so limiter time and sleeps agree.
#[derive(Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl governor::clock::Clock for LimiterClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.0.now()
    }
}

type DirectLimiter = governor::RateLimiter<
    NotKeyed,
    InMemoryState,
    LimiterClock,
    governor::middleware::NoOpMiddleware<Instant>,
>;

/// Blocks callers so consecutive calls to one service are at least `interval` apart.
///
/// One limiter guards one named service; limiters never coordinate with each
/// other. A zero interval disables spacing.
pub struct RateLimiter {
    service: &'static str,
    limiter: Option<DirectLimiter>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(service: &'static str, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let limiter = Quota::with_period(interval).map(|quota| {
            governor::RateLimiter::direct_with_clock(
                quota.allow_burst(NonZeroU32::MIN),
                LimiterClock(Arc::clone(&clock)),
            )
        });
        Self {
            service,
            limiter,
            clock,
        }
    }

    pub fn wait(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        while let Err(not_until) = limiter.check() {
            let delay = not_until.wait_time_from(self.clock.now());
            debug!("RateLimit[{}]: sleeping {:?}", self.service, delay);
            self.clock.sleep(delay);
        }
    }
}
