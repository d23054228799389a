//! Inbound frame throttling for WebSocket sessions.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

/// Per-connection limiter: refills `per_sec` frames per second and admits
/// bursts of up to `burst` frames. Zero values are treated as one.
pub fn frame_limiter(per_sec: u32, burst: u32) -> DefaultDirectRateLimiter {
    let per_sec = NonZeroU32::new(per_sec).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(per_sec).allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_after_the_burst_is_refused() {
        let limiter = frame_limiter(30, 50);
        let admitted = (0..50).filter(|_| limiter.check().is_ok()).count();
        assert_eq!(admitted, 50);
        assert!(limiter.check().is_err());
    }

    #[test]
    fn zero_quota_still_admits_one_frame() {
        let limiter = frame_limiter(0, 0);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
