//! The Generic Cell Rate Algorithm over a single stored number: the
//! theoretical arrival time (TAT) in nanoseconds since the epoch.

use std::time::Duration;
use super::limit::Limit;

/// The outcome of evaluating a request against one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests of cost 1 still available after this one.
    pub remaining: i64,
    /// How long to wait before retrying; zero when allowed.
    pub retry_in: Duration,
    /// The TAT to store if this request is permitted and spent, and the
    /// bucket's time to live (the bucket is full again once it passes).
    pub new_tat_ns: i64,
    pub ttl: Duration,
}

/// Evaluates a request of `cost` against a bucket. `tat_ns` of `None` means
/// the bucket does not exist yet, which is the same as a full bucket. Pure:
/// the caller supplies the clock and stores the result.
pub fn decide(limit: &Limit, tat_ns: Option<i64>, cost: i64, now_ns: i64) -> Decision {
    let emission_interval = limit.emission_interval_ns();
    let burst_offset = limit.burst_offset_ns();

    let tat = tat_ns.unwrap_or(now_ns);
    let new_tat = tat.max(now_ns) + cost * emission_interval;
    let allow_at = new_tat - burst_offset;

    if allow_at <= now_ns {
        let remaining = if emission_interval > 0 {
            (now_ns - allow_at) / emission_interval
        } else {
            0
        };
        Decision {
            allowed: true,
            remaining,
            retry_in: Duration::ZERO,
            new_tat_ns: new_tat,
            ttl: Duration::from_nanos((new_tat - now_ns).max(0) as u64),
        }
    } else {
        Decision {
            allowed: false,
            remaining: 0,
            retry_in: Duration::from_nanos((allow_at - now_ns) as u64),
            new_tat_ns: new_tat,
            ttl: Duration::from_nanos((new_tat - now_ns).max(0) as u64),
        }
    }
}

/// Computes the TAT after refunding `cost`. The result never drops below
/// `now - burstOffset`; refunding more than was spent silently clamps at a
/// full bucket.
pub fn refund_tat(limit: &Limit, tat_ns: i64, cost: i64, now_ns: i64) -> i64 {
    let refunded = tat_ns - cost * limit.emission_interval_ns();
    refunded.max(now_ns - limit.burst_offset_ns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Name;
    use crate::ratelimit::limit::{parse_duration, LimitConfig};

    fn limit(burst: i64, count: i64, period: &str) -> Limit {
        Limit::new(
            Name::NewOrdersPerAccount,
            &LimitConfig { burst, count, period: parse_duration(period).unwrap(), fail_open: true },
        ).unwrap()
    }

    const SECOND: i64 = 1_000_000_000;

    #[test]
    fn fresh_bucket_permits_exactly_burst() {
        // burst 3, one token per second.
        let limit = limit(3, 10, "10s");
        let now = 1_700_000_000 * SECOND;

        let mut tat = None;
        for i in 0..3 {
            let d = decide(&limit, tat, 1, now);
            assert!(d.allowed, "request {} should be allowed", i);
            tat = Some(d.new_tat_ns);
        }

        let denied = decide(&limit, tat, 1, now);
        assert!(!denied.allowed);
        // retryAfter lands in (0, emissionInterval].
        assert!(denied.retry_in > Duration::ZERO);
        assert!(denied.retry_in <= Duration::from_secs(1));
    }

    #[test]
    fn waiting_k_emission_intervals_restores_k_tokens() {
        let limit = limit(3, 10, "10s");
        let now = 1_700_000_000 * SECOND;

        let mut tat = None;
        for _ in 0..3 {
            let d = decide(&limit, tat, 1, now);
            tat = Some(d.new_tat_ns);
        }
        assert!(!decide(&limit, tat, 1, now).allowed);

        for k in 1..=3i64 {
            let later = now + k * limit.emission_interval_ns();
            let mut t = tat;
            let mut allowed = 0;
            loop {
                let d = decide(&limit, t, 1, later);
                if !d.allowed {
                    break;
                }
                allowed += 1;
                t = Some(d.new_tat_ns);
            }
            assert_eq!(allowed, k, "after {} intervals", k);
        }
    }

    #[test]
    fn deny_reports_time_until_all_would_permit() {
        // Two-token bucket, 12h emission interval: the C scenario shape.
        let limit = limit(2, 2, "24h");
        let now = 1_700_000_000 * SECOND;

        let d1 = decide(&limit, None, 1, now);
        let d2 = decide(&limit, Some(d1.new_tat_ns), 1, now);
        let d3 = decide(&limit, Some(d2.new_tat_ns), 1, now);
        assert!(d1.allowed && d2.allowed);
        assert!(!d3.allowed);
        assert_eq!(d3.retry_in, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn refund_restores_prior_state() {
        let limit = limit(5, 5, "5s");
        let now = 1_700_000_000 * SECOND;

        let before = decide(&limit, None, 1, now);
        let spent = decide(&limit, Some(before.new_tat_ns), 2, now);
        let refunded = refund_tat(&limit, spent.new_tat_ns, 2, now);
        assert_eq!(refunded, before.new_tat_ns);
    }

    #[test]
    fn over_refund_clamps_at_full() {
        let limit = limit(2, 2, "2s");
        let now = 1_700_000_000 * SECOND;

        let refunded = refund_tat(&limit, now, 100, now);
        assert_eq!(refunded, now - limit.burst_offset_ns());
        // A full bucket still permits exactly burst requests.
        let d1 = decide(&limit, Some(refunded), 1, now);
        let d2 = decide(&limit, Some(d1.new_tat_ns), 1, now);
        let d3 = decide(&limit, Some(d2.new_tat_ns), 1, now);
        assert!(d1.allowed && d2.allowed && !d3.allowed);
    }

    #[test]
    fn ttl_matches_bucket_drain_time() {
        let limit = limit(2, 2, "2s");
        let now = 1_700_000_000 * SECOND;
        let d = decide(&limit, None, 1, now);
        assert_eq!(d.ttl, Duration::from_secs(1));
    }
}
