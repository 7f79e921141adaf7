//! Fixed-window rate limiting per `(user, component)`.
//!
//! One bucket, two call sites: the executor consults the limiter once per
//! invocation pre-flight, and the HTTP host function consults the same
//! bucket once per outbound request. A burst of host function calls
//! therefore consumes from the same budget as outer invocations.
//!
//! # Algorithm
//!
//! Fixed window: the first admitted request in a window stamps the window
//! expiry at `now + window`. Each admitted request decrements the
//! remaining quota; at zero, requests are rejected with
//! `retry_after = window_end - now`. When `now >= window_end` the count
//! resets. A policy without a rate limit is unlimited.
//!
//! # Coordination
//!
//! The bucket map is process-wide and sharded per key (`DashMap`), so two
//! executions for different `(user, component)` pairs never contend. No
//! global lock is held on the hot path.

// Layer 1: Standard library imports
use std::time::{Duration, Instant};

// Layer 2: Third-party crate imports
use dashmap::DashMap;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::reference::ComponentReference;

/// Outcome of an admitted rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The policy has no rate limit.
    Unlimited,
    /// Admitted; `remaining` requests left in the current window.
    Allowed {
        /// Requests left in the current window after this one.
        remaining: u32,
    },
}

/// Snapshot of one bucket for monitoring and the `status` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    /// Requests consumed in the current window.
    pub used: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// End of the current window; `None` when no window is active.
    pub window_end: Option<Instant>,
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_end: Instant,
}

type BucketKey = (String, String);

/// Process-wide fixed-window rate limiter.
///
/// # Examples
///
/// ```
/// use cyfr_sandbox::core::policy::{Policy, RateLimit};
/// use cyfr_sandbox::core::reference::ComponentReference;
/// use cyfr_sandbox::security::rate_limit::RateLimiter;
///
/// let limiter = RateLimiter::new();
/// let reference = ComponentReference::parse("c:weather.fetcher:1.0.0").unwrap();
/// let policy = Policy {
///     rate_limit: Some(RateLimit { requests: 1, window: "1m".to_owned() }),
///     ..Policy::default()
/// };
///
/// assert!(limiter.check("user-1", &reference, &policy).is_ok());
/// assert!(limiter.check("user-1", &reference, &policy).is_err());
/// ```
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for `(user, reference)` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::RateLimited` with the time until the window
    /// ends when the quota is exhausted, or `SandboxError::InvalidRequest`
    /// when the policy's window literal is malformed.
    pub fn check(
        &self,
        user_id: &str,
        reference: &ComponentReference,
        policy: &Policy,
    ) -> SandboxResult<RateDecision> {
        let Some(limit) = &policy.rate_limit else {
            return Ok(RateDecision::Unlimited);
        };
        let window = limit.window_duration()?;
        let now = Instant::now();
        let key = Self::key(user_id, reference);

        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            window_end: now + window,
        });

        if now >= bucket.window_end {
            bucket.count = 0;
            bucket.window_end = now + window;
        }

        if bucket.count >= limit.requests {
            let retry_after = bucket.window_end.saturating_duration_since(now);
            return Err(SandboxError::RateLimited {
                retry_after_ms: duration_ms_at_least_one(retry_after),
            });
        }

        bucket.count += 1;
        Ok(RateDecision::Allowed {
            remaining: limit.requests - bucket.count,
        })
    }

    /// Drop the bucket for `(user, reference)`; the next `status` reports
    /// `used = 0`.
    pub fn reset(&self, user_id: &str, reference: &ComponentReference) {
        self.buckets.remove(&Self::key(user_id, reference));
    }

    /// Current window usage for `(user, reference)` under `policy`.
    ///
    /// Does not consume quota. A policy without a rate limit reports
    /// `used = 0`, `remaining = u32::MAX`, no window.
    pub fn status(
        &self,
        user_id: &str,
        reference: &ComponentReference,
        policy: &Policy,
    ) -> SandboxResult<RateStatus> {
        let Some(limit) = &policy.rate_limit else {
            return Ok(RateStatus {
                used: 0,
                remaining: u32::MAX,
                window_end: None,
            });
        };
        // Validate the literal even when the bucket is cold.
        limit.window_duration()?;

        let now = Instant::now();
        let used = self
            .buckets
            .get(&Self::key(user_id, reference))
            .filter(|bucket| now < bucket.window_end)
            .map(|bucket| (bucket.count, bucket.window_end));

        Ok(match used {
            Some((count, window_end)) => RateStatus {
                used: count,
                remaining: limit.requests.saturating_sub(count),
                window_end: Some(window_end),
            },
            None => RateStatus {
                used: 0,
                remaining: limit.requests,
                window_end: None,
            },
        })
    }

    fn key(user_id: &str, reference: &ComponentReference) -> BucketKey {
        (user_id.to_owned(), reference.to_string())
    }
}

/// Round a duration up to whole milliseconds, never reporting zero for a
/// non-expired window.
fn duration_ms_at_least_one(duration: Duration) -> u64 {
    let ms = duration.as_millis() as u64;
    ms.max(1)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::core::policy::RateLimit;

    fn reference() -> ComponentReference {
        ComponentReference::parse("catalyst:weather.fetcher:1.0.0").unwrap()
    }

    fn limited(requests: u32, window: &str) -> Policy {
        Policy {
            rate_limit: Some(RateLimit {
                requests,
                window: window.to_owned(),
            }),
            ..Policy::default()
        }
    }

    #[test]
    fn test_no_rate_limit_is_unlimited() {
        let limiter = RateLimiter::new();
        let decision = limiter
            .check("user-1", &reference(), &Policy::default())
            .unwrap();
        assert_eq!(decision, RateDecision::Unlimited);
    }

    #[test]
    fn test_quota_exhaustion_reports_retry_after_within_window() {
        let limiter = RateLimiter::new();
        let policy = limited(1, "1m");

        assert!(limiter.check("user-1", &reference(), &policy).is_ok());
        let err = limiter.check("user-1", &reference(), &policy).unwrap_err();
        match err {
            SandboxError::RateLimited { retry_after_ms } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let limiter = RateLimiter::new();
        let policy = limited(1, "50ms");

        assert!(limiter.check("user-1", &reference(), &policy).is_ok());
        assert!(limiter.check("user-1", &reference(), &policy).is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("user-1", &reference(), &policy).is_ok());
    }

    #[test]
    fn test_buckets_are_per_user_and_component() {
        let limiter = RateLimiter::new();
        let policy = limited(1, "1m");
        let other_ref = ComponentReference::parse("catalyst:mail.sender:1.0.0").unwrap();

        assert!(limiter.check("user-1", &reference(), &policy).is_ok());
        // Different user, same component
        assert!(limiter.check("user-2", &reference(), &policy).is_ok());
        // Same user, different component
        assert!(limiter.check("user-1", &other_ref, &policy).is_ok());
        // Original pair is exhausted
        assert!(limiter.check("user-1", &reference(), &policy).is_err());
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = RateLimiter::new();
        let policy = limited(3, "1m");

        for expected in [2u32, 1, 0] {
            let decision = limiter.check("user-1", &reference(), &policy).unwrap();
            assert_eq!(decision, RateDecision::Allowed { remaining: expected });
        }
    }

    #[test]
    fn test_status_after_reset_reports_zero_used() {
        let limiter = RateLimiter::new();
        let policy = limited(5, "1m");

        limiter.check("user-1", &reference(), &policy).unwrap();
        limiter.check("user-1", &reference(), &policy).unwrap();
        let status = limiter.status("user-1", &reference(), &policy).unwrap();
        assert_eq!(status.used, 2);
        assert_eq!(status.remaining, 3);
        assert!(status.window_end.is_some());

        limiter.reset("user-1", &reference());
        let status = limiter.status("user-1", &reference(), &policy).unwrap();
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, 5);
        assert!(status.window_end.is_none());
    }

    #[test]
    fn test_malformed_window_is_rejected() {
        let limiter = RateLimiter::new();
        let policy = limited(5, "1fortnight");
        let err = limiter.check("user-1", &reference(), &policy).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
