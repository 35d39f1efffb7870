//! Per-principal token-bucket rate limiting.
//!
//! Buckets are keyed by token fingerprint, refilled lazily on access, and
//! hold at most `rpm` tokens. Anonymous principals and principals without a
//! configured limit are exempt. State is in-memory only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use relay_core::error::RouterError;
use relay_core::principal::Principal;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated_at: Instant,
    capacity: f64,
    refill_per_ms: f64,
}

impl Bucket {
    fn new(rpm: u32) -> Self {
        let capacity = f64::from(rpm.max(1));
        Self {
            tokens: capacity,
            updated_at: Instant::now(),
            capacity,
            refill_per_ms: capacity / 60_000.0,
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduct one token for a protected operation, or refuse with a
    /// retry-after hint.
    pub fn consume(&self, principal: &Principal) -> Result<(), RouterError> {
        let Some(rpm) = principal.rate_limit_rpm() else {
            return Ok(());
        };
        let Some(fingerprint) = principal.fingerprint() else {
            return Ok(());
        };

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets
            .entry(fingerprint.to_string())
            .or_insert_with(|| Bucket::new(rpm));

        // Track config changes: a reloaded rpm resizes the bucket in place.
        let capacity = f64::from(rpm.max(1));
        if (bucket.capacity - capacity).abs() > f64::EPSILON {
            bucket.capacity = capacity;
            bucket.refill_per_ms = capacity / 60_000.0;
            bucket.tokens = bucket.tokens.min(capacity);
        }

        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.updated_at).as_secs_f64() * 1_000.0;
        bucket.updated_at = now;
        bucket.tokens = (bucket.tokens + elapsed_ms * bucket.refill_per_ms).min(bucket.capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / bucket.refill_per_ms / 1_000.0).ceil() as u64;
            Err(RouterError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::principal::{Allowlist, token_fingerprint};

    fn limited_principal(rpm: Option<u32>) -> Principal {
        Principal::Token {
            fingerprint: token_fingerprint("dev-token"),
            project_id: None,
            allowed_upstreams: Allowlist::All,
            allowed_tags: Allowlist::All,
            rate_limit_rpm: rpm,
        }
    }

    #[test]
    fn anonymous_is_never_limited() {
        let limiter = RateLimiter::new();
        for _ in 0..1_000 {
            limiter.consume(&Principal::Anonymous).unwrap();
        }
    }

    #[test]
    fn unset_limit_is_never_limited() {
        let limiter = RateLimiter::new();
        let principal = limited_principal(None);
        for _ in 0..1_000 {
            limiter.consume(&principal).unwrap();
        }
    }

    #[test]
    fn second_call_at_rpm_one_is_refused_with_hint() {
        let limiter = RateLimiter::new();
        let principal = limited_principal(Some(1));

        limiter.consume(&principal).unwrap();
        let err = limiter.consume(&principal).unwrap_err();
        match err {
            RouterError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
                assert!(retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {other}"),
        }
    }

    #[test]
    fn burst_up_to_capacity_then_refused() {
        let limiter = RateLimiter::new();
        let principal = limited_principal(Some(5));

        for _ in 0..5 {
            limiter.consume(&principal).unwrap();
        }
        assert!(limiter.consume(&principal).is_err());
    }

    #[test]
    fn buckets_are_isolated_per_token() {
        let limiter = RateLimiter::new();
        let first = limited_principal(Some(1));
        let second = Principal::Token {
            fingerprint: token_fingerprint("other-token"),
            project_id: None,
            allowed_upstreams: Allowlist::All,
            allowed_tags: Allowlist::All,
            rate_limit_rpm: Some(1),
        };

        limiter.consume(&first).unwrap();
        assert!(limiter.consume(&first).is_err());
        limiter.consume(&second).unwrap();
    }

    #[test]
    fn reloaded_rpm_resizes_bucket() {
        let limiter = RateLimiter::new();
        let small = limited_principal(Some(1));
        limiter.consume(&small).unwrap();
        assert!(limiter.consume(&small).is_err());

        // Same token, raised limit: capacity grows but tokens refill over
        // time rather than resetting.
        let raised = limited_principal(Some(600));
        // 600 rpm refills 10 tokens per second, so this succeeds quickly.
        std::thread::sleep(std::time::Duration::from_millis(200));
        limiter.consume(&raised).unwrap();
    }
}
