use std::sync::Arc;
use tollgate_core::GatewayError;
use tollgate_store::RateLimitStore;
use tracing::warn;

/// Window length for the fixed-window limiter. Windows are aligned: every
/// window starts at a multiple of 60s, so the contract "at most N admits
/// per aligned window" holds regardless of when traffic arrives.
pub const WINDOW_SECS: i64 = 60;

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Plan has no per-minute limit.
    Unlimited,

    Allowed {
        limit: i64,
        remaining: i64,
        reset_unix: i64,
    },

    Denied {
        limit: i64,
        retry_after_secs: u64,
        reset_unix: i64,
    },
}

/// Per-key fixed-window rate limiter.
///
/// The store's `incr_window` is atomic per key, so concurrent admits for
/// one key observe a total order and the (limit+1)-th admit in a window is
/// always denied.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, fail_open: bool) -> Self {
        Self { store, fail_open }
    }

    pub fn admit(
        &self,
        key_id: &str,
        rate_per_min: i64,
        now_unix: i64,
    ) -> Result<Admission, GatewayError> {
        if rate_per_min <= 0 {
            return Ok(Admission::Unlimited);
        }

        let window_start = now_unix - now_unix.rem_euclid(WINDOW_SECS);
        let reset_unix = window_start + WINDOW_SECS;

        match self.store.incr_window(key_id, window_start) {
            Ok(count) => {
                if count as i64 <= rate_per_min {
                    Ok(Admission::Allowed {
                        limit: rate_per_min,
                        remaining: rate_per_min - count as i64,
                        reset_unix,
                    })
                } else {
                    Ok(Admission::Denied {
                        limit: rate_per_min,
                        retry_after_secs: (reset_unix - now_unix).max(1) as u64,
                        reset_unix,
                    })
                }
            }
            Err(e) if self.fail_open => {
                warn!(key_id = %key_id, error = %e, "Rate-limit store failed, admitting (fail-open)");
                Ok(Admission::Allowed {
                    limit: rate_per_min,
                    remaining: 0,
                    reset_unix,
                })
            }
            Err(e) => Err(GatewayError::StoreUnavailable(e.to_string())),
        }
    }
}
