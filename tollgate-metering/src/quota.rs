use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate_core::GatewayError;
use tollgate_core::plan::Plan;
use tollgate_core::usage::{QuotaStatus, UsageSummary};
use tollgate_store::UsageStore;

/// Outcome of a monthly-quota check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaDecision {
    Allow,

    /// Past the warning threshold (or past a soft quota when `exceeded`).
    /// The pipeline annotates the response but admits the request.
    Warn { percent: f64, exceeded: bool },

    /// Hard quota reached; the request is refused.
    Block { percent: f64 },
}

/// UTC calendar-month bounds for `now`: [first instant of this month,
/// first instant of next month).
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (year, month) = (now.year(), now.month());
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap();
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).unwrap();
    (start, end)
}

struct CachedSummary {
    summary: UsageSummary,
    fetched: Instant,
}

/// Monthly quota checker over `UsageStore::get_summary`.
///
/// Summaries are cached per user with a TTL (default 60s, configurable but
/// never meant to exceed 60s): a user can overshoot a hard quota by at most
/// one TTL's worth of traffic, which billing absorbs.
pub struct QuotaChecker {
    usage: Arc<dyn UsageStore>,
    cache: DashMap<String, CachedSummary>,
    ttl: Duration,
    warn_percent: f64,
}

impl QuotaChecker {
    pub fn new(usage: Arc<dyn UsageStore>, ttl: Duration, warn_percent: f64) -> Self {
        Self {
            usage,
            cache: DashMap::new(),
            ttl,
            warn_percent,
        }
    }

    pub fn check(
        &self,
        user_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, GatewayError> {
        if plan.is_quota_unlimited() {
            return Ok(QuotaDecision::Allow);
        }

        let summary = self.summary(user_id, now)?;
        let status = QuotaStatus::from_summary(&summary, plan);

        if status.is_over {
            if plan.hard_quota {
                Ok(QuotaDecision::Block {
                    percent: status.percent,
                })
            } else {
                Ok(QuotaDecision::Warn {
                    percent: status.percent,
                    exceeded: true,
                })
            }
        } else if status.percent >= self.warn_percent {
            Ok(QuotaDecision::Warn {
                percent: status.percent,
                exceeded: false,
            })
        } else {
            Ok(QuotaDecision::Allow)
        }
    }

    fn summary(&self, user_id: &str, now: DateTime<Utc>) -> Result<UsageSummary, GatewayError> {
        if let Some(cached) = self.cache.get(user_id) {
            if cached.fetched.elapsed() < self.ttl {
                return Ok(cached.summary);
            }
        }

        let (start, end) = month_bounds(now);
        let summary = self
            .usage
            .get_summary(user_id, start, end)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        self.cache.insert(
            user_id.to_string(),
            CachedSummary {
                summary,
                fetched: Instant::now(),
            },
        );
        Ok(summary)
    }
}
