use serde::{Deserialize, Serialize};

/// Billing plan limits consumed by the rate limiter and quota checker.
/// Pricing itself is external; the gateway only needs the ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Admits per key per aligned 60s window. `<= 0` = unlimited.
    #[serde(default)]
    pub rate_limit_per_minute: i64,

    /// Requests per calendar month (UTC). `<= 0` = unlimited.
    #[serde(default)]
    pub requests_per_month: i64,

    /// Hard quota blocks at the limit; soft quota warns and admits
    /// (overage settled by billing).
    #[serde(default)]
    pub hard_quota: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Plan {
    pub fn is_rate_unlimited(&self) -> bool {
        self.rate_limit_per_minute <= 0
    }

    pub fn is_quota_unlimited(&self) -> bool {
        self.requests_per_month <= 0
    }
}
