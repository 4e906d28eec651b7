use crate::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a usage event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    #[default]
    Proxy,
    External,
}

/// One metered call. Proxy events are produced by the pipeline for every
/// response it emits (including errors and cancellations); external events
/// arrive through the submission surface. Events are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,

    #[serde(default)]
    pub key_id: String,

    #[serde(default)]
    pub user_id: String,

    pub method: String,

    pub path: String,

    pub status_code: u16,

    #[serde(default)]
    pub latency_ms: u64,

    #[serde(default)]
    pub request_bytes: u64,

    #[serde(default)]
    pub response_bytes: u64,

    #[serde(default = "default_multiplier")]
    pub cost_multiplier: f64,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub user_agent: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub source: EventSource,

    // External-only attributes; empty/1 for proxy events.
    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub resource_id: String,

    #[serde(default)]
    pub resource_type: String,

    #[serde(default)]
    pub source_name: String,

    #[serde(default = "default_quantity")]
    pub quantity: f64,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_quantity() -> f64 {
    1.0
}

/// Aggregate usage over a billing period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub request_count: i64,
    pub total_bytes: i64,
}

/// Usage measured against a plan's monthly ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub requests_used: i64,
    pub requests_limit: i64,
    pub percent: f64,
    pub is_over: bool,
    pub overage_count: i64,
}

impl QuotaStatus {
    pub fn from_summary(summary: &UsageSummary, plan: &Plan) -> Self {
        let used = summary.request_count;
        let limit = plan.requests_per_month;
        if plan.is_quota_unlimited() {
            return Self {
                requests_used: used,
                requests_limit: 0,
                percent: 0.0,
                is_over: false,
                overage_count: 0,
            };
        }
        let percent = 100.0 * used as f64 / limit as f64;
        Self {
            requests_used: used,
            requests_limit: limit,
            percent,
            is_over: used >= limit,
            overage_count: (used - limit).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(limit: i64) -> Plan {
        serde_json::from_value(serde_json::json!({
            "id": "p1",
            "requests_per_month": limit,
        }))
        .unwrap()
    }

    #[test]
    fn unlimited_plan_is_never_over() {
        let status = QuotaStatus::from_summary(
            &UsageSummary {
                request_count: 1_000_000,
                total_bytes: 0,
            },
            &plan(0),
        );
        assert!(!status.is_over);
        assert_eq!(status.percent, 0.0);
        assert_eq!(status.overage_count, 0);
    }

    #[test]
    fn percent_and_overage() {
        let status = QuotaStatus::from_summary(
            &UsageSummary {
                request_count: 80,
                total_bytes: 0,
            },
            &plan(100),
        );
        assert_eq!(status.percent, 80.0);
        assert!(!status.is_over);

        let status = QuotaStatus::from_summary(
            &UsageSummary {
                request_count: 130,
                total_bytes: 0,
            },
            &plan(100),
        );
        assert!(status.is_over);
        assert_eq!(status.overage_count, 30);
    }

    #[test]
    fn exactly_at_limit_is_over() {
        let status = QuotaStatus::from_summary(
            &UsageSummary {
                request_count: 100,
                total_bytes: 0,
            },
            &plan(100),
        );
        assert!(status.is_over);
        assert_eq!(status.overage_count, 0);
    }

    #[test]
    fn proxy_event_defaults() {
        let event: UsageEvent = serde_json::from_value(serde_json::json!({
            "id": "e1",
            "method": "GET",
            "path": "/v1/echo",
            "status_code": 200,
            "timestamp": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(event.source, EventSource::Proxy);
        assert_eq!(event.quantity, 1.0);
        assert_eq!(event.cost_multiplier, 1.0);
        assert!(event.event_type.is_empty());
    }
}
