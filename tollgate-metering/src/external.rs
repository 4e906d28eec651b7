use crate::recorder::UsageRecorder;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tollgate_core::usage::{EventSource, UsageEvent};
use tollgate_store::UserStore;
use tracing::debug;

/// Event types accepted without the `custom.` prefix.
pub const ALLOWED_EVENT_TYPES: &[&str] = &[
    "api.call",
    "job.run",
    "storage.read",
    "storage.write",
    "export.rows",
];

pub const CUSTOM_EVENT_PREFIX: &str = "custom.";

/// How far in the past an event timestamp may lie.
const PAST_WINDOW_DAYS: i64 = 7;

/// Allowed clock skew into the future.
const FUTURE_SKEW_SECS: i64 = 60;

/// Rolling idempotency window for event ids.
const IDEMPOTENCY_WINDOW_HOURS: i64 = 24;

/// One event as submitted by an external metering source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEventInput {
    pub id: String,

    pub user_id: String,

    pub event_type: String,

    #[serde(default)]
    pub resource_id: String,

    #[serde(default)]
    pub resource_type: String,

    #[serde(default)]
    pub source_name: String,

    /// Non-positive values default to 1; negative values are rejected.
    #[serde(default)]
    pub quantity: f64,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-event rejection reason.
#[derive(Debug, Clone, Serialize)]
pub struct EventError {
    pub id: String,
    pub code: &'static str,
    pub message: String,
}

/// Result of a submission: partial success is normal.
#[derive(Debug, Serialize)]
pub struct SubmitOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<EventError>,
}

impl SubmitOutcome {
    /// 202 when anything was accepted, 422 when everything was rejected.
    pub fn status_code(&self) -> u16 {
        if self.accepted > 0 { 202 } else { 422 }
    }
}

struct SeenWindow {
    order: VecDeque<(String, DateTime<Utc>)>,
    ids: HashSet<String>,
}

/// Validates and enqueues externally submitted usage events.
///
/// Duplicate ids inside the rolling idempotency window are rejected (not
/// errored): the response reports them, the batch still succeeds.
pub struct ExternalSubmitter {
    users: Arc<dyn UserStore>,
    recorder: Arc<UsageRecorder>,
    seen: Mutex<SeenWindow>,
}

impl ExternalSubmitter {
    pub fn new(users: Arc<dyn UserStore>, recorder: Arc<UsageRecorder>) -> Self {
        Self {
            users,
            recorder,
            seen: Mutex::new(SeenWindow {
                order: VecDeque::new(),
                ids: HashSet::new(),
            }),
        }
    }

    pub fn submit(&self, events: Vec<ExternalEventInput>, now: DateTime<Utc>) -> SubmitOutcome {
        let mut outcome = SubmitOutcome {
            accepted: 0,
            rejected: 0,
            errors: Vec::new(),
        };

        for input in events {
            match self.validate(&input, now) {
                Ok(event) => {
                    self.mark_seen(&event.id, now);
                    self.recorder.record(event);
                    outcome.accepted += 1;
                }
                Err(error) => {
                    debug!(event_id = %error.id, code = error.code, "External event rejected");
                    outcome.rejected += 1;
                    outcome.errors.push(error);
                }
            }
        }
        outcome
    }

    fn validate(
        &self,
        input: &ExternalEventInput,
        now: DateTime<Utc>,
    ) -> Result<UsageEvent, EventError> {
        let reject = |code: &'static str, message: String| EventError {
            id: input.id.clone(),
            code,
            message,
        };

        if input.id.trim().is_empty() {
            return Err(reject("invalid_id", "event id must not be empty".into()));
        }
        if self.is_duplicate(&input.id, now) {
            return Err(reject(
                "duplicate_event",
                format!("event {} was already submitted", input.id),
            ));
        }

        match self.users.get(&input.user_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(reject(
                    "unknown_user",
                    format!("user {} does not exist", input.user_id),
                ));
            }
            Err(e) => return Err(reject("store_unavailable", e.to_string())),
        }

        let allowed = ALLOWED_EVENT_TYPES.contains(&input.event_type.as_str())
            || input.event_type.starts_with(CUSTOM_EVENT_PREFIX);
        if !allowed {
            return Err(reject(
                "invalid_event_type",
                format!("event type '{}' is not allowed", input.event_type),
            ));
        }

        let oldest = now - ChronoDuration::days(PAST_WINDOW_DAYS);
        let newest = now + ChronoDuration::seconds(FUTURE_SKEW_SECS);
        if input.timestamp < oldest || input.timestamp > newest {
            return Err(reject(
                "timestamp_out_of_range",
                format!(
                    "timestamp must be within [now-{}d, now+{}s]",
                    PAST_WINDOW_DAYS, FUTURE_SKEW_SECS
                ),
            ));
        }

        if input.quantity < 0.0 {
            return Err(reject(
                "invalid_quantity",
                "quantity must not be negative".into(),
            ));
        }
        let quantity = if input.quantity > 0.0 {
            input.quantity
        } else {
            1.0
        };

        Ok(UsageEvent {
            id: input.id.clone(),
            key_id: String::new(),
            user_id: input.user_id.clone(),
            method: String::new(),
            path: String::new(),
            status_code: 0,
            latency_ms: 0,
            request_bytes: 0,
            response_bytes: 0,
            cost_multiplier: 1.0,
            ip: String::new(),
            user_agent: String::new(),
            timestamp: input.timestamp,
            source: EventSource::External,
            event_type: input.event_type.clone(),
            resource_id: input.resource_id.clone(),
            resource_type: input.resource_type.clone(),
            source_name: input.source_name.clone(),
            quantity,
            metadata: input.metadata.clone(),
        })
    }

    fn is_duplicate(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let horizon = now - ChronoDuration::hours(IDEMPOTENCY_WINDOW_HOURS);
        while let Some((old_id, at)) = seen.order.front().cloned() {
            if at >= horizon {
                break;
            }
            seen.order.pop_front();
            seen.ids.remove(&old_id);
        }
        seen.ids.contains(id)
    }

    fn mark_seen(&self, id: &str, now: DateTime<Utc>) {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if seen.ids.insert(id.to_string()) {
            seen.order.push_back((id.to_string(), now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderConfig;
    use std::time::Duration;
    use tollgate_store::{MemoryUsageStore, MemoryUserStore};

    fn now() -> DateTime<Utc> {
        "2026-03-15T12:00:00Z".parse().unwrap()
    }

    fn input(id: &str, user_id: &str) -> ExternalEventInput {
        ExternalEventInput {
            id: id.into(),
            user_id: user_id.into(),
            event_type: "api.call".into(),
            resource_id: String::new(),
            resource_type: String::new(),
            source_name: "billing-agent".into(),
            quantity: 1.0,
            timestamp: now(),
            metadata: serde_json::Value::Null,
        }
    }

    fn setup() -> (Arc<MemoryUsageStore>, Arc<UsageRecorder>, ExternalSubmitter) {
        let users = Arc::new(MemoryUserStore::new());
        users.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "email": "a@b.co", "plan_id": "pro",
            }))
            .unwrap(),
        );
        let store = Arc::new(MemoryUsageStore::new());
        let recorder = UsageRecorder::start(
            store.clone(),
            RecorderConfig {
                flush_interval: Duration::from_millis(20),
                ..RecorderConfig::default()
            },
        );
        let submitter = ExternalSubmitter::new(users, Arc::clone(&recorder));
        (store, recorder, submitter)
    }

    #[test]
    fn accepts_valid_events() {
        let (store, recorder, submitter) = setup();
        let outcome = submitter.submit(vec![input("e1", "u1"), input("e2", "u1")], now());
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.status_code(), 202);

        assert!(recorder.flush());
        assert_eq!(store.len(), 2);
        let persisted = store.events();
        assert_eq!(persisted[0].source, EventSource::External);
        assert_eq!(persisted[0].quantity, 1.0);
    }

    #[test]
    fn duplicate_in_same_batch_is_rejected_not_errored() {
        let (store, recorder, submitter) = setup();
        let outcome = submitter.submit(
            vec![input("e1", "u1"), input("e2", "u1"), input("e1", "u1")],
            now(),
        );
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].id, "e1");
        assert_eq!(outcome.errors[0].code, "duplicate_event");
        assert_eq!(outcome.status_code(), 202);

        assert!(recorder.flush());
        assert_eq!(store.len(), 2, "store receives exactly the accepted events");
    }

    #[test]
    fn duplicate_across_batches_is_rejected() {
        let (_, _, submitter) = setup();
        submitter.submit(vec![input("e1", "u1")], now());
        let outcome = submitter.submit(vec![input("e1", "u1")], now());
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.status_code(), 422);
    }

    #[test]
    fn idempotency_window_expires() {
        let (_, _, submitter) = setup();
        submitter.submit(vec![input("e1", "u1")], now());
        // 25 hours later the id may be reused.
        let later = now() + ChronoDuration::hours(25);
        let mut again = input("e1", "u1");
        again.timestamp = later;
        let outcome = submitter.submit(vec![again], later);
        assert_eq!(outcome.accepted, 1);
    }

    #[test]
    fn unknown_user_is_rejected() {
        let (_, _, submitter) = setup();
        let outcome = submitter.submit(vec![input("e1", "ghost")], now());
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.errors[0].code, "unknown_user");
        assert_eq!(outcome.status_code(), 422);
    }

    #[test]
    fn event_type_allow_list_and_custom_prefix() {
        let (_, _, submitter) = setup();

        let mut custom = input("e1", "u1");
        custom.event_type = "custom.render".into();
        assert_eq!(submitter.submit(vec![custom], now()).accepted, 1);

        let mut bad = input("e2", "u1");
        bad.event_type = "render".into();
        let outcome = submitter.submit(vec![bad], now());
        assert_eq!(outcome.errors[0].code, "invalid_event_type");
    }

    #[test]
    fn timestamp_window_is_enforced() {
        let (_, _, submitter) = setup();

        let mut stale = input("e1", "u1");
        stale.timestamp = now() - ChronoDuration::days(8);
        assert_eq!(
            submitter.submit(vec![stale], now()).errors[0].code,
            "timestamp_out_of_range"
        );

        let mut future = input("e2", "u1");
        future.timestamp = now() + ChronoDuration::seconds(120);
        assert_eq!(
            submitter.submit(vec![future], now()).errors[0].code,
            "timestamp_out_of_range"
        );

        let mut skewed = input("e3", "u1");
        skewed.timestamp = now() + ChronoDuration::seconds(30);
        assert_eq!(submitter.submit(vec![skewed], now()).accepted, 1);
    }

    #[test]
    fn quantity_rules() {
        let (store, recorder, submitter) = setup();

        let mut negative = input("e1", "u1");
        negative.quantity = -2.0;
        assert_eq!(
            submitter.submit(vec![negative], now()).errors[0].code,
            "invalid_quantity"
        );

        let mut zero = input("e2", "u1");
        zero.quantity = 0.0;
        assert_eq!(submitter.submit(vec![zero], now()).accepted, 1);

        assert!(recorder.flush());
        assert_eq!(store.events()[0].quantity, 1.0, "non-positive quantity defaults to 1");
    }

    #[test]
    fn empty_id_is_rejected() {
        let (_, _, submitter) = setup();
        let outcome = submitter.submit(vec![input("  ", "u1")], now());
        assert_eq!(outcome.errors[0].code, "invalid_id");
    }

    #[test]
    fn all_rejected_maps_to_422() {
        let (_, _, submitter) = setup();
        let outcome = submitter.submit(vec![input("e1", "ghost"), input("", "u1")], now());
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected, 2);
        assert_eq!(outcome.status_code(), 422);
    }
}
