use crate::{
    KeyStore, PlanStore, RateLimitStore, RouteStore, StoreError, UpstreamStore, UsageStore,
    UserStore, WindowState,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use tollgate_core::key::ApiKey;
use tollgate_core::plan::Plan;
use tollgate_core::route::Route;
use tollgate_core::upstream::Upstream;
use tollgate_core::usage::{UsageEvent, UsageSummary};
use tollgate_core::user::User;

type ChangeHook = Arc<dyn Fn() + Send + Sync>;

// ── Keys ─────────────────────────────────────────────────────

/// In-memory key store indexed by lookup prefix.
#[derive(Default)]
pub struct MemoryKeyStore {
    by_id: DashMap<String, ApiKey>,
    by_prefix: DashMap<String, Vec<String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: ApiKey) {
        self.by_prefix
            .entry(key.prefix.clone())
            .or_default()
            .retain(|id| id != &key.id);
        self.by_prefix
            .entry(key.prefix.clone())
            .or_default()
            .push(key.id.clone());
        self.by_id.insert(key.id.clone(), key);
    }

    pub fn revoke(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.by_id.get_mut(id) {
            Some(mut key) => {
                key.revoked_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, prefix: &str) -> Result<Vec<ApiKey>, StoreError> {
        let ids = match self.by_prefix.get(prefix) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|k| k.clone()))
            .collect())
    }

    fn update_last_used(&self, id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        match self.by_id.get_mut(id) {
            Some(mut key) => {
                key.last_used = Some(ts);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("key {}", id))),
        }
    }
}

// ── Users ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUserStore {
    by_id: DashMap<String, User>,
    by_email: DashMap<String, String>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.by_email
            .insert(user.email.to_lowercase(), user.id.clone());
        self.by_id.insert(user.id.clone(), user);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl UserStore for MemoryUserStore {
    fn get(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.by_id.get(id).map(|u| u.clone()))
    }

    fn get_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        match self.by_email.get(&email.to_lowercase()) {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }
}

// ── Plans ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPlanStore {
    plans: DashMap<String, Plan>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }
}

impl PlanStore for MemoryPlanStore {
    fn get(&self, id: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self.plans.get(id).map(|p| p.clone()))
    }
}

// ── Routes ───────────────────────────────────────────────────

/// In-memory route table. Every mutation fires the registered change hook
/// so the SnapshotCache can invalidate.
#[derive(Default)]
pub struct MemoryRouteStore {
    routes: DashMap<String, Route>,
    on_change: RwLock<Option<ChangeHook>>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_change(&self, hook: ChangeHook) {
        *self.on_change.write().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    fn notify(&self) {
        if let Ok(guard) = self.on_change.read() {
            if let Some(hook) = guard.as_ref() {
                hook();
            }
        }
    }

    pub fn insert(&self, route: Route) {
        self.routes.insert(route.id.clone(), route);
        self.notify();
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.routes.remove(id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

impl RouteStore for MemoryRouteStore {
    fn list_enabled(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.clone())
            .collect())
    }
}

// ── Upstreams ────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUpstreamStore {
    upstreams: DashMap<String, Upstream>,
    on_change: RwLock<Option<ChangeHook>>,
}

impl MemoryUpstreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_change(&self, hook: ChangeHook) {
        *self.on_change.write().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    fn notify(&self) {
        if let Ok(guard) = self.on_change.read() {
            if let Some(hook) = guard.as_ref() {
                hook();
            }
        }
    }

    pub fn insert(&self, upstream: Upstream) {
        self.upstreams.insert(upstream.id.clone(), upstream);
        self.notify();
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.upstreams.remove(id).is_some();
        if removed {
            self.notify();
        }
        removed
    }
}

impl UpstreamStore for MemoryUpstreamStore {
    fn list_enabled(&self) -> Result<Vec<Upstream>, StoreError> {
        Ok(self
            .upstreams
            .iter()
            .filter(|u| u.enabled)
            .map(|u| u.clone())
            .collect())
    }
}

// ── Rate windows ─────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, WindowState>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn get(&self, key_id: &str) -> Result<Option<WindowState>, StoreError> {
        Ok(self.windows.get(key_id).map(|w| *w))
    }

    fn set(&self, key_id: &str, state: WindowState) -> Result<(), StoreError> {
        self.windows.insert(key_id.to_string(), state);
        Ok(())
    }

    fn incr_window(&self, key_id: &str, window_start: i64) -> Result<u64, StoreError> {
        // The DashMap entry guard holds the shard lock for the whole
        // read-modify-write, which makes admits per key linearizable.
        let mut entry = self
            .windows
            .entry(key_id.to_string())
            .or_insert(WindowState {
                window_start,
                count: 0,
            });
        if entry.window_start != window_start {
            entry.window_start = window_start;
            entry.count = 0;
        }
        entry.count += 1;
        Ok(entry.count)
    }
}

// ── Usage events ─────────────────────────────────────────────

/// Append-only usage store. Summaries scan the event log; this is the
/// test/standalone backend, so volume stays small.
#[derive(Default)]
pub struct MemoryUsageStore {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl UsageStore for MemoryUsageStore {
    fn record_batch(&self, events: &[UsageEvent]) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    fn get_summary(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageSummary, StoreError> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        let mut summary = UsageSummary::default();
        for event in events.iter() {
            if event.user_id == user_id && event.timestamp >= start && event.timestamp < end {
                summary.request_count += 1;
                summary.total_bytes += (event.request_bytes + event.response_bytes) as i64;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::key::{KeyHasher, generate_key};

    fn make_key(id: &str, prefix: &str) -> ApiKey {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "user_id": "u1",
            "prefix": prefix,
            "hash": base64_of(b"x"),
        }))
        .unwrap()
    }

    fn base64_of(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn make_route(id: &str, enabled: bool) -> Route {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "path_pattern": "/v1",
            "upstream_id": "u1",
            "enabled": enabled,
        }))
        .unwrap()
    }

    fn make_event(user_id: &str, ts: &str, bytes: u64) -> UsageEvent {
        serde_json::from_value(serde_json::json!({
            "id": uuid_like(ts, bytes),
            "user_id": user_id,
            "method": "GET",
            "path": "/v1",
            "status_code": 200,
            "response_bytes": bytes,
            "timestamp": ts,
        }))
        .unwrap()
    }

    fn uuid_like(ts: &str, n: u64) -> String {
        format!("{}-{}", ts, n)
    }

    // ── key store ──────────────────────────────────────────────

    #[test]
    fn key_store_groups_by_prefix() {
        let store = MemoryKeyStore::new();
        store.insert(make_key("k1", "tg_AAAABBBB1"));
        store.insert(make_key("k2", "tg_AAAABBBB1"));
        store.insert(make_key("k3", "tg_ZZZZBBBB1"));

        let bucket = store.get("tg_AAAABBBB1").unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(store.get("tg_none").unwrap().is_empty());
    }

    #[test]
    fn key_store_reinsert_does_not_duplicate() {
        let store = MemoryKeyStore::new();
        store.insert(make_key("k1", "tg_AAAABBBB1"));
        store.insert(make_key("k1", "tg_AAAABBBB1"));
        assert_eq!(store.get("tg_AAAABBBB1").unwrap().len(), 1);
    }

    #[test]
    fn key_store_update_last_used() {
        let store = MemoryKeyStore::new();
        store.insert(make_key("k1", "tg_AAAABBBB1"));
        let ts = Utc::now();
        store.update_last_used("k1", ts).unwrap();
        assert_eq!(store.get("tg_AAAABBBB1").unwrap()[0].last_used, Some(ts));
        assert!(store.update_last_used("missing", ts).is_err());
    }

    #[test]
    fn key_store_revoke() {
        let store = MemoryKeyStore::new();
        store.insert(make_key("k1", "tg_AAAABBBB1"));
        assert!(store.revoke("k1", Utc::now()));
        assert!(store.get("tg_AAAABBBB1").unwrap()[0].is_revoked());
        assert!(!store.revoke("missing", Utc::now()));
    }

    #[test]
    fn generated_key_roundtrips_through_store() {
        let generated = generate_key("tg_");
        let store = MemoryKeyStore::new();
        let mut key = make_key("k1", &generated.prefix);
        key.hash = generated.hash.clone();
        store.insert(key);

        let candidates = store.get(&generated.prefix).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(KeyHasher::verify(&candidates[0].hash, &generated.raw));
    }

    // ── user store ─────────────────────────────────────────────

    #[test]
    fn user_store_email_lookup_is_case_insensitive() {
        let store = MemoryUserStore::new();
        store.insert(
            serde_json::from_value(serde_json::json!({
                "id": "u1", "email": "Alice@Example.COM", "plan_id": "free",
            }))
            .unwrap(),
        );
        assert!(store.get_by_email("alice@example.com").unwrap().is_some());
        assert!(store.get_by_email("ALICE@EXAMPLE.COM").unwrap().is_some());
        assert!(store.get_by_email("bob@example.com").unwrap().is_none());
    }

    // ── route store ────────────────────────────────────────────

    #[test]
    fn route_store_lists_only_enabled() {
        let store = MemoryRouteStore::new();
        store.insert(make_route("r1", true));
        store.insert(make_route("r2", false));
        let listed = store.list_enabled().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "r1");
    }

    #[test]
    fn route_store_fires_change_hook() {
        let store = MemoryRouteStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        store.set_on_change(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.insert(make_route("r1", true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        store.remove("r1");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        // Removing a missing route does not notify.
        store.remove("r1");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    // ── rate limit store ───────────────────────────────────────

    #[test]
    fn incr_window_counts_within_window() {
        let store = MemoryRateLimitStore::new();
        assert_eq!(store.incr_window("k1", 600).unwrap(), 1);
        assert_eq!(store.incr_window("k1", 600).unwrap(), 2);
        assert_eq!(store.incr_window("k1", 600).unwrap(), 3);
        // Separate key has its own window.
        assert_eq!(store.incr_window("k2", 600).unwrap(), 1);
    }

    #[test]
    fn incr_window_resets_on_new_window() {
        let store = MemoryRateLimitStore::new();
        store.incr_window("k1", 600).unwrap();
        store.incr_window("k1", 600).unwrap();
        assert_eq!(store.incr_window("k1", 660).unwrap(), 1);
        assert_eq!(
            store.get("k1").unwrap(),
            Some(WindowState {
                window_start: 660,
                count: 1
            })
        );
    }

    #[test]
    fn concurrent_incr_never_loses_counts() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.incr_window("k1", 600).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            store.get("k1").unwrap().map(|w| w.count),
            Some(800),
            "all increments must be observed"
        );
    }

    // ── usage store ────────────────────────────────────────────

    #[test]
    fn usage_summary_filters_by_user_and_period() {
        let store = MemoryUsageStore::new();
        store
            .record_batch(&[
                make_event("u1", "2026-03-05T10:00:00Z", 100),
                make_event("u1", "2026-03-20T10:00:00Z", 50),
                make_event("u2", "2026-03-05T10:00:00Z", 10),
                make_event("u1", "2026-04-01T00:00:00Z", 10),
            ])
            .unwrap();

        let start = "2026-03-01T00:00:00Z".parse().unwrap();
        let end = "2026-04-01T00:00:00Z".parse().unwrap();
        let summary = store.get_summary("u1", start, end).unwrap();
        assert_eq!(summary.request_count, 2);
        assert_eq!(summary.total_bytes, 150);
    }

    #[test]
    fn usage_store_appends_batches() {
        let store = MemoryUsageStore::new();
        store
            .record_batch(&[make_event("u1", "2026-03-05T10:00:00Z", 1)])
            .unwrap();
        store
            .record_batch(&[make_event("u1", "2026-03-06T10:00:00Z", 1)])
            .unwrap();
        assert_eq!(store.len(), 2);
    }
}
