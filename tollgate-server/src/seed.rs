use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tollgate_core::key::ApiKey;
use tollgate_core::plan::Plan;
use tollgate_core::route::Route;
use tollgate_core::upstream::Upstream;
use tollgate_core::user::User;
use tollgate_store::{
    MemoryKeyStore, MemoryPlanStore, MemoryRouteStore, MemoryUpstreamStore, MemoryUserStore,
};
use tracing::info;

/// Seed-state file layout: the standalone deployment's source of truth for
/// plans, users, keys (prefix + hash only; never raw secrets), routes, and
/// upstreams.
#[derive(Debug, Default, Deserialize)]
pub struct SeedState {
    #[serde(default)]
    pub plans: Vec<Plan>,

    #[serde(default)]
    pub users: Vec<User>,

    #[serde(default)]
    pub keys: Vec<ApiKey>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub upstreams: Vec<Upstream>,
}

impl SeedState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

pub struct Stores {
    pub keys: Arc<MemoryKeyStore>,
    pub users: Arc<MemoryUserStore>,
    pub plans: Arc<MemoryPlanStore>,
    pub routes: Arc<MemoryRouteStore>,
    pub upstreams: Arc<MemoryUpstreamStore>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(MemoryKeyStore::new()),
            users: Arc::new(MemoryUserStore::new()),
            plans: Arc::new(MemoryPlanStore::new()),
            routes: Arc::new(MemoryRouteStore::new()),
            upstreams: Arc::new(MemoryUpstreamStore::new()),
        }
    }

    /// Populate the stores from a seed state.
    pub fn apply(&self, state: SeedState) {
        for plan in state.plans {
            self.plans.insert(plan);
        }
        for user in state.users {
            self.users.insert(user);
        }
        for key in state.keys {
            self.keys.insert(key);
        }
        for upstream in state.upstreams {
            self.upstreams.insert(upstream);
        }
        for route in state.routes {
            self.routes.insert(route);
        }
        info!(
            keys = self.keys.len(),
            users = self.users.len(),
            routes = self.routes.len(),
            "Seed state applied"
        );
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_store::{KeyStore as _, RouteStore as _, UpstreamStore as _, UserStore as _};

    const SAMPLE: &str = r#"
plans:
  - id: free
    name: Free
    rate_limit_per_minute: 60
    requests_per_month: 10000
    hard_quota: true
users:
  - id: u1
    email: dev@example.com
    plan_id: free
keys:
  - id: k1
    user_id: u1
    prefix: tg_AAAABBBB1
    hash: "3q2+7w=="
upstreams:
  - id: echo
    base_url: http://127.0.0.1:3001
routes:
  - id: r1
    path_pattern: /v1/echo
    upstream_id: echo
"#;

    #[test]
    fn seed_state_parses_and_applies() {
        let state: SeedState = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(state.plans.len(), 1);
        assert_eq!(state.routes.len(), 1);

        let stores = Stores::new();
        stores.apply(state);

        assert_eq!(stores.keys.get("tg_AAAABBBB1").unwrap().len(), 1);
        assert!(stores.users.get_by_email("DEV@example.com").unwrap().is_some());
        assert_eq!(stores.routes.list_enabled().unwrap().len(), 1);
        assert_eq!(stores.upstreams.list_enabled().unwrap().len(), 1);
    }

    #[test]
    fn empty_seed_is_valid() {
        let state: SeedState = serde_yaml::from_str("{}").unwrap();
        let stores = Stores::new();
        stores.apply(state);
        assert!(stores.keys.is_empty());
    }
}
