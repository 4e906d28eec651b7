pub mod memory;
pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_core::key::ApiKey;
use tollgate_core::plan::Plan;
use tollgate_core::route::Route;
use tollgate_core::upstream::Upstream;
use tollgate_core::usage::{UsageEvent, UsageSummary};
use tollgate_core::user::User;

pub use memory::{
    MemoryKeyStore, MemoryPlanStore, MemoryRateLimitStore, MemoryRouteStore, MemoryUpstreamStore,
    MemoryUsageStore, MemoryUserStore,
};
pub use snapshot::{SnapshotCache, SnapshotError};

/// Typed store failure. The pipeline maps `Unavailable` on the hot path to
/// 503 `store_unavailable`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid data: {0}")]
    Invalid(String),
}

/// Per-key fixed-window rate state. `window_start` is aligned to 60s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub window_start: i64,
    pub count: u64,
}

// ── Store contracts consumed by the core ─────────────────────
//
// One implementation per deployment, injected at construction. The bundled
// implementations are in-process (DashMap-backed); a remote backend plugs
// in behind a watcher that keeps the local data fresh, so the traits stay
// synchronous on the hot path.

pub trait KeyStore: Send + Sync {
    /// All keys sharing a 12-char lookup prefix.
    fn get(&self, prefix: &str) -> Result<Vec<ApiKey>, StoreError>;

    /// Best-effort timestamp update; failures never fail a request.
    fn update_last_used(&self, id: &str, ts: DateTime<Utc>) -> Result<(), StoreError>;
}

pub trait UserStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Case-insensitive email lookup.
    fn get_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
}

pub trait PlanStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Plan>, StoreError>;
}

pub trait RouteStore: Send + Sync {
    /// Read by the SnapshotCache on rebuild.
    fn list_enabled(&self) -> Result<Vec<Route>, StoreError>;
}

pub trait UpstreamStore: Send + Sync {
    fn list_enabled(&self) -> Result<Vec<Upstream>, StoreError>;
}

pub trait RateLimitStore: Send + Sync {
    fn get(&self, key_id: &str) -> Result<Option<WindowState>, StoreError>;

    fn set(&self, key_id: &str, state: WindowState) -> Result<(), StoreError>;

    /// Atomic read-modify-write for one key: reset the window if
    /// `window_start` moved, increment, and return the new count.
    /// Admits for a given key observe a total order.
    fn incr_window(&self, key_id: &str, window_start: i64) -> Result<u64, StoreError>;
}

pub trait UsageStore: Send + Sync {
    fn record_batch(&self, events: &[UsageEvent]) -> Result<(), StoreError>;

    fn get_summary(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageSummary, StoreError>;
}
