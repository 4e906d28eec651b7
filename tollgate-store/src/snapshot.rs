use crate::{RouteStore, StoreError, UpstreamStore};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tollgate_core::router::{CompileError, Snapshot};
use tracing::info;

/// Why a snapshot rebuild failed. The previous snapshot stays installed.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Lock-free read path over the compiled route/upstream view.
///
/// Readers call `current()`; when nothing is stale that is a single atomic
/// load. `invalidate()` marks the view stale, and the next `current()`
/// rebuilds from the stores. Rebuilds are serialized under one mutex: a
/// concurrent reader blocks briefly and reuses the winner's result.
///
/// A failed rebuild surfaces its error to the triggering reader only;
/// the old snapshot stays installed and later readers use it untouched
/// until the next `invalidate()`.
pub struct SnapshotCache {
    current: ArcSwap<Snapshot>,
    stale: AtomicBool,
    revision: AtomicU64,
    rebuild: Mutex<()>,
    routes: Arc<dyn RouteStore>,
    upstreams: Arc<dyn UpstreamStore>,
}

impl SnapshotCache {
    /// Build the initial snapshot from the stores.
    pub fn new(
        routes: Arc<dyn RouteStore>,
        upstreams: Arc<dyn UpstreamStore>,
    ) -> Result<Arc<Self>, SnapshotError> {
        let initial = Snapshot::build(1, routes.list_enabled()?, upstreams.list_enabled()?)?;
        info!(
            revision = initial.revision,
            routes = initial.route_count(),
            upstreams = initial.upstream_count(),
            "Snapshot built"
        );
        Ok(Arc::new(Self {
            current: ArcSwap::new(Arc::new(initial)),
            stale: AtomicBool::new(false),
            revision: AtomicU64::new(1),
            rebuild: Mutex::new(()),
            routes,
            upstreams,
        }))
    }

    /// Mark the snapshot stale. Cheap; callable from any thread.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// The installed snapshot, without attempting a rebuild.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// The up-to-date snapshot, rebuilding first if stale.
    pub fn current(&self) -> Result<Arc<Snapshot>, SnapshotError> {
        if !self.stale.load(Ordering::Acquire) {
            return Ok(self.current.load_full());
        }

        let _guard = self.rebuild.lock().unwrap_or_else(|p| p.into_inner());
        // Re-check: the rebuild may have happened while we waited.
        if !self.stale.load(Ordering::Acquire) {
            return Ok(self.current.load_full());
        }

        // Clear the flag before building so the error surfaces exactly once;
        // a mutation arriving mid-build re-marks it.
        self.stale.store(false, Ordering::Release);

        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let routes = self.routes.list_enabled()?;
        let upstreams = self.upstreams.list_enabled()?;
        let next = Arc::new(Snapshot::build(revision, routes, upstreams)?);
        info!(
            revision = next.revision,
            routes = next.route_count(),
            upstreams = next.upstream_count(),
            "Snapshot rebuilt"
        );
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }
}
