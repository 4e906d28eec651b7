use crate::connection::{ConnPool, handle_connection};
use crate::pipeline::Pipeline;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tollgate_core::config::GatewayConfig;
use tollgate_store::SnapshotCache;
use tracing::{error, info};

/// State shared by every worker thread. The snapshot cache is the only
/// mutable piece; everything else is immutable after startup.
pub struct SharedState {
    pub pipeline: Arc<Pipeline>,
    pub snapshots: Arc<SnapshotCache>,
    pub config: Arc<GatewayConfig>,
    /// Gateway-wide in-flight request count (overload shedding).
    pub inflight: Arc<AtomicI64>,
}

impl SharedState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        snapshots: Arc<SnapshotCache>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            snapshots,
            config,
            inflight: Arc::new(AtomicI64::new(0)),
        })
    }
}

/// Spawn monoio worker threads — one per core.
///
/// Each thread runs an independent monoio runtime with its own TCP
/// listener (SO_REUSEPORT via monoio's listener), event loop, and
/// upstream connection pool.
pub fn spawn_workers(
    shared: Arc<SharedState>,
    num_workers: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared.config.proxy.http_addr.to_string();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let addr = listen_addr.clone();

        let handle = std::thread::Builder::new()
            .name(format!("tollgate-worker-{}", worker_id))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, shared, addr));
            })
            .expect("Failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "Workers spawned");
    handles
}

/// Main loop for a single worker thread.
///
/// One ConnPool per thread, shared across this thread's connections via
/// Rc<RefCell>; pre-warmed against the current snapshot's upstreams
/// before accepting traffic.
async fn worker_loop(worker_id: usize, shared: Arc<SharedState>, addr: String) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| {
        panic!("Worker {} failed to bind to {}: {}", worker_id, addr, e);
    });

    info!(worker = worker_id, addr = %addr, "Worker listening");

    let pool_size = shared.config.proxy.keepalive_pool_size;
    let mut pool_inner = ConnPool::new(pool_size);
    let upstream_addrs = shared.snapshots.latest().upstream_addresses();
    let warm_count = (pool_size / 2).max(1);
    pool_inner.warm(&upstream_addrs, warm_count).await;

    let pool = Rc::new(RefCell::new(pool_inner));

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);

                let pipeline = Arc::clone(&shared.pipeline);
                let pool = Rc::clone(&pool);
                let inflight = Arc::clone(&shared.inflight);

                monoio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, peer_addr, pipeline, pool, inflight).await
                    {
                        tracing::debug!(error = %e, "Connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }
}
