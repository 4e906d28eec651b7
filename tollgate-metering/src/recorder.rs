use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tollgate_core::usage::UsageEvent;
use tollgate_store::UsageStore;
use tracing::{debug, warn};

/// Tuning for the recorder's ring and flusher.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Ring capacity; overflow drops the oldest buffered event.
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Attempts per batch before it is dropped and counted.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Drain deadline honored by `close()`.
    pub close_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_attempts: 5,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters exposed for observability. `dropped` covers both ring
/// overflow and batches abandoned after retry exhaustion
/// (`usage_events_dropped` on the wire).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderStats {
    pub buffered: usize,
    pub flushed: u64,
    pub dropped: u64,
    pub retries: u64,
}

enum Wake {
    Batch,
    Flush(Sender<()>),
    Close(Sender<()>),
}

struct Shared {
    buf: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
    batch_size: usize,
    flushed: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

/// Non-blocking usage-event sink.
///
/// `record` appends to a bounded in-memory ring and never blocks the
/// request path. A dedicated flusher thread persists batches every
/// `flush_interval`, or as soon as `batch_size` events are buffered.
/// Failed batches retry with exponential backoff and jitter; exhausted
/// batches are dropped and counted. Enqueue order is preserved (single
/// ring, single flusher), so per-key event order survives to the store.
pub struct UsageRecorder {
    shared: Arc<Shared>,
    wake_tx: Sender<Wake>,
    worker: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl UsageRecorder {
    pub fn start(store: Arc<dyn UsageStore>, config: RecorderConfig) -> Arc<Self> {
        let shared = Arc::new(Shared {
            buf: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            capacity: config.capacity.max(1),
            batch_size: config.batch_size.max(1),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });

        let (wake_tx, wake_rx) = bounded(64);
        let worker_shared = Arc::clone(&shared);
        let close_timeout = config.close_timeout;
        let handle = std::thread::Builder::new()
            .name("tollgate-usage-flusher".to_string())
            .spawn(move || worker_loop(worker_shared, store, config, wake_rx))
            .expect("failed to spawn usage flusher thread");

        Arc::new(Self {
            shared,
            wake_tx,
            worker: Mutex::new(Some(handle)),
            close_timeout,
        })
    }

    /// Enqueue one event. Never blocks; on a full ring the oldest buffered
    /// event is dropped and counted.
    pub fn record(&self, event: UsageEvent) {
        let buffered = {
            let mut buf = self.shared.buf.lock().unwrap_or_else(|p| p.into_inner());
            if buf.len() >= self.shared.capacity {
                buf.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event);
            buf.len()
        };
        if buffered >= self.shared.batch_size {
            // Queue full just means a wakeup is already pending.
            let _ = self.wake_tx.try_send(Wake::Batch);
        }
    }

    /// Force an immediate flush and wait for it to finish.
    pub fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.wake_tx.send(Wake::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(self.close_timeout).is_ok()
    }

    /// Stop the flusher, draining the buffer within the close deadline.
    pub fn close(&self) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.wake_tx.send(Wake::Close(ack_tx)).is_err() {
            return false;
        }
        let drained = ack_rx.recv_timeout(self.close_timeout).is_ok();
        if drained {
            if let Some(handle) = self
                .worker
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
            {
                let _ = handle.join();
            }
        }
        drained
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            buffered: self
                .shared
                .buf
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
            flushed: self.shared.flushed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    store: Arc<dyn UsageStore>,
    config: RecorderConfig,
    wake_rx: Receiver<Wake>,
) {
    loop {
        match wake_rx.recv_timeout(config.flush_interval) {
            Ok(Wake::Batch) | Err(RecvTimeoutError::Timeout) => {
                flush_all(&shared, &*store, &config, None);
            }
            Ok(Wake::Flush(ack)) => {
                flush_all(&shared, &*store, &config, None);
                let _ = ack.send(());
            }
            Ok(Wake::Close(ack)) => {
                let deadline = Instant::now() + config.close_timeout;
                flush_all(&shared, &*store, &config, Some(deadline));
                let _ = ack.send(());
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_all(&shared, &*store, &config, None);
                return;
            }
        }
    }
}

/// Drain the ring in batches until empty (or the deadline passes).
fn flush_all(
    shared: &Shared,
    store: &dyn UsageStore,
    config: &RecorderConfig,
    deadline: Option<Instant>,
) {
    loop {
        let batch: Vec<UsageEvent> = {
            let mut buf = shared.buf.lock().unwrap_or_else(|p| p.into_inner());
            let take = buf.len().min(shared.batch_size);
            buf.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        send_with_retry(shared, store, batch, config, deadline);
        if let Some(d) = deadline {
            if Instant::now() >= d {
                let remaining = shared.buf.lock().unwrap_or_else(|p| p.into_inner()).len();
                if remaining > 0 {
                    shared.dropped.fetch_add(remaining as u64, Ordering::Relaxed);
                    warn!(remaining, "Close deadline reached, dropping buffered usage events");
                }
                return;
            }
        }
    }
}

fn send_with_retry(
    shared: &Shared,
    store: &dyn UsageStore,
    batch: Vec<UsageEvent>,
    config: &RecorderConfig,
    deadline: Option<Instant>,
) {
    let mut attempt: u32 = 0;
    loop {
        match store.record_batch(&batch) {
            Ok(()) => {
                shared.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(count = batch.len(), "Usage batch flushed");
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    shared.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    warn!(
                        count = batch.len(),
                        attempts = attempt,
                        error = %e,
                        "Usage batch dropped after retry exhaustion"
                    );
                    return;
                }
                shared.retries.fetch_add(1, Ordering::Relaxed);
                let backoff = backoff_with_jitter(config, attempt);
                if let Some(d) = deadline {
                    if Instant::now() + backoff >= d {
                        shared.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        warn!(count = batch.len(), "Usage batch dropped at close deadline");
                        return;
                    }
                }
                std::thread::sleep(backoff);
            }
        }
    }
}

/// Exponential backoff: base * 2^(attempt-1), capped, plus up to one base
/// interval of jitter.
fn backoff_with_jitter(config: &RecorderConfig, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = config
        .backoff_base
        .saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = exp.min(config.backoff_cap);
    let jitter_ms = if config.backoff_base.as_millis() > 0 {
        rand::rng().random_range(0..config.backoff_base.as_millis() as u64)
    } else {
        0
    };
    capped + Duration::from_millis(jitter_ms)
}
