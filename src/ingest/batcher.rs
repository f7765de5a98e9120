use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::IngestConfig;
use crate::models::event::Event;
use crate::storage::StorageBackend;

/// Ingestion counters, surfaced both as tracing lines and as internal events.
#[derive(Debug, Default)]
pub struct IngestCounters {
    batches: AtomicU64,
    events: AtomicU64,
    parse_errors: AtomicU64,
    dropped: AtomicU64,
}

impl IngestCounters {
    pub fn batch(&self, event_count: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(event_count, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Read and reset, returning (batches, events, parse_errors, dropped).
    pub fn drain(&self) -> (u64, u64, u64, u64) {
        (
            self.batches.swap(0, Ordering::Relaxed),
            self.events.swap(0, Ordering::Relaxed),
            self.parse_errors.swap(0, Ordering::Relaxed),
            self.dropped.swap(0, Ordering::Relaxed),
        )
    }
}

/// Bounded per-index buffer. Overflow drops the oldest queued event, which a
/// plain mpsc cannot express.
struct IndexQueue {
    index: String,
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl IndexQueue {
    fn push(&self, event: Event, counters: &IngestCounters) {
        {
            let mut q = self.inner.lock().unwrap();
            if q.len() >= self.capacity {
                q.pop_front();
                counters.dropped(1);
            }
            q.push_back(event);
        }
        self.notify.notify_one();
    }

    fn drain_batch(&self, max: usize) -> Vec<Event> {
        let mut q = self.inner.lock().unwrap();
        let n = q.len().min(max);
        q.drain(..n).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Routes events into per-index queues, each with its own flush task.
pub struct Ingestor {
    storage: Arc<dyn StorageBackend>,
    cfg: IngestConfig,
    counters: Arc<IngestCounters>,
    queues: Mutex<HashMap<String, Arc<IndexQueue>>>,
    shutdown: watch::Receiver<bool>,
}

impl Ingestor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cfg: IngestConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cfg,
            counters: Arc::new(IngestCounters::default()),
            queues: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    /// Enqueue one event for batched insertion into its index.
    pub fn push(self: &Arc<Self>, event: Event) {
        let queue = self.queue_for(&event.index_name);
        queue.push(event, &self.counters);
    }

    fn queue_for(self: &Arc<Self>, index: &str) -> Arc<IndexQueue> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(q) = queues.get(index) {
            return q.clone();
        }
        let queue = Arc::new(IndexQueue {
            index: index.to_string(),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.cfg.channel_capacity,
        });
        queues.insert(index.to_string(), queue.clone());

        let storage = self.storage.clone();
        let cfg = self.cfg.clone();
        let counters = self.counters.clone();
        let shutdown = self.shutdown.clone();
        let q = queue.clone();
        tokio::spawn(async move {
            flush_loop(q, storage, cfg, counters, shutdown).await;
        });
        queue
    }

    /// Periodic counter flush: non-zero counters become internal log events
    /// written back through the normal ingestion path.
    pub fn spawn_stats_task(self: &Arc<Self>) {
        let ingestor = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                let (batches, events, parse_errors, dropped) = ingestor.counters.drain();
                for (metric, value) in [
                    ("ingest.batch", batches),
                    ("ingest.events", events),
                    ("ingest.parse_error", parse_errors),
                    ("ingest.dropped", dropped),
                ] {
                    if value == 0 {
                        continue;
                    }
                    tracing::info!("{metric}={value} over last 60s");
                    let mut event = Event::default();
                    event.hostname = "localhost".to_string();
                    event.app_name = "timberline".to_string();
                    event.severity = 6;
                    event.facility = 16;
                    event.message = format!("{metric} {value}");
                    event
                        .structured_data
                        .insert("metric".to_string(), metric.to_string());
                    event
                        .structured_data
                        .insert("value".to_string(), value.to_string());
                    ingestor.push(event);
                }
            }
        });
    }
}

/// Retry schedule for failed batch inserts: 100ms base, doubling, 30s cap,
/// five attempts, then the batch is dropped with a counter increment.
pub const RETRY_BASE_MS: u64 = 100;
pub const RETRY_FACTOR: u32 = 2;
pub const RETRY_CAP_MS: u64 = 30_000;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = RETRY_BASE_MS.saturating_mul(u64::from(RETRY_FACTOR.saturating_pow(attempt)));
    Duration::from_millis(ms.min(RETRY_CAP_MS))
}

async fn flush_loop(
    queue: Arc<IndexQueue>,
    storage: Arc<dyn StorageBackend>,
    cfg: IngestConfig,
    counters: Arc<IngestCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("flush task started for index '{}'", queue.index);
    loop {
        // Sleep until the queue has something or shutdown begins.
        while queue.len() == 0 {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        drain_on_shutdown(&queue, &storage, &cfg, &counters).await;
                        return;
                    }
                }
            }
        }

        // Coalesce until max_batch_size or max_batch_delay, whichever first.
        let deadline = Instant::now() + Duration::from_millis(cfg.max_batch_delay_ms);
        while queue.len() < cfg.max_batch_size {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let batch = queue.drain_batch(cfg.max_batch_size);
        if batch.is_empty() {
            continue;
        }
        insert_with_retry(&queue.index, &batch, &storage, &counters).await;

        if *shutdown.borrow() {
            drain_on_shutdown(&queue, &storage, &cfg, &counters).await;
            return;
        }
    }
}

async fn drain_on_shutdown(
    queue: &IndexQueue,
    storage: &Arc<dyn StorageBackend>,
    cfg: &IngestConfig,
    counters: &IngestCounters,
) {
    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    let result = tokio::time::timeout(grace, async {
        loop {
            let batch = queue.drain_batch(cfg.max_batch_size);
            if batch.is_empty() {
                break;
            }
            insert_with_retry(&queue.index, &batch, storage, counters).await;
        }
    })
    .await;
    let left = queue.len();
    if result.is_err() || left > 0 {
        counters.dropped(left as u64);
        tracing::warn!(
            "flush task for '{}' shut down with {left} events unflushed",
            queue.index
        );
    } else {
        tracing::info!("flush task for '{}' drained cleanly", queue.index);
    }
}

async fn insert_with_retry(
    index: &str,
    batch: &[Event],
    storage: &Arc<dyn StorageBackend>,
    counters: &IngestCounters,
) {
    for attempt in 0..RETRY_MAX_ATTEMPTS {
        match storage.insert_batch(index, batch).await {
            Ok(()) => {
                counters.batch(batch.len() as u64);
                tracing::debug!(
                    "inserted batch of {} events into index '{index}'",
                    batch.len()
                );
                return;
            }
            Err(e) => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    "batch insert into '{index}' failed (attempt {}/{RETRY_MAX_ATTEMPTS}): {e}; \
                     retrying in {delay:?}",
                    attempt + 1
                );
                if attempt + 1 < RETRY_MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    counters.dropped(batch.len() as u64);
    tracing::error!(
        "dropping batch of {} events for index '{index}' after {RETRY_MAX_ATTEMPTS} attempts",
        batch.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn overflow_drops_oldest() {
        let counters = IngestCounters::default();
        let queue = IndexQueue {
            index: "default".to_string(),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: 3,
        };
        for i in 0..5 {
            let mut e = Event::default();
            e.message = format!("m{i}");
            queue.push(e, &counters);
        }
        let batch = queue.drain_batch(10);
        let messages: Vec<&str> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);
        assert_eq!(counters.drain().3, 2);
    }

    #[test]
    fn counters_drain_resets() {
        let c = IngestCounters::default();
        c.batch(10);
        c.parse_error();
        c.dropped(3);
        assert_eq!(c.drain(), (1, 10, 1, 3));
        assert_eq!(c.drain(), (0, 0, 0, 0));
    }
}
