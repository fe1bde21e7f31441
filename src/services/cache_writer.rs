//! Debounced, rate-limited persistence of reconciled canvas state.
//!
//! One pending payload is kept per namespace. Each request replaces it and
//! re-arms the timer at
//! `max(now + debounce, last_write + min_interval)`, bounded by
//! `first_request + max_wait` but never earlier than the minimum interval
//! allows. When the timer fires the write is dropped if the host is hidden,
//! otherwise it waits for host idle time and hands the payload to the sink.
//! Cancelling before the sink is called drops the payload, idle wait included.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::CacheWriterConfig,
    dto::cache::CacheSnapshot,
    error::SyncResult,
    models::Namespace,
    services::host::HostEnvironment,
    telemetry::SyncEvent,
};

#[async_trait]
pub trait CacheSink: Send + Sync {
    async fn write_snapshot(&self, namespace: &Namespace, snapshot: CacheSnapshot) -> SyncResult<()>;
}

struct PendingWrite {
    namespace: Namespace,
    snapshot: CacheSnapshot,
    first_requested: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

struct WriterInner {
    sink: Arc<dyn CacheSink>,
    host: Arc<dyn HostEnvironment>,
    config: CacheWriterConfig,
    pending: DashMap<String, PendingWrite>,
    last_write: DashMap<String, Instant>,
    generations: AtomicU64,
}

impl WriterInner {
    fn earliest_allowed(&self, key: &str) -> Option<Instant> {
        self.last_write
            .get(key)
            .map(|last| *last.value() + self.config.min_interval)
    }

    fn deadline(&self, key: &str, now: Instant, first_requested: Instant) -> Instant {
        let earliest = self.earliest_allowed(key);
        let mut deadline = now + self.config.debounce;
        if let Some(earliest) = earliest {
            deadline = deadline.max(earliest);
        }
        deadline = deadline.min(first_requested + self.config.max_wait);
        if let Some(earliest) = earliest {
            deadline = deadline.max(earliest);
        }
        deadline.max(now)
    }
}

#[derive(Clone)]
pub struct CacheWriter {
    inner: Arc<WriterInner>,
}

impl CacheWriter {
    pub fn new(
        sink: Arc<dyn CacheSink>,
        host: Arc<dyn HostEnvironment>,
        config: CacheWriterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                sink,
                host,
                config,
                pending: DashMap::new(),
                last_write: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules `snapshot` to be written for `namespace`, superseding any
    /// payload still pending for it.
    pub fn request(&self, namespace: &Namespace, snapshot: CacheSnapshot) {
        let key = namespace.cache_key();
        let now = Instant::now();
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;

        // The timer is spawned under the entry guard so it cannot observe the
        // map before its own payload is in place.
        match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                let deadline = self.inner.deadline(&key, now, pending.first_requested);
                pending.timer.abort();
                pending.snapshot = snapshot;
                pending.generation = generation;
                pending.timer =
                    tokio::spawn(run_timer(self.inner.clone(), key, generation, deadline));
            }
            Entry::Vacant(vacant) => {
                let deadline = self.inner.deadline(&key, now, now);
                let timer = tokio::spawn(run_timer(self.inner.clone(), key, generation, deadline));
                vacant.insert(PendingWrite {
                    namespace: namespace.clone(),
                    snapshot,
                    first_requested: now,
                    generation,
                    timer,
                });
            }
        }
    }

    /// Drops the pending payload for `namespace` and stops its timer.
    pub fn cancel(&self, namespace: &Namespace) {
        if let Some((_, pending)) = self.inner.pending.remove(&namespace.cache_key()) {
            pending.timer.abort();
            tracing::debug!("Cancelled pending cache write for {}", namespace);
        }
    }

    pub fn has_pending(&self, namespace: &Namespace) -> bool {
        self.inner.pending.contains_key(&namespace.cache_key())
    }

    /// Writes the pending payload for `namespace` now, skipping the timers.
    /// Returns whether anything was written.
    pub async fn flush(&self, namespace: &Namespace) -> SyncResult<bool> {
        let Some((key, pending)) = self.inner.pending.remove(&namespace.cache_key()) else {
            return Ok(false);
        };
        pending.timer.abort();
        self.inner.last_write.insert(key, Instant::now());
        self.inner
            .sink
            .write_snapshot(&pending.namespace, pending.snapshot)
            .await?;
        Ok(true)
    }
}

async fn run_timer(inner: Arc<WriterInner>, key: String, generation: u64, mut deadline: Instant) {
    loop {
        tokio::time::sleep_until(deadline).await;
        // A write may have landed after this timer was armed.
        match inner.earliest_allowed(&key) {
            Some(earliest) if earliest > Instant::now() => deadline = earliest,
            _ => break,
        }
    }

    let current = |_: &String, pending: &PendingWrite| pending.generation == generation;
    if !inner.pending.get(&key).is_some_and(|pending| current(&key, pending.value())) {
        return;
    }

    if !inner.host.is_visible() {
        inner.pending.remove_if(&key, current);
        SyncEvent::CacheWriteSkipped {
            namespace: key,
            reason: "hidden".to_string(),
        }
        .log();
        return;
    }

    // The payload stays pending while the host is busy so that `cancel` can
    // still drop it.
    inner.host.idle(inner.config.idle_timeout).await;
    let Some((_, pending)) = inner.pending.remove_if(&key, current) else {
        return;
    };

    inner.last_write.insert(key.clone(), Instant::now());
    if let Err(error) = inner
        .sink
        .write_snapshot(&pending.namespace, pending.snapshot)
        .await
    {
        tracing::error!("Failed to persist cache for {}: {}", key, error);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::{
        models::{NoteDraft, Point},
        services::host::DefaultHost,
    };

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(String, usize, Instant)>>,
    }

    impl RecordingSink {
        fn writes(&self) -> Vec<(String, usize, Instant)> {
            self.writes.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl CacheSink for RecordingSink {
        async fn write_snapshot(
            &self,
            namespace: &Namespace,
            snapshot: CacheSnapshot,
        ) -> SyncResult<()> {
            self.writes.lock().expect("lock").push((
                namespace.cache_key(),
                snapshot.notes.len(),
                Instant::now(),
            ));
            Ok(())
        }
    }

    fn snapshot(notes: usize) -> CacheSnapshot {
        CacheSnapshot {
            notes: (0..notes)
                .map(|index| {
                    NoteDraft::at(Point::new(0.0, 0.0), index as i64).into_note(format!("n{index}"))
                })
                .collect(),
            ..CacheSnapshot::default()
        }
    }

    fn writer() -> (CacheWriter, Arc<RecordingSink>, Arc<DefaultHost>) {
        let sink = Arc::new(RecordingSink::default());
        let host = Arc::new(DefaultHost::default());
        let writer = CacheWriter::new(sink.clone(), host.clone(), CacheWriterConfig::default());
        (writer, sink, host)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_debounce_window_writes_last_payload_once() {
        let (writer, sink, _host) = writer();
        let namespace = Namespace::Local;

        for count in 1..=5 {
            writer.request(&namespace, snapshot(count));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "local");
        assert_eq!(writes[0].1, 5);
        assert!(!writer.has_pending(&namespace));
    }

    #[tokio::test(start_paused = true)]
    async fn request_after_a_write_waits_for_minimum_interval() {
        let (writer, sink, _host) = writer();
        let namespace = Namespace::User("u1".to_string());
        let start = Instant::now();

        writer.request(&namespace, snapshot(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.writes().len(), 1);

        writer.request(&namespace, snapshot(2));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.writes().len(), 1, "second write must wait for the interval");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let writes = sink.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].2 - writes[0].2 >= Duration::from_secs(10));
        assert!(writes[1].2 - start >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_requests_respect_interval_and_still_persist() {
        let (writer, sink, _host) = writer();
        let namespace = Namespace::Canvas("c1".to_string());

        for count in 0..90 {
            writer.request(&namespace, snapshot(count));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let writes = sink.writes();
        assert!(writes.len() >= 2, "max wait keeps persistence going");
        for pair in writes.windows(2) {
            assert!(pair[1].2 - pair[0].2 >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_host_drops_the_write() {
        let (writer, sink, host) = writer();
        let namespace = Namespace::Local;

        host.set_visible(false);
        writer.request(&namespace, snapshot(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sink.writes().is_empty());
        assert!(!writer.has_pending(&namespace));

        host.set_visible(true);
        writer.request(&namespace, snapshot(2));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_payload() {
        let (writer, sink, _host) = writer();
        let namespace = Namespace::User("u1".to_string());

        writer.request(&namespace, snapshot(1));
        writer.cancel(&namespace);
        assert!(!writer.has_pending(&namespace));
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(sink.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_for_idle_drops_the_write() {
        let sink = Arc::new(RecordingSink::default());
        let host = Arc::new(DefaultHost::with_idle_hint(Duration::from_millis(800)));
        let writer = CacheWriter::new(sink.clone(), host, CacheWriterConfig::default());
        let namespace = Namespace::User("u1".to_string());

        writer.request(&namespace, snapshot(1));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(writer.has_pending(&namespace));
        writer.cancel(&namespace);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(sink.writes().is_empty());
        assert!(!writer.has_pending(&namespace));
    }

    #[tokio::test(start_paused = true)]
    async fn namespaces_are_independent() {
        let (writer, sink, _host) = writer();
        writer.request(&Namespace::Local, snapshot(1));
        writer.request(&Namespace::User("u1".to_string()), snapshot(2));
        writer.cancel(&Namespace::Local);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "user:u1");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_immediately() {
        let (writer, sink, _host) = writer();
        let namespace = Namespace::Local;
        writer.request(&namespace, snapshot(4));
        assert!(writer.flush(&namespace).await.expect("flush"));
        assert!(!writer.flush(&namespace).await.expect("nothing left"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.writes().len(), 1);
    }
}
