//! Keeps an in-memory `id -> entity` map consistent with a remote collection
//! that emits incremental deltas, tolerating the initial "added" flood, full
//! refreshes after reconnect, and deltas racing an in-flight refresh.
//!
//! While idle, deltas apply directly and every effective change marks the
//! reconciler dirty; one flush per frame hands the full list downstream.
//! While a refresh is in flight, deltas are buffered per id (last write wins)
//! and replayed over the fetched snapshot once it lands. Removals always apply
//! immediately and are also buffered, so the snapshot cannot resurrect them.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::{
    adapters::Delta,
    error::SyncResult,
    models::Entity,
    services::scheduler::FrameScheduler,
    telemetry::SyncEvent,
};

pub type SnapshotFetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<Vec<T>>> + Send + Sync>;
pub type FlushSink<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

struct ReconcilerState<T> {
    entities: BTreeMap<String, T>,
    buffering: bool,
    buffered: BTreeMap<String, Delta<T>>,
    refresh_in_flight: bool,
    rerun_requested: bool,
}

struct ReconcilerInner<T: Entity> {
    namespace: String,
    state: Mutex<ReconcilerState<T>>,
    dirty: AtomicBool,
    closed: AtomicBool,
    scheduler: Arc<dyn FrameScheduler>,
    fetcher: SnapshotFetcher<T>,
    sink: FlushSink<T>,
    ready: watch::Sender<bool>,
}

impl<T: Entity> ReconcilerInner<T> {
    fn lock(&self) -> MutexGuard<'_, ReconcilerState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn flush(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let entities: Vec<T> = self.lock().entities.values().cloned().collect();
        (self.sink)(entities);
    }
}

/// Applies a delta to `entities` outside of buffering. Returns whether the map
/// changed.
fn apply_direct<T: Entity>(entities: &mut BTreeMap<String, T>, delta: Delta<T>) -> bool {
    match delta {
        Delta::Added(entity) => {
            if entities.get(entity.id()) == Some(&entity) {
                return false;
            }
            entities.insert(entity.id().to_string(), entity);
            true
        }
        Delta::Removed(id) => entities.remove(&id).is_some(),
    }
}

pub struct DeltaReconciler<T: Entity> {
    inner: Arc<ReconcilerInner<T>>,
}

impl<T: Entity> Clone for DeltaReconciler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> DeltaReconciler<T> {
    pub fn new(
        namespace: impl Into<String>,
        scheduler: Arc<dyn FrameScheduler>,
        fetcher: SnapshotFetcher<T>,
        sink: FlushSink<T>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReconcilerInner {
                namespace: namespace.into(),
                state: Mutex::new(ReconcilerState {
                    entities: BTreeMap::new(),
                    buffering: false,
                    buffered: BTreeMap::new(),
                    refresh_in_flight: false,
                    rerun_requested: false,
                }),
                dirty: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                scheduler,
                fetcher,
                sink,
                ready,
            }),
        }
    }

    /// Seeds the map without flushing, e.g. from the persistent cache.
    pub fn seed(&self, entities: Vec<T>) {
        let mut state = self.inner.lock();
        state.entities = entities
            .into_iter()
            .map(|entity| (entity.id().to_string(), entity))
            .collect();
    }

    pub fn apply(&self, delta: Delta<T>) {
        let changed = {
            let mut state = self.inner.lock();
            if state.buffering {
                match delta {
                    Delta::Added(entity) => {
                        // The snapshot being fetched already covers resident ids.
                        if !state.entities.contains_key(entity.id()) {
                            state
                                .buffered
                                .insert(entity.id().to_string(), Delta::Added(entity));
                        }
                        false
                    }
                    Delta::Removed(id) => {
                        let removed = state.entities.remove(&id).is_some();
                        state.buffered.insert(id.clone(), Delta::Removed(id));
                        removed
                    }
                }
            } else {
                apply_direct(&mut state.entities, delta)
            }
        };
        if changed {
            self.schedule_flush();
        }
    }

    /// Re-fetches the whole collection and reconciles buffered deltas over it.
    /// A call made while a refresh is running returns at once and makes the
    /// running refresh go around exactly one more time.
    pub async fn refresh(&self) {
        if self.begin_refresh() {
            self.run_refresh().await;
        }
    }

    /// Starts buffering deltas for a refresh without fetching yet. Returns
    /// false when a refresh is already running; that one will go around again.
    /// A caller that gets true must follow up with [`Self::run_refresh`].
    pub fn begin_refresh(&self) -> bool {
        let mut state = self.inner.lock();
        if state.refresh_in_flight {
            state.rerun_requested = true;
            return false;
        }
        state.refresh_in_flight = true;
        state.buffering = true;
        true
    }

    /// Fetches and reconciles the refresh claimed by [`Self::begin_refresh`].
    pub async fn run_refresh(&self) {
        loop {
            let result = (self.inner.fetcher)().await;
            self.complete_refresh(result);

            let mut state = self.inner.lock();
            if state.rerun_requested && !self.inner.closed.load(Ordering::SeqCst) {
                state.rerun_requested = false;
                state.buffering = true;
                continue;
            }
            state.rerun_requested = false;
            state.refresh_in_flight = false;
            break;
        }
    }

    fn complete_refresh(&self, result: SyncResult<Vec<T>>) {
        match result {
            Ok(snapshot) => {
                let (entities, applied, skipped) = {
                    let mut state = self.inner.lock();
                    state.entities = snapshot
                        .into_iter()
                        .map(|entity| (entity.id().to_string(), entity))
                        .collect();
                    let buffered = std::mem::take(&mut state.buffered);
                    let mut applied = 0;
                    let mut skipped = 0;
                    for (_, delta) in buffered {
                        match delta {
                            Delta::Added(entity) if state.entities.contains_key(entity.id()) => {
                                skipped += 1;
                            }
                            Delta::Added(entity) => {
                                state.entities.insert(entity.id().to_string(), entity);
                                applied += 1;
                            }
                            Delta::Removed(id) => {
                                state.entities.remove(&id);
                                applied += 1;
                            }
                        }
                    }
                    state.buffering = false;
                    (state.entities.len(), applied, skipped)
                };

                SyncEvent::SnapshotRefreshed {
                    namespace: self.inner.namespace.clone(),
                    collection: T::COLLECTION.to_string(),
                    entities,
                    buffered_applied: applied,
                    buffered_skipped: skipped,
                }
                .log();
                self.inner.flush();
            }
            Err(error) => {
                tracing::warn!(
                    "Refreshing {} for {} failed, continuing with deltas: {}",
                    T::COLLECTION,
                    self.inner.namespace,
                    error
                );
                SyncEvent::SnapshotRefreshFailed {
                    namespace: self.inner.namespace.clone(),
                    collection: T::COLLECTION.to_string(),
                    reason: error.to_string(),
                }
                .log();

                let changed = {
                    let mut state = self.inner.lock();
                    state.buffering = false;
                    let buffered = std::mem::take(&mut state.buffered);
                    let mut changed = false;
                    for (_, delta) in buffered {
                        changed |= apply_direct(&mut state.entities, delta);
                    }
                    changed
                };
                if changed {
                    self.schedule_flush();
                }
            }
        }
        self.inner.ready.send_replace(true);
    }

    fn schedule_flush(&self) {
        if self.inner.dirty.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<ReconcilerInner<T>> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.dirty.load(Ordering::SeqCst) {
                    inner.flush();
                }
            }
        }));
    }

    /// Stops all further flushes. Used when the owning session is torn down.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub fn is_buffering(&self) -> bool {
        self.inner.lock().buffering
    }

    pub fn entities(&self) -> Vec<T> {
        self.inner.lock().entities.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.lock().entities.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        error::SyncError,
        models::{Note, NoteDraft, NotePatch, Point},
        services::scheduler::ManualFrameScheduler,
    };

    struct Harness {
        reconciler: DeltaReconciler<Note>,
        scheduler: Arc<ManualFrameScheduler>,
        flushes: Arc<Mutex<Vec<Vec<Note>>>>,
    }

    impl Harness {
        fn flush_count(&self) -> usize {
            self.flushes.lock().expect("lock").len()
        }

        fn last_flush(&self) -> Vec<Note> {
            self.flushes.lock().expect("lock").last().cloned().unwrap_or_default()
        }
    }

    fn harness(fetcher: SnapshotFetcher<Note>) -> Harness {
        let scheduler = Arc::new(ManualFrameScheduler::default());
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let recorded = flushes.clone();
        let reconciler = DeltaReconciler::new(
            "user:u1",
            scheduler.clone(),
            fetcher,
            Arc::new(move |notes: Vec<Note>| recorded.lock().expect("lock").push(notes)),
        );
        Harness {
            reconciler,
            scheduler,
            flushes,
        }
    }

    fn fixed(notes: Vec<Note>) -> SnapshotFetcher<Note> {
        Arc::new(move || {
            let notes = notes.clone();
            async move { SyncResult::Ok(notes) }.boxed()
        })
    }

    /// Fetcher that blocks until `gate` is notified, then returns `notes`.
    fn gated(notes: Vec<Note>, gate: Arc<Notify>) -> SnapshotFetcher<Note> {
        Arc::new(move || {
            let notes = notes.clone();
            let gate = gate.clone();
            async move {
                gate.notified().await;
                SyncResult::Ok(notes)
            }
            .boxed()
        })
    }

    fn note(id: &str, content: &str) -> Note {
        let mut note = NoteDraft::at(Point::new(0.0, 0.0), 1).into_note(id.to_string());
        note.content = content.to_string();
        note
    }

    #[test]
    fn deltas_before_a_frame_collapse_into_one_flush() {
        let h = harness(fixed(Vec::new()));
        h.reconciler.apply(Delta::Added(note("a", "1")));
        h.reconciler.apply(Delta::Added(note("b", "2")));
        h.reconciler.apply(Delta::Added(note("a", "3")));
        assert_eq!(h.scheduler.pending(), 1);

        h.scheduler.run_frame();
        assert_eq!(h.flush_count(), 1);
        let flushed = h.last_flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].content, "3");
    }

    #[test]
    fn identical_added_event_is_skipped() {
        let h = harness(fixed(Vec::new()));
        let original = note("a", "hello");
        h.reconciler.apply(Delta::Added(original.clone()));
        h.scheduler.run_frame();
        assert_eq!(h.flush_count(), 1);

        h.reconciler.apply(Delta::Added(original.clone()));
        assert_eq!(h.scheduler.pending(), 0);
        h.scheduler.run_frame();
        assert_eq!(h.flush_count(), 1);

        let mut edited = original;
        edited.apply_patch(&NotePatch::content("hello!"), edited.updated_at);
        h.reconciler.apply(Delta::Added(edited));
        h.scheduler.run_frame();
        assert_eq!(h.flush_count(), 2);
    }

    #[test]
    fn removing_unknown_id_is_silent() {
        let h = harness(fixed(Vec::new()));
        h.reconciler.apply(Delta::Removed("ghost".to_string()));
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn events_during_refresh_are_reflected_exactly_once() {
        let gate = Arc::new(Notify::new());
        let snapshot = vec![note("a", "server"), note("b", "server")];
        let h = harness(gated(snapshot, gate.clone()));
        h.reconciler.seed(vec![note("a", "cached"), note("c", "cached")]);

        let refresh = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.refresh().await })
        };
        while !h.reconciler.is_buffering() {
            tokio::task::yield_now().await;
        }

        // Resident id: covered by the snapshot, ignored.
        h.reconciler.apply(Delta::Added(note("a", "flood")));
        // New id: buffered and replayed.
        h.reconciler.apply(Delta::Added(note("d", "new")));
        // Added while buffering, then the snapshot also has it: snapshot wins.
        h.reconciler.apply(Delta::Added(note("b", "stale-flood")));
        // Removal applies immediately.
        h.reconciler.apply(Delta::Removed("c".to_string()));
        assert!(h.reconciler.get("c").is_none());

        gate.notify_one();
        refresh.await.expect("refresh task");

        assert!(h.reconciler.is_ready());
        assert!(!h.reconciler.is_buffering());
        let ids: Vec<String> = h.last_flush().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
        assert_eq!(h.reconciler.get("a").expect("a").content, "server");
        assert_eq!(h.reconciler.get("b").expect("b").content, "server");
        assert_eq!(h.reconciler.get("d").expect("d").content, "new");
    }

    #[tokio::test]
    async fn last_buffered_event_per_id_wins() {
        let gate = Arc::new(Notify::new());
        let h = harness(gated(vec![note("a", "server")], gate.clone()));

        let refresh = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.refresh().await })
        };
        while !h.reconciler.is_buffering() {
            tokio::task::yield_now().await;
        }

        h.reconciler.apply(Delta::Added(note("x", "stale")));
        h.reconciler.apply(Delta::Added(note("x", "fresh")));

        gate.notify_one();
        refresh.await.expect("refresh task");

        assert_eq!(h.reconciler.get("x").expect("x").content, "fresh");
    }

    #[tokio::test]
    async fn removal_during_refresh_is_not_resurrected_by_snapshot() {
        let gate = Arc::new(Notify::new());
        let h = harness(gated(vec![note("a", "server")], gate.clone()));
        h.reconciler.seed(vec![note("a", "cached")]);

        let refresh = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.refresh().await })
        };
        while !h.reconciler.is_buffering() {
            tokio::task::yield_now().await;
        }
        h.reconciler.apply(Delta::Removed("a".to_string()));
        gate.notify_one();
        refresh.await.expect("refresh task");

        assert!(h.reconciler.get("a").is_none());
        assert!(h.last_flush().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_marks_ready_and_replays_buffer() {
        let fetcher: SnapshotFetcher<Note> =
            Arc::new(|| {
                async { SyncResult::<Vec<Note>>::Err(SyncError::Remote("offline".to_string())) }
                    .boxed()
            });
        let h = harness(fetcher);
        h.reconciler.seed(vec![note("a", "cached")]);

        h.reconciler.refresh().await;

        assert!(h.reconciler.is_ready());
        assert!(!h.reconciler.is_buffering());
        assert_eq!(h.reconciler.get("a").expect("kept").content, "cached");

        h.reconciler.apply(Delta::Added(note("b", "live")));
        h.scheduler.run_frame();
        assert_eq!(h.last_flush().len(), 2);
    }

    #[tokio::test]
    async fn refresh_requested_mid_flight_runs_exactly_once_more() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher: SnapshotFetcher<Note> = {
            let gate = gate.clone();
            let calls = calls.clone();
            Arc::new(move || {
                let gate = gate.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    SyncResult::Ok(Vec::<Note>::new())
                }
                .boxed()
            })
        };
        let h = harness(fetcher);

        let refresh = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.refresh().await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        h.reconciler.refresh().await;
        h.reconciler.refresh().await;

        gate.notify_one();
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        refresh.await.expect("refresh task");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flood_after_begin_refresh_is_buffered_until_the_snapshot() {
        let h = harness(fixed(vec![note("a", "server")]));
        assert!(h.reconciler.begin_refresh());
        assert!(h.reconciler.is_buffering());

        h.reconciler.apply(Delta::Added(note("a", "server")));
        h.reconciler.apply(Delta::Added(note("b", "server")));
        assert_eq!(h.scheduler.pending(), 0);
        assert!(h.reconciler.entities().is_empty());

        h.reconciler.run_refresh().await;

        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.flush_count(), 1);
        let ids: Vec<String> = h.last_flush().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn closed_reconciler_stops_flushing() {
        let h = harness(fixed(Vec::new()));
        h.reconciler.apply(Delta::Added(note("a", "1")));
        h.reconciler.close();
        h.scheduler.run_frame();
        assert_eq!(h.flush_count(), 0);
    }
}
