//! Session lifecycle. A [`SessionContext`] owns everything one mode needs
//! (adapter, store, reconcilers, subscription, reconnect watcher) and
//! [`ModeSelector`] swaps contexts when the mode changes.

use std::sync::Arc;

use futures::{FutureExt, future::BoxFuture};
use tokio::task::JoinHandle;

use crate::{
    adapters::{ChangeHandler, CollectionChange, LocalAdapter, RemoteAdapter, StorageAdapter},
    app::mode::{Mode, select_mode},
    config::SyncConfig,
    error::{SyncError, SyncResult},
    models::{CanvasFile, CanvasImage, Entity, Identity, Namespace, Note, SharedCanvas},
    realtime::{
        backend::RealtimeBackend,
        connectivity::ReconnectWatcher,
        reconciler::{DeltaReconciler, FlushSink, SnapshotFetcher},
        subscription::Subscription,
    },
    repositories::fallback::KeyValueStore,
    services::{
        cache_writer::CacheWriter,
        host::HostEnvironment,
        notifier::Notifier,
        persistent_cache::PersistentCache,
        scheduler::{FrameScheduler, IntervalFrameScheduler},
        sharing::ShareService,
    },
    telemetry::{SyncEvent, events::redact_token},
    usecases::canvas::{CanvasStore, CollectionKind},
};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub config: SyncConfig,
    pub notifier: Arc<dyn Notifier>,
    /// Holds the device-local canvas. Also backs remote modes when no backend
    /// is configured.
    pub local_store: Arc<dyn KeyValueStore>,
    pub scheduler: Arc<dyn FrameScheduler>,
    pub backend: Option<Arc<dyn RealtimeBackend>>,
    pub share_service: Option<Arc<dyn ShareService>>,
    pub cache: Option<PersistentCache>,
    pub cache_writer: Option<CacheWriter>,
}

impl SessionServices {
    pub fn new(
        config: SyncConfig,
        notifier: Arc<dyn Notifier>,
        local_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let scheduler = Arc::new(IntervalFrameScheduler::new(config.frame_interval));
        Self {
            config,
            notifier,
            local_store,
            scheduler,
            backend: None,
            share_service: None,
            cache: None,
            cache_writer: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn RealtimeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_share_service(mut self, share_service: Arc<dyn ShareService>) -> Self {
        self.share_service = Some(share_service);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn FrameScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Enables cached startup and debounced cache writes for remote modes.
    pub fn with_cache(mut self, cache: PersistentCache, host: Arc<dyn HostEnvironment>) -> Self {
        let writer = CacheWriter::new(Arc::new(cache.clone()), host, self.config.cache_writer);
        self.cache = Some(cache);
        self.cache_writer = Some(writer);
        self
    }
}

#[derive(Clone)]
struct Reconcilers {
    notes: DeltaReconciler<Note>,
    images: DeltaReconciler<CanvasImage>,
    files: DeltaReconciler<CanvasFile>,
}

impl Reconcilers {
    fn refresh_all(&self) -> Vec<JoinHandle<()>> {
        self.run_refresh(self.begin_refresh())
    }

    /// Switches every reconciler to buffering before any delta can arrive.
    fn begin_refresh(&self) -> [bool; 3] {
        [
            self.notes.begin_refresh(),
            self.images.begin_refresh(),
            self.files.begin_refresh(),
        ]
    }

    fn run_refresh(
        &self,
        [notes_claimed, images_claimed, files_claimed]: [bool; 3],
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if notes_claimed {
            let notes = self.notes.clone();
            tasks.push(tokio::spawn(async move { notes.run_refresh().await }));
        }
        if images_claimed {
            let images = self.images.clone();
            tasks.push(tokio::spawn(async move { images.run_refresh().await }));
        }
        if files_claimed {
            let files = self.files.clone();
            tasks.push(tokio::spawn(async move { files.run_refresh().await }));
        }
        tasks
    }

    fn close(&self) {
        self.notes.close();
        self.images.close();
        self.files.close();
    }

    fn dispatch(&self, store: &CanvasStore, change: CollectionChange) {
        match change {
            CollectionChange::Notes(delta) => self.notes.apply(delta),
            CollectionChange::Images(delta) => self.images.apply(delta),
            CollectionChange::Files(delta) => self.files.apply(delta),
            CollectionChange::Settings(patch) => store.apply_remote_settings(patch),
        }
    }
}

fn reconciler_for<T: Entity>(
    namespace: &Namespace,
    scheduler: Arc<dyn FrameScheduler>,
    fetch: impl Fn(Arc<dyn StorageAdapter>) -> BoxFuture<'static, SyncResult<Vec<T>>>
    + Send
    + Sync
    + 'static,
    adapter: Arc<dyn StorageAdapter>,
    sink: FlushSink<T>,
) -> DeltaReconciler<T> {
    let fetcher: SnapshotFetcher<T> = Arc::new(move || fetch(adapter.clone()));
    DeltaReconciler::new(namespace.cache_key(), scheduler, fetcher, sink)
}

fn mark_ready_when<T: Entity>(
    reconciler: &DeltaReconciler<T>,
    store: CanvasStore,
    kind: CollectionKind,
) -> JoinHandle<()> {
    let mut ready = reconciler.ready();
    tokio::spawn(async move {
        if ready.wait_for(|ready| *ready).await.is_ok() {
            store.mark_ready(kind);
        }
    })
}

/// Everything owned by the active mode.
pub struct SessionContext {
    mode: Mode,
    namespace: Namespace,
    adapter: Arc<dyn StorageAdapter>,
    store: CanvasStore,
    reconcilers: Option<Reconcilers>,
    subscription: Option<Subscription>,
    watcher: Option<ReconnectWatcher>,
    tasks: Vec<JoinHandle<()>>,
    cache_writer: Option<CacheWriter>,
}

impl SessionContext {
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Namespace the adapter actually writes to. Differs from the mode's
    /// namespace when a remote mode fell back to local storage.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn store(&self) -> &CanvasStore {
        &self.store
    }

    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        self.adapter.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|subscription| !subscription.is_closed())
    }

    /// Re-fetches every collection, e.g. after the host regains focus.
    pub fn refresh(&self) {
        if let Some(reconcilers) = &self.reconcilers {
            reconcilers.refresh_all();
        }
    }

    async fn local(mode: Mode, services: &SessionServices) -> Self {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(LocalAdapter::open(
            Namespace::Local,
            services.local_store.clone(),
        ));
        let store = CanvasStore::new(
            adapter.clone(),
            services.notifier.clone(),
            services.config.store,
        );
        store.set_read_only(mode.is_read_only());
        store.load_from_adapter().await;

        Self {
            mode,
            namespace: Namespace::Local,
            adapter,
            store,
            reconcilers: None,
            subscription: None,
            watcher: None,
            tasks: Vec::new(),
            cache_writer: None,
        }
    }

    async fn remote(
        mode: Mode,
        backend: Arc<dyn RealtimeBackend>,
        services: &SessionServices,
    ) -> SyncResult<Self> {
        let namespace = mode.namespace();
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(RemoteAdapter::new(namespace.clone(), backend.clone())?);
        let store = CanvasStore::new(
            adapter.clone(),
            services.notifier.clone(),
            services.config.store,
        );
        store.set_read_only(mode.is_read_only());

        let cached = match &services.cache {
            Some(cache) => cache.load(&namespace).await,
            None => None,
        };
        if let Some(snapshot) = &cached {
            tracing::debug!(
                "Rendering {} notes from cache for {}",
                snapshot.notes.len(),
                namespace
            );
            store.hydrate(snapshot.clone());
        }

        let notes_store = store.clone();
        let images_store = store.clone();
        let files_store = store.clone();
        let reconcilers = Reconcilers {
            notes: reconciler_for(
                &namespace,
                services.scheduler.clone(),
                |adapter| async move { adapter.get_notes().await }.boxed(),
                adapter.clone(),
                Arc::new(move |notes| notes_store.apply_remote_notes(notes)),
            ),
            images: reconciler_for(
                &namespace,
                services.scheduler.clone(),
                |adapter| async move { adapter.get_images().await }.boxed(),
                adapter.clone(),
                Arc::new(move |images| images_store.apply_remote_images(images)),
            ),
            files: reconciler_for(
                &namespace,
                services.scheduler.clone(),
                |adapter| async move { adapter.get_files().await }.boxed(),
                adapter.clone(),
                Arc::new(move |files| files_store.apply_remote_files(files)),
            ),
        };
        if let Some(snapshot) = cached {
            reconcilers.notes.seed(snapshot.notes);
            reconcilers.images.seed(snapshot.images);
            reconcilers.files.seed(snapshot.files);
        }

        // The initial load has to see the "added" flood of the subscription.
        let claimed = reconcilers.begin_refresh();
        let handler_reconcilers = reconcilers.clone();
        let handler_store = store.clone();
        let handler: Arc<dyn ChangeHandler> = Arc::new(move |change: CollectionChange| {
            handler_reconcilers.dispatch(&handler_store, change)
        });
        let subscription = match adapter.subscribe_to_changes(handler).await {
            Ok(subscription) => subscription,
            Err(error) => {
                tracing::error!("Subscribing to {} failed: {}", namespace, error);
                None
            }
        };

        let mut tasks = reconcilers.run_refresh(claimed);
        tasks.push(mark_ready_when(&reconcilers.notes, store.clone(), CollectionKind::Notes));
        tasks.push(mark_ready_when(&reconcilers.images, store.clone(), CollectionKind::Images));
        tasks.push(mark_ready_when(&reconcilers.files, store.clone(), CollectionKind::Files));
        tasks.push(spawn_settings_load(adapter.clone(), store.clone()));
        if let Some(writer) = &services.cache_writer {
            tasks.push(spawn_cache_feed(store.clone(), writer.clone(), namespace.clone()));
        }

        let refresh_reconcilers = reconcilers.clone();
        let watcher = ReconnectWatcher::spawn(
            backend.connectivity(),
            services.config.reconnect_debounce,
            Arc::new(move || {
                refresh_reconcilers.refresh_all();
            }),
        );

        Ok(Self {
            mode,
            namespace,
            adapter,
            store,
            reconcilers: Some(reconcilers),
            subscription,
            watcher: Some(watcher),
            tasks,
            cache_writer: services.cache_writer.clone(),
        })
    }

    /// Releases every resource of the session. Subscriptions are closed once,
    /// timers and pending cache writes for the namespace are cancelled.
    async fn teardown(self) {
        let subscriptions_closed = self
            .subscription
            .as_ref()
            .map(|subscription| usize::from(subscription.close()))
            .unwrap_or(0);
        if let Some(reconcilers) = &self.reconcilers {
            reconcilers.close();
        }
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(writer) = &self.cache_writer {
            writer.cancel(&self.namespace);
        }
        self.store.cancel_pending();
        self.adapter.cleanup().await;

        SyncEvent::ModeDeactivated {
            namespace: self.namespace.cache_key(),
            subscriptions_closed,
        }
        .log();
    }
}

/// Settings have no reconciler. One fetch marks them ready even when the
/// remote has never stored any.
fn spawn_settings_load(adapter: Arc<dyn StorageAdapter>, store: CanvasStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        match adapter.get_settings().await {
            Ok(patch) => store.apply_remote_settings(patch),
            Err(error) => {
                tracing::warn!("Loading settings for {} failed: {}", adapter.namespace(), error);
                store.mark_ready(CollectionKind::Settings);
            }
        }
    })
}

fn spawn_cache_feed(store: CanvasStore, writer: CacheWriter, namespace: Namespace) -> JoinHandle<()> {
    let mut updates = store.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().cache_snapshot();
            writer.request(&namespace, snapshot);
        }
    })
}

/// Owns the active session and switches it when identity or shared canvas
/// change.
pub struct ModeSelector {
    services: SessionServices,
    identity: Option<Identity>,
    active: Option<SessionContext>,
}

impl ModeSelector {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            identity: None,
            active: None,
        }
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.active.as_ref()
    }

    pub fn store(&self) -> Option<&CanvasStore> {
        self.active.as_ref().map(SessionContext::store)
    }

    /// Tears down the active session, then builds the one selected by
    /// `identity` and `shared`.
    pub async fn activate(
        &mut self,
        identity: Option<Identity>,
        shared: Option<&SharedCanvas>,
    ) -> &SessionContext {
        let mode = select_mode(identity.as_ref(), shared);
        self.identity = identity;
        self.deactivate().await;

        let backend = self.services.backend.clone();
        let session = match backend {
            _ if !mode.is_remote() => SessionContext::local(mode, &self.services).await,
            None => {
                tracing::warn!("No realtime backend configured, {} uses local storage", mode);
                SessionContext::local(mode, &self.services).await
            }
            Some(backend) => {
                match SessionContext::remote(mode.clone(), backend, &self.services).await {
                    Ok(session) => session,
                    Err(error) => {
                        tracing::error!("Activating {} failed, using local storage: {}", mode, error);
                        SessionContext::local(mode, &self.services).await
                    }
                }
            }
        };

        SyncEvent::ModeActivated {
            mode: session.mode.label().to_string(),
            namespace: session.namespace.cache_key(),
        }
        .log();
        self.active.insert(session)
    }

    /// Opens the canvas behind a share link with the role the link grants.
    pub async fn join_shared(&mut self, token: &str) -> SyncResult<&SessionContext> {
        let share_service = self
            .services
            .share_service
            .clone()
            .ok_or_else(|| SyncError::Unconfigured("canvas sharing".to_string()))?;
        let shared = share_service.resolve(token).await?;

        SyncEvent::SharedCanvasJoined {
            canvas_id: shared.canvas_id.clone(),
            role: format!("{:?}", shared.role).to_lowercase(),
            token_redacted: redact_token(token),
        }
        .log();
        if self.identity.as_ref().is_none_or(|identity| identity.anonymous) {
            tracing::warn!("Shared canvas {} needs a signed-in user", shared.canvas_id);
        }

        let identity = self.identity.clone();
        Ok(self.activate(identity, Some(&shared)).await)
    }

    /// Returns from a shared canvas to the user's own canvas.
    pub async fn leave_shared(&mut self) -> &SessionContext {
        let identity = self.identity.clone();
        self.activate(identity, None).await
    }

    pub async fn deactivate(&mut self) {
        if let Some(session) = self.active.take() {
            session.teardown().await;
        }
    }
}
