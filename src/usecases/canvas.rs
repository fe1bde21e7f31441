//! Canvas state store. One implementation of every canvas action, driven by
//! whichever storage adapter the active mode provides.
//!
//! Adds wait for the adapter to hand out an id and then insert locally.
//! Updates and deletes change local state first and push to the adapter in the
//! background. A failed push is logged and recorded, and only a push refused
//! for lack of space is reverted to what the adapter holds. Observers
//! follow the state through [`CanvasStore::subscribe`].

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::future::{BoxFuture, FutureExt, join_all};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    adapters::StorageAdapter,
    config::StoreOptions,
    dto::cache::CacheSnapshot,
    error::{SyncError, SyncResult},
    models::{
        Annotation, CanvasFile, CanvasImage, Entity, FileDraft, FilePatch, ImageDraft, ImagePatch,
        Namespace, Note, NoteDraft, NotePatch, Point, Selection, Settings, SettingsPatch, Viewport,
    },
    services::notifier::Notifier,
    usecases::history::{CanvasDocument, History},
};

const QUOTA_MESSAGE: &str =
    "Storage is full, so this change was not saved. Remove some images or files to free space.";
const READ_ONLY_MESSAGE: &str = "You can view this canvas but not edit it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Notes,
    Images,
    Files,
    Settings,
}

/// Whether each collection has received its first authoritative load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub notes: bool,
    pub images: bool,
    pub files: bool,
    pub settings: bool,
}

impl Readiness {
    pub fn all(&self) -> bool {
        self.notes && self.images && self.files && self.settings
    }

    fn mark(&mut self, kind: CollectionKind) -> bool {
        let flag = match kind {
            CollectionKind::Notes => &mut self.notes,
            CollectionKind::Images => &mut self.images,
            CollectionKind::Files => &mut self.files,
            CollectionKind::Settings => &mut self.settings,
        };
        !std::mem::replace(flag, true)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanvasState {
    pub notes: Vec<Note>,
    pub images: Vec<CanvasImage>,
    pub files: Vec<CanvasFile>,
    pub settings: Settings,
    pub selection: Selection,
    pub ready: Readiness,
    pub sync_error: Option<String>,
    pub read_only: bool,
    pub can_undo: bool,
    pub can_redo: bool,
    pub revision: u64,
}

impl CanvasState {
    pub fn document(&self) -> CanvasDocument {
        CanvasDocument {
            notes: self.notes.clone(),
            images: self.images.clone(),
            files: self.files.clone(),
        }
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            notes: self.notes.clone(),
            images: self.images.clone(),
            files: self.files.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.notes.iter().find(|note| note.id == id)
    }

    pub fn image(&self, id: &str) -> Option<&CanvasImage> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn file(&self, id: &str) -> Option<&CanvasFile> {
        self.files.iter().find(|file| file.id == id)
    }

    pub fn max_z_index(&self) -> i64 {
        self.notes.iter().map(|note| note.z_index).max().unwrap_or(0)
    }

    fn restore(&mut self, document: CanvasDocument) {
        self.notes = document.notes;
        self.images = document.images;
        self.files = document.files;
        self.clear_dangling_selection();
    }

    /// Drops the selection when it points at an entity that no longer exists.
    fn clear_dangling_selection(&mut self) -> bool {
        let exists = match &self.selection {
            Selection::None => true,
            Selection::Note(id) => self.note(id).is_some(),
            Selection::Image(id) => self.image(id).is_some(),
            Selection::File(id) => self.file(id).is_some(),
        };
        if !exists {
            self.selection = Selection::None;
        }
        !exists
    }
}

/// Resolves when the adapter call behind an action has settled.
#[derive(Debug)]
pub struct SyncHandle(Option<JoinHandle<()>>);

impl SyncHandle {
    fn none() -> Self {
        Self(None)
    }

    /// True when the action did not need to reach the adapter.
    pub fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub async fn settled(self) {
        if let Some(task) = self.0 {
            if let Err(error) = task.await {
                tracing::error!("Canvas sync task ended abnormally: {}", error);
            }
        }
    }
}

struct Diff<T> {
    changed: Vec<T>,
    recreated: Vec<T>,
    removed: Vec<String>,
}

impl<T> Diff<T> {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.recreated.is_empty() && self.removed.is_empty()
    }
}

/// What has to happen in storage to turn `from` into `to`.
fn diff<T: Entity>(from: &[T], to: &[T]) -> Diff<T> {
    let previous: HashMap<&str, &T> = from.iter().map(|item| (item.id(), item)).collect();
    let target: HashMap<&str, &T> = to.iter().map(|item| (item.id(), item)).collect();
    let mut result = Diff {
        changed: Vec::new(),
        recreated: Vec::new(),
        removed: Vec::new(),
    };
    for item in to {
        match previous.get(item.id()) {
            Some(before) if *before != item => result.changed.push(item.clone()),
            Some(_) => {}
            None => result.recreated.push(item.clone()),
        }
    }
    for item in from {
        if !target.contains_key(item.id()) {
            result.removed.push(item.id().to_string());
        }
    }
    result
}

fn keep_first_error(result: &mut SyncResult<()>, outcome: SyncResult<()>) {
    if let Err(error) = outcome {
        if result.is_ok() {
            *result = Err(error);
        } else {
            tracing::warn!("Additional sync failure: {}", error);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct StoreInner {
    adapter: Arc<dyn StorageAdapter>,
    notifier: Arc<dyn Notifier>,
    options: StoreOptions,
    state: watch::Sender<CanvasState>,
    history: Mutex<History>,
    revision: AtomicU64,
    z_pending: Mutex<BTreeMap<String, i64>>,
    z_timer: Mutex<Option<JoinHandle<()>>>,
    dragging: AtomicBool,
}

#[derive(Clone)]
pub struct CanvasStore {
    inner: Arc<StoreInner>,
}

impl CanvasStore {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        notifier: Arc<dyn Notifier>,
        options: StoreOptions,
    ) -> Self {
        let (state, _) = watch::channel(CanvasState::default());
        Self {
            inner: Arc::new(StoreInner {
                adapter,
                notifier,
                options,
                state,
                history: Mutex::new(History::new(options.history_limit)),
                revision: AtomicU64::new(0),
                z_pending: Mutex::new(BTreeMap::new()),
                z_timer: Mutex::new(None),
                dragging: AtomicBool::new(false),
            }),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        self.inner.adapter.namespace()
    }

    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        self.inner.adapter.clone()
    }

    pub fn state(&self) -> CanvasState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CanvasState> {
        self.inner.state.subscribe()
    }

    /// Increases by one on every observable state change.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.apply(|state| {
            if state.read_only == read_only {
                return false;
            }
            state.read_only = read_only;
            true
        });
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.state.borrow().read_only
    }

    // ----- state plumbing -------------------------------------------------

    fn apply(&self, change: impl FnOnce(&mut CanvasState) -> bool) -> bool {
        let revision = &self.inner.revision;
        self.inner.state.send_if_modified(|state| {
            if !change(state) {
                return false;
            }
            state.revision = revision.fetch_add(1, Ordering::SeqCst) + 1;
            true
        })
    }

    /// Applies an undoable change. `before` defaults to the document as it is
    /// right before `change` runs.
    fn edit_from(
        &self,
        before: Option<CanvasDocument>,
        change: impl FnOnce(&mut CanvasState) -> bool,
    ) -> bool {
        let history = &self.inner.history;
        self.apply(|state| {
            let before = before.unwrap_or_else(|| state.document());
            if !change(state) {
                return false;
            }
            let mut history = lock(history);
            history.record(before);
            state.can_undo = history.can_undo();
            state.can_redo = history.can_redo();
            true
        })
    }

    fn edit(&self, change: impl FnOnce(&mut CanvasState) -> bool) -> bool {
        self.edit_from(None, change)
    }

    fn refuse_read_only(&self, action: &str) -> bool {
        if !self.is_read_only() {
            return false;
        }
        tracing::debug!("Refusing {} on a read-only canvas", action);
        self.inner.notifier.warn(READ_ONLY_MESSAGE);
        true
    }

    fn report_failure(&self, action: &str, error: SyncError) {
        if error.is_quota_exceeded() {
            self.inner.notifier.warn(QUOTA_MESSAGE);
        } else {
            tracing::error!(
                namespace = %self.namespace(),
                code = error.code(),
                "{} failed: {}",
                action,
                error
            );
        }
        let message = format!("{action} failed: {error}");
        self.apply(|state| {
            state.sync_error = Some(message);
            true
        });
    }

    pub fn clear_sync_error(&self) {
        self.apply(|state| state.sync_error.take().is_some());
    }

    fn spawn_sync<F>(&self, action: &'static str, call: F) -> SyncHandle
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let store = self.clone();
        SyncHandle(Some(tokio::spawn(async move {
            match call.await {
                Ok(()) => {}
                Err(error) if error.is_quota_exceeded() => store.roll_back(action, error).await,
                Err(error) => store.report_failure(action, error),
            }
        })))
    }

    /// A write refused for lack of space leaves the adapter as it was, so the
    /// optimistic change is replaced by what the adapter still holds.
    async fn roll_back(&self, action: &str, error: SyncError) {
        let adapter = self.inner.adapter.clone();
        let (notes, images, files, settings) = tokio::join!(
            adapter.get_notes(),
            adapter.get_images(),
            adapter.get_files(),
            adapter.get_settings(),
        );

        self.inner.notifier.warn(QUOTA_MESSAGE);
        let message = format!("{action} failed: {error}");
        let pending = lock(&self.inner.z_pending).clone();
        let mut unreadable = Vec::new();
        self.apply(|state| {
            match notes {
                Ok(mut notes) => {
                    for note in notes.iter_mut() {
                        if let Some(z_index) = pending.get(&note.id) {
                            note.z_index = *z_index;
                        }
                    }
                    state.notes = notes;
                }
                Err(error) => unreadable.push(("notes", error)),
            }
            match images {
                Ok(images) => state.images = images,
                Err(error) => unreadable.push(("images", error)),
            }
            match files {
                Ok(files) => state.files = files,
                Err(error) => unreadable.push(("files", error)),
            }
            match settings {
                Ok(patch) => state.settings.apply(&patch),
                Err(error) => unreadable.push(("settings", error)),
            }
            state.clear_dangling_selection();
            state.sync_error = Some(message);
            true
        });
        for (collection, error) in unreadable {
            tracing::error!(
                namespace = %self.namespace(),
                "Could not reload {} after {} ran out of space: {}",
                collection,
                action,
                error
            );
        }
    }

    // ----- loading --------------------------------------------------------

    /// Shows cached state before any authoritative data has arrived.
    pub fn hydrate(&self, snapshot: CacheSnapshot) {
        self.apply(|state| {
            state.notes = snapshot.notes;
            state.images = snapshot.images;
            state.files = snapshot.files;
            state.settings = snapshot.settings;
            state.clear_dangling_selection();
            true
        });
    }

    /// Loads everything the adapter holds and marks every collection ready.
    /// Used by adapters without a change feed.
    pub async fn load_from_adapter(&self) {
        let adapter = self.inner.adapter.clone();
        let (notes, images, files, settings) = tokio::join!(
            adapter.get_notes(),
            adapter.get_images(),
            adapter.get_files(),
            adapter.get_settings(),
        );

        let mut failures = Vec::new();
        self.apply(|state| {
            match notes {
                Ok(notes) => state.notes = notes,
                Err(error) => failures.push(("load notes", error)),
            }
            match images {
                Ok(images) => state.images = images,
                Err(error) => failures.push(("load images", error)),
            }
            match files {
                Ok(files) => state.files = files,
                Err(error) => failures.push(("load files", error)),
            }
            match settings {
                Ok(patch) => state.settings.apply(&patch),
                Err(error) => failures.push(("load settings", error)),
            }
            state.clear_dangling_selection();
            state.ready = Readiness {
                notes: true,
                images: true,
                files: true,
                settings: true,
            };
            true
        });
        for (action, error) in failures {
            self.report_failure(action, error);
        }
    }

    pub fn mark_ready(&self, kind: CollectionKind) {
        self.apply(|state| state.ready.mark(kind));
    }

    // ----- remote appliers ------------------------------------------------

    /// Replaces the notes with the reconciled remote view. Z-order bumps that
    /// have not been written yet stay in effect.
    pub fn apply_remote_notes(&self, mut notes: Vec<Note>) {
        {
            let pending = lock(&self.inner.z_pending);
            for note in notes.iter_mut() {
                if let Some(z_index) = pending.get(&note.id) {
                    note.z_index = *z_index;
                }
            }
        }
        self.apply(|state| {
            if state.notes == notes {
                return false;
            }
            state.notes = notes;
            state.clear_dangling_selection();
            true
        });
    }

    pub fn apply_remote_images(&self, images: Vec<CanvasImage>) {
        self.apply(|state| {
            if state.images == images {
                return false;
            }
            state.images = images;
            state.clear_dangling_selection();
            true
        });
    }

    pub fn apply_remote_files(&self, files: Vec<CanvasFile>) {
        self.apply(|state| {
            if state.files == files {
                return false;
            }
            state.files = files;
            state.clear_dangling_selection();
            true
        });
    }

    pub fn apply_remote_settings(&self, patch: SettingsPatch) {
        self.apply(|state| {
            let before = state.settings.clone();
            state.settings.apply(&patch);
            let ready = state.ready.mark(CollectionKind::Settings);
            state.settings != before || ready
        });
    }

    // ----- adds -----------------------------------------------------------

    async fn add_entity<T, S>(
        &self,
        action: &'static str,
        save: S,
        build: impl FnOnce(String) -> T,
        items: fn(&mut CanvasState) -> &mut Vec<T>,
        select: fn(String) -> Selection,
    ) -> Option<String>
    where
        T: Entity,
        S: Future<Output = SyncResult<String>>,
    {
        let before = self.inner.state.borrow().document();
        match save.await {
            Ok(id) => {
                let entity = build(id.clone());
                let selected = id.clone();
                self.edit_from(Some(before), |state| {
                    let list = items(state);
                    // A remote echo may have inserted it already.
                    if !list.iter().any(|item| item.id() == entity.id()) {
                        list.push(entity);
                    }
                    state.selection = select(selected);
                    true
                });
                Some(id)
            }
            Err(error) => {
                self.report_failure(action, error);
                None
            }
        }
    }

    /// Adds a default note at `position`, in front of every other note, and
    /// selects it. Returns the new id, or `None` when nothing was added.
    pub async fn add_note(&self, position: Point) -> Option<String> {
        if self.refuse_read_only("add note") {
            return None;
        }
        let z_index = self.inner.state.borrow().max_z_index() + 1;
        let draft = NoteDraft::at(position, z_index);
        let adapter = self.inner.adapter.clone();
        self.add_entity(
            "add note",
            adapter.save_note(draft.clone()),
            |id| draft.into_note(id),
            |state| &mut state.notes,
            Selection::Note,
        )
        .await
    }

    pub async fn add_image(&self, draft: ImageDraft) -> Option<String> {
        if self.refuse_read_only("add image") {
            return None;
        }
        let adapter = self.inner.adapter.clone();
        self.add_entity(
            "add image",
            adapter.save_image(draft.clone()),
            |id| draft.into_image(id),
            |state| &mut state.images,
            Selection::Image,
        )
        .await
    }

    pub async fn add_file(&self, draft: FileDraft) -> Option<String> {
        if self.refuse_read_only("add file") {
            return None;
        }
        let adapter = self.inner.adapter.clone();
        self.add_entity(
            "add file",
            adapter.save_file(draft.clone()),
            |id| draft.into_file(id),
            |state| &mut state.files,
            Selection::File,
        )
        .await
    }

    // ----- updates and deletes --------------------------------------------

    pub fn update_note(&self, id: &str, patch: NotePatch) -> SyncHandle {
        if patch.is_empty() || self.refuse_read_only("update note") {
            return SyncHandle::none();
        }
        let now = crate::models::now_millis();
        self.edit(|state| {
            state
                .notes
                .iter_mut()
                .find(|note| note.id == id)
                .is_some_and(|note| note.apply_patch(&patch, now))
        });
        if patch.z_index.is_some() {
            lock(&self.inner.z_pending).remove(id);
        }
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("update note", async move { adapter.update_note(&id, patch).await })
    }

    pub fn update_image(&self, id: &str, patch: ImagePatch) -> SyncHandle {
        if self.refuse_read_only("update image") {
            return SyncHandle::none();
        }
        self.edit(|state| {
            state
                .images
                .iter_mut()
                .find(|image| image.id == id)
                .is_some_and(|image| image.apply_patch(&patch))
        });
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("update image", async move { adapter.update_image(&id, patch).await })
    }

    pub fn update_file(&self, id: &str, patch: FilePatch) -> SyncHandle {
        if self.refuse_read_only("update file") {
            return SyncHandle::none();
        }
        self.edit(|state| {
            state
                .files
                .iter_mut()
                .find(|file| file.id == id)
                .is_some_and(|file| file.apply_patch(&patch))
        });
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("update file", async move { adapter.update_file(&id, patch).await })
    }

    pub fn delete_note(&self, id: &str) -> SyncHandle {
        if self.refuse_read_only("delete note") {
            return SyncHandle::none();
        }
        self.edit(|state| {
            let before = state.notes.len();
            state.notes.retain(|note| note.id != id);
            let removed = state.notes.len() != before;
            state.clear_dangling_selection();
            removed
        });
        lock(&self.inner.z_pending).remove(id);
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("delete note", async move { adapter.delete_note(&id).await })
    }

    pub fn delete_image(&self, id: &str) -> SyncHandle {
        if self.refuse_read_only("delete image") {
            return SyncHandle::none();
        }
        self.edit(|state| {
            let before = state.images.len();
            state.images.retain(|image| image.id != id);
            let removed = state.images.len() != before;
            state.clear_dangling_selection();
            removed
        });
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("delete image", async move { adapter.delete_image(&id).await })
    }

    pub fn delete_file(&self, id: &str) -> SyncHandle {
        if self.refuse_read_only("delete file") {
            return SyncHandle::none();
        }
        self.edit(|state| {
            let before = state.files.len();
            state.files.retain(|file| file.id != id);
            let removed = state.files.len() != before;
            state.clear_dangling_selection();
            removed
        });
        let adapter = self.inner.adapter.clone();
        let id = id.to_string();
        self.spawn_sync("delete file", async move { adapter.delete_file(&id).await })
    }

    // ----- PDF annotations ------------------------------------------------

    fn edit_pdf(
        &self,
        action: &'static str,
        file_id: &str,
        change: impl FnOnce(&mut Vec<Annotation>) -> bool,
    ) -> SyncHandle {
        if self.refuse_read_only(action) {
            return SyncHandle::none();
        }
        let mut updated = None;
        self.edit(|state| {
            let Some(pdf) = state
                .files
                .iter_mut()
                .find(|file| file.id == file_id)
                .and_then(|file| file.pdf.as_mut())
            else {
                return false;
            };
            if !change(&mut pdf.annotations) {
                return false;
            }
            updated = Some(pdf.clone());
            true
        });
        let Some(pdf) = updated else {
            tracing::warn!("{} on {}: no such PDF or nothing changed", action, file_id);
            return SyncHandle::none();
        };
        let adapter = self.inner.adapter.clone();
        let file_id = file_id.to_string();
        let patch = FilePatch {
            pdf: Some(pdf),
            ..FilePatch::default()
        };
        self.spawn_sync(action, async move { adapter.update_file(&file_id, patch).await })
    }

    pub fn add_annotation(&self, file_id: &str, annotation: Annotation) -> SyncHandle {
        self.edit_pdf("add annotation", file_id, |annotations| {
            if annotations.iter().any(|existing| existing.id == annotation.id) {
                return false;
            }
            annotations.push(annotation);
            true
        })
    }

    pub fn remove_annotation(&self, file_id: &str, annotation_id: &str) -> SyncHandle {
        self.edit_pdf("remove annotation", file_id, |annotations| {
            let before = annotations.len();
            annotations.retain(|annotation| annotation.id != annotation_id);
            annotations.len() != before
        })
    }

    // ----- selection and z-order ------------------------------------------

    /// Selects the note and brings it to the front. The z-order write is
    /// debounced and held back while a drag is in progress.
    pub fn select_note(&self, id: &str) {
        let read_only = self.is_read_only();
        let mut bumped = None;
        self.apply(|state| {
            let max = state.max_z_index();
            let tied_at_max = state
                .notes
                .iter()
                .filter(|note| note.z_index == max)
                .count();
            let Some(note) = state.notes.iter_mut().find(|note| note.id == id) else {
                return false;
            };
            let mut changed = false;
            if !read_only && (note.z_index < max || tied_at_max > 1) {
                note.z_index = max + 1;
                bumped = Some(note.z_index);
                changed = true;
            }
            let selection = Selection::Note(id.to_string());
            if state.selection != selection {
                state.selection = selection;
                changed = true;
            }
            changed
        });
        if let Some(z_index) = bumped {
            lock(&self.inner.z_pending).insert(id.to_string(), z_index);
            self.arm_z_timer();
        }
    }

    pub fn select_image(&self, id: &str) {
        self.apply(|state| {
            if state.image(id).is_none() {
                return false;
            }
            let selection = Selection::Image(id.to_string());
            let changed = state.selection != selection;
            state.selection = selection;
            changed
        });
    }

    pub fn select_file(&self, id: &str) {
        self.apply(|state| {
            if state.file(id).is_none() {
                return false;
            }
            let selection = Selection::File(id.to_string());
            let changed = state.selection != selection;
            state.selection = selection;
            changed
        });
    }

    pub fn clear_selection(&self) {
        self.apply(|state| std::mem::take(&mut state.selection) != Selection::None);
    }

    pub fn set_dragging(&self, dragging: bool) {
        let was_dragging = self.inner.dragging.swap(dragging, Ordering::SeqCst);
        if was_dragging && !dragging && !lock(&self.inner.z_pending).is_empty() {
            self.arm_z_timer();
        }
    }

    fn arm_z_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.options.z_index_debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = CanvasStore { inner }.flush_z_index();
            }
        });
        if let Some(previous) = lock(&self.inner.z_timer).replace(task) {
            previous.abort();
        }
    }

    /// Writes every pending z-order bump unless a drag is in progress.
    fn flush_z_index(&self) -> SyncHandle {
        if self.inner.dragging.load(Ordering::SeqCst) {
            return SyncHandle::none();
        }
        let pending = std::mem::take(&mut *lock(&self.inner.z_pending));
        if pending.is_empty() {
            return SyncHandle::none();
        }
        let adapter = self.inner.adapter.clone();
        self.spawn_sync("persist note order", async move {
            let mut result = Ok(());
            for (id, z_index) in pending {
                keep_first_error(
                    &mut result,
                    adapter.update_note(&id, NotePatch::z_index(z_index)).await,
                );
            }
            result
        })
    }

    /// Stops the z-order timer and forgets unwritten bumps.
    pub fn cancel_pending(&self) {
        if let Some(timer) = lock(&self.inner.z_timer).take() {
            timer.abort();
        }
        lock(&self.inner.z_pending).clear();
    }

    // ----- canvas-wide actions --------------------------------------------

    /// Empties the canvas and resets viewport and selection in one update,
    /// then deletes everything from storage in parallel.
    pub fn clear_canvas(&self) -> SyncHandle {
        if self.refuse_read_only("clear canvas") {
            return SyncHandle::none();
        }
        let mut cleared = None;
        self.edit(|state| {
            let document = state.document();
            let untouched = document == CanvasDocument::default()
                && state.settings.viewport == Viewport::default()
                && state.selection.is_none();
            if untouched {
                return false;
            }
            state.notes.clear();
            state.images.clear();
            state.files.clear();
            state.settings.viewport = Viewport::default();
            state.selection = Selection::None;
            cleared = Some(document);
            true
        });
        let Some(document) = cleared else {
            return SyncHandle::none();
        };
        self.cancel_pending();

        let adapter = self.inner.adapter.clone();
        let mut calls: Vec<BoxFuture<'static, SyncResult<()>>> = Vec::new();
        for note in document.notes {
            let adapter = adapter.clone();
            calls.push(async move { adapter.delete_note(&note.id).await }.boxed());
        }
        for image in document.images {
            let adapter = adapter.clone();
            calls.push(async move { adapter.delete_image(&image.id).await }.boxed());
        }
        for file in document.files {
            let adapter = adapter.clone();
            calls.push(async move { adapter.delete_file(&file.id).await }.boxed());
        }
        calls.push(
            async move {
                adapter
                    .save_settings(SettingsPatch {
                        viewport: Some(Viewport::default()),
                        ..SettingsPatch::default()
                    })
                    .await
            }
            .boxed(),
        );

        self.spawn_sync("clear canvas", async move {
            let mut result = Ok(());
            for outcome in join_all(calls).await {
                keep_first_error(&mut result, outcome);
            }
            result
        })
    }

    // ----- settings -------------------------------------------------------

    fn change_settings(&self, action: &'static str, patch: SettingsPatch) -> SyncHandle {
        let changed = self.apply(|state| {
            let before = state.settings.clone();
            state.settings.apply(&patch);
            state.settings != before
        });
        // Viewers keep their preferences to themselves.
        if !changed || self.is_read_only() {
            return SyncHandle::none();
        }
        let adapter = self.inner.adapter.clone();
        self.spawn_sync(action, async move { adapter.save_settings(patch).await })
    }

    pub fn set_viewport(&self, viewport: Viewport) -> SyncHandle {
        if !viewport.is_valid() {
            tracing::warn!("Ignoring invalid viewport {:?}", viewport);
            return SyncHandle::none();
        }
        self.change_settings(
            "save viewport",
            SettingsPatch {
                viewport: Some(viewport),
                ..SettingsPatch::default()
            },
        )
    }

    pub fn set_dark_mode(&self, dark_mode: bool) -> SyncHandle {
        self.change_settings(
            "save dark mode",
            SettingsPatch {
                dark_mode: Some(dark_mode),
                ..SettingsPatch::default()
            },
        )
    }

    pub fn set_language(&self, language: impl Into<String>) -> SyncHandle {
        self.change_settings(
            "save language",
            SettingsPatch {
                language: Some(language.into()),
                ..SettingsPatch::default()
            },
        )
    }

    // ----- undo / redo ----------------------------------------------------

    pub fn undo(&self) -> SyncHandle {
        self.step_history("undo", |history, current| history.undo(current))
    }

    pub fn redo(&self) -> SyncHandle {
        self.step_history("redo", |history, current| history.redo(current))
    }

    fn step_history(
        &self,
        action: &'static str,
        step: impl FnOnce(&mut History, CanvasDocument) -> Option<CanvasDocument>,
    ) -> SyncHandle {
        if self.refuse_read_only(action) {
            return SyncHandle::none();
        }
        let history = &self.inner.history;
        let mut transition = None;
        self.apply(|state| {
            let current = state.document();
            let mut history = lock(history);
            let Some(target) = step(&mut history, current.clone()) else {
                return false;
            };
            state.restore(target.clone());
            state.can_undo = history.can_undo();
            state.can_redo = history.can_redo();
            transition = Some((current, target));
            true
        });
        match transition {
            Some((from, to)) => self.persist_transition(action, from, to),
            None => SyncHandle::none(),
        }
    }

    /// Brings storage in line with a document restored by undo or redo.
    /// Entities that storage no longer has are saved again under new ids.
    fn persist_transition(
        &self,
        action: &'static str,
        from: CanvasDocument,
        to: CanvasDocument,
    ) -> SyncHandle {
        let notes = diff(&from.notes, &to.notes);
        let images = diff(&from.images, &to.images);
        let files = diff(&from.files, &to.files);
        if notes.is_empty() && images.is_empty() && files.is_empty() {
            return SyncHandle::none();
        }

        let store = self.clone();
        self.spawn_sync(action, async move {
            let adapter = store.inner.adapter.clone();
            let mut result = Ok(());

            for note in &notes.changed {
                keep_first_error(
                    &mut result,
                    adapter.update_note(&note.id, NotePatch::from(note)).await,
                );
            }
            for id in &notes.removed {
                keep_first_error(&mut result, adapter.delete_note(id).await);
            }
            for note in &notes.recreated {
                match adapter.save_note(NoteDraft::from(note)).await {
                    Ok(id) => store.remap_id(CollectionKind::Notes, &note.id, id),
                    Err(error) => keep_first_error(&mut result, Err(error)),
                }
            }

            for image in &images.changed {
                keep_first_error(
                    &mut result,
                    adapter.update_image(&image.id, ImagePatch::from(image)).await,
                );
            }
            for id in &images.removed {
                keep_first_error(&mut result, adapter.delete_image(id).await);
            }
            for image in &images.recreated {
                match adapter.save_image(ImageDraft::from(image)).await {
                    Ok(id) => store.remap_id(CollectionKind::Images, &image.id, id),
                    Err(error) => keep_first_error(&mut result, Err(error)),
                }
            }

            for file in &files.changed {
                keep_first_error(
                    &mut result,
                    adapter.update_file(&file.id, FilePatch::from(file)).await,
                );
            }
            for id in &files.removed {
                keep_first_error(&mut result, adapter.delete_file(id).await);
            }
            for file in &files.recreated {
                match adapter.save_file(FileDraft::from(file)).await {
                    Ok(id) => store.remap_id(CollectionKind::Files, &file.id, id),
                    Err(error) => keep_first_error(&mut result, Err(error)),
                }
            }

            result
        })
    }

    fn remap_id(&self, kind: CollectionKind, old: &str, new: String) {
        self.apply(|state| {
            let found = match kind {
                CollectionKind::Notes => state
                    .notes
                    .iter_mut()
                    .find(|note| note.id == old)
                    .map(|note| note.id = new.clone())
                    .is_some(),
                CollectionKind::Images => state
                    .images
                    .iter_mut()
                    .find(|image| image.id == old)
                    .map(|image| image.id = new.clone())
                    .is_some(),
                CollectionKind::Files => state
                    .files
                    .iter_mut()
                    .find(|file| file.id == old)
                    .map(|file| file.id = new.clone())
                    .is_some(),
                CollectionKind::Settings => false,
            };
            if !found {
                return false;
            }
            let selected = match (&state.selection, kind) {
                (Selection::Note(id), CollectionKind::Notes)
                | (Selection::Image(id), CollectionKind::Images)
                | (Selection::File(id), CollectionKind::Files) => id == old,
                _ => false,
            };
            if selected {
                state.selection = match kind {
                    CollectionKind::Notes => Selection::Note(new),
                    CollectionKind::Images => Selection::Image(new),
                    _ => Selection::File(new),
                };
            }
            true
        });
    }
}
