use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    adapters::StorageAdapter,
    dto::cache::LocalBlob,
    error::{SyncError, SyncResult},
    models::{
        CanvasFile, CanvasImage, Entity, FileDraft, FilePatch, ImageDraft, ImagePatch, Namespace,
        Note, NoteDraft, NotePatch, SettingsPatch, now_millis,
    },
    repositories::fallback::KeyValueStore,
    telemetry::SyncEvent,
};

const LOCAL_KEY_PREFIX: &str = "canvas-local";

/// `prefix-<epoch ms>-<random>`.
pub fn generate_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}-{}-{}",
        Utc::now().timestamp_millis(),
        &random[..9]
    )
}

fn position_of<T: Entity>(items: &[T], id: &str) -> Option<usize> {
    items.iter().position(|item| item.id() == id)
}

/// Device-local adapter. The whole canvas of a namespace is one JSON blob in
/// the key-value tier, rewritten on every change.
pub struct LocalAdapter {
    namespace: Namespace,
    key: String,
    store: Arc<dyn KeyValueStore>,
    blob: Mutex<LocalBlob>,
}

impl LocalAdapter {
    /// Loads the namespace's blob from `store`. An unreadable blob is logged
    /// and replaced by an empty canvas.
    pub fn open(namespace: Namespace, store: Arc<dyn KeyValueStore>) -> Self {
        let key = format!("{LOCAL_KEY_PREFIX}:{}", namespace.cache_key());
        let blob = match store.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<LocalBlob>(&raw) {
                Ok(blob) => blob,
                Err(error) => {
                    tracing::warn!("Ignoring unreadable local canvas {}: {}", key, error);
                    LocalBlob::default()
                }
            },
            Ok(None) => LocalBlob::default(),
            Err(error) => {
                tracing::warn!("Failed to read local canvas {}: {}", key, error);
                LocalBlob::default()
            }
        };

        Self {
            namespace,
            key,
            store,
            blob: Mutex::new(blob),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalBlob> {
        match self.blob.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `change` against the blob and persists it when it reports a change.
    /// A failed write restores the blob as it was before `change`.
    fn mutate(&self, operation: &str, change: impl FnOnce(&mut LocalBlob) -> bool) -> SyncResult<bool> {
        let mut blob = self.lock();
        let previous = blob.clone();
        if !change(&mut blob) {
            return Ok(false);
        }

        let result = serde_json::to_string(&*blob)
            .map_err(SyncError::from)
            .and_then(|payload| self.store.set(&self.key, &payload));
        match result {
            Ok(()) => Ok(true),
            Err(error) => {
                *blob = previous;
                if error.is_quota_exceeded() {
                    SyncEvent::QuotaExceeded {
                        namespace: self.namespace.cache_key(),
                        tier: "local".to_string(),
                    }
                    .log();
                } else {
                    tracing::error!("Local {} failed for {}: {}", operation, self.key, error);
                }
                Err(error)
            }
        }
    }

    fn warn_missing(&self, operation: &str, collection: &str, id: &str) {
        tracing::warn!(
            "{} of {} {} in {}: no such record",
            operation,
            collection,
            id,
            self.namespace
        );
    }
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn save_note(&self, draft: NoteDraft) -> SyncResult<String> {
        let id = generate_id("note");
        let note = draft.into_note(id.clone());
        self.mutate("save_note", |blob| {
            blob.notes.push(note);
            true
        })?;
        Ok(id)
    }

    async fn update_note(&self, id: &str, patch: NotePatch) -> SyncResult<()> {
        let mut missing = false;
        self.mutate("update_note", |blob| match position_of(&blob.notes, id) {
            Some(index) => blob.notes[index].apply_patch(&patch, now_millis()),
            None => {
                missing = true;
                false
            }
        })?;
        if missing {
            self.warn_missing("update", Note::COLLECTION, id);
        }
        Ok(())
    }

    async fn delete_note(&self, id: &str) -> SyncResult<()> {
        let removed = self.mutate("delete_note", |blob| match position_of(&blob.notes, id) {
            Some(index) => {
                blob.notes.remove(index);
                true
            }
            None => false,
        })?;
        if !removed {
            tracing::debug!("delete of {} {} in {}: already gone", Note::COLLECTION, id, self.namespace);
        }
        Ok(())
    }

    async fn get_notes(&self) -> SyncResult<Vec<Note>> {
        Ok(self.lock().notes.clone())
    }

    async fn save_image(&self, draft: ImageDraft) -> SyncResult<String> {
        let id = generate_id("image");
        let image = draft.into_image(id.clone());
        self.mutate("save_image", |blob| {
            blob.images.push(image);
            true
        })?;
        Ok(id)
    }

    async fn update_image(&self, id: &str, patch: ImagePatch) -> SyncResult<()> {
        let mut missing = false;
        self.mutate("update_image", |blob| match position_of(&blob.images, id) {
            Some(index) => blob.images[index].apply_patch(&patch),
            None => {
                missing = true;
                false
            }
        })?;
        if missing {
            self.warn_missing("update", CanvasImage::COLLECTION, id);
        }
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> SyncResult<()> {
        let removed = self.mutate("delete_image", |blob| match position_of(&blob.images, id) {
            Some(index) => {
                blob.images.remove(index);
                true
            }
            None => false,
        })?;
        if !removed {
            tracing::debug!("delete of {} {} in {}: already gone", CanvasImage::COLLECTION, id, self.namespace);
        }
        Ok(())
    }

    async fn get_images(&self) -> SyncResult<Vec<CanvasImage>> {
        Ok(self.lock().images.clone())
    }

    async fn save_file(&self, draft: FileDraft) -> SyncResult<String> {
        let id = generate_id("file");
        let file = draft.into_file(id.clone());
        self.mutate("save_file", |blob| {
            blob.files.push(file);
            true
        })?;
        Ok(id)
    }

    async fn update_file(&self, id: &str, patch: FilePatch) -> SyncResult<()> {
        let mut missing = false;
        self.mutate("update_file", |blob| match position_of(&blob.files, id) {
            Some(index) => blob.files[index].apply_patch(&patch),
            None => {
                missing = true;
                false
            }
        })?;
        if missing {
            self.warn_missing("update", CanvasFile::COLLECTION, id);
        }
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> SyncResult<()> {
        let removed = self.mutate("delete_file", |blob| match position_of(&blob.files, id) {
            Some(index) => {
                blob.files.remove(index);
                true
            }
            None => false,
        })?;
        if !removed {
            tracing::debug!("delete of {} {} in {}: already gone", CanvasFile::COLLECTION, id, self.namespace);
        }
        Ok(())
    }

    async fn get_files(&self) -> SyncResult<Vec<CanvasFile>> {
        Ok(self.lock().files.clone())
    }

    async fn save_settings(&self, patch: SettingsPatch) -> SyncResult<()> {
        self.mutate("save_settings", |blob| {
            let before = blob.settings.clone();
            blob.settings.apply(&patch);
            blob.settings != before
        })?;
        Ok(())
    }

    async fn get_settings(&self) -> SyncResult<SettingsPatch> {
        Ok(self.lock().settings.to_patch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Point, Size, Viewport},
        repositories::fallback::MemoryKeyValueStore,
    };

    fn adapter(quota: usize) -> (LocalAdapter, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new(quota));
        (LocalAdapter::open(Namespace::Local, store.clone()), store)
    }

    #[test]
    fn generated_ids_carry_prefix_and_timestamp() {
        let id = generate_id("note");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "note");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(generate_id("note"), generate_id("note"));
    }

    #[tokio::test]
    async fn saved_notes_survive_reopen() {
        let (adapter, store) = adapter(1024 * 1024);
        let id = adapter
            .save_note(NoteDraft::at(Point::new(100.0, 100.0), 1))
            .await
            .expect("save");
        adapter
            .update_note(&id, NotePatch::content("hello"))
            .await
            .expect("update");

        let reopened = LocalAdapter::open(Namespace::Local, store);
        let notes = reopened.get_notes().await.expect("notes");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, id);
        assert_eq!(notes[0].content, "hello");
    }

    #[tokio::test]
    async fn delete_twice_matches_delete_once() {
        let (adapter, _) = adapter(1024 * 1024);
        let keep = adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 1))
            .await
            .expect("save");
        let gone = adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 2))
            .await
            .expect("save");

        adapter.delete_note(&gone).await.expect("first delete");
        let once = adapter.get_notes().await.expect("notes");
        adapter.delete_note(&gone).await.expect("second delete is not an error");
        let twice = adapter.get_notes().await.expect("notes");

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(twice[0].id, keep);
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_a_no_op() {
        let (adapter, store) = adapter(1024 * 1024);
        adapter
            .update_image("missing", ImagePatch::default())
            .await
            .expect("not an error");
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn quota_failure_rolls_back_the_image() {
        let (adapter, _) = adapter(1024);
        let huge = format!("data:image/png;base64,{}", "A".repeat(4000));
        let draft = ImageDraft::new(Point::new(0.0, 0.0), Size::new(800.0, 600.0), huge, "big.png", 1500);

        let error = adapter.save_image(draft).await.expect_err("over quota");
        assert!(error.is_quota_exceeded());
        assert!(adapter.get_images().await.expect("images").is_empty());

        // The adapter keeps working for writes that fit.
        adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 1))
            .await
            .expect("small note fits");
    }

    #[tokio::test]
    async fn settings_merge_and_ignore_invalid_viewport() {
        let (adapter, _) = adapter(1024 * 1024);
        adapter
            .save_settings(SettingsPatch {
                dark_mode: Some(true),
                ..SettingsPatch::default()
            })
            .await
            .expect("save");
        adapter
            .save_settings(SettingsPatch {
                viewport: Some(Viewport {
                    x: 1.0,
                    y: 2.0,
                    scale: 0.0,
                }),
                ..SettingsPatch::default()
            })
            .await
            .expect("save");

        let settings = adapter.get_settings().await.expect("settings");
        assert_eq!(settings.dark_mode, Some(true));
        assert_eq!(settings.viewport, Some(Viewport::default()));
    }
}
