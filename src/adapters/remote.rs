use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    adapters::{ChangeHandler, CollectionChange, Delta, StorageAdapter},
    dto::wire::{
        self, SETTINGS_COLLECTION, SETTINGS_RECORD_ID, WireFile, WireImage, WireNote,
    },
    error::{DecodeError, SyncError, SyncResult},
    models::{
        CanvasFile, CanvasImage, Entity, FileDraft, FilePatch, ImageDraft, ImagePatch, Namespace,
        Note, NoteDraft, NotePatch, SettingsPatch, now_millis,
    },
    realtime::{
        backend::{ChangeStream, RealtimeBackend, RemoteChange},
        subscription::Subscription,
    },
};

type Decoder<T> = fn(&str, Value) -> Result<T, DecodeError>;

/// Adapter over the hosted realtime store for a user's private canvas or a
/// shared canvas. Keeps an `id -> entity` mirror per collection, fed by its
/// own writes and by subscriptions.
pub struct RemoteAdapter {
    namespace: Namespace,
    root: String,
    backend: Arc<dyn RealtimeBackend>,
    notes: Arc<DashMap<String, Note>>,
    images: Arc<DashMap<String, CanvasImage>>,
    files: Arc<DashMap<String, CanvasFile>>,
}

impl RemoteAdapter {
    pub fn new(namespace: Namespace, backend: Arc<dyn RealtimeBackend>) -> SyncResult<Self> {
        let root = namespace.remote_root().ok_or_else(|| {
            SyncError::Unconfigured(format!("{namespace} has no remote location"))
        })?;
        Ok(Self {
            namespace,
            root,
            backend,
            notes: Arc::new(DashMap::new()),
            images: Arc::new(DashMap::new()),
            files: Arc::new(DashMap::new()),
        })
    }

    fn path(&self, collection: &str) -> String {
        format!("{}/{}", self.root, collection)
    }

    pub fn backend(&self) -> Arc<dyn RealtimeBackend> {
        self.backend.clone()
    }

    async fn fetch_all<T: Entity>(
        &self,
        mirror: &DashMap<String, T>,
        decode: Decoder<T>,
    ) -> SyncResult<Vec<T>> {
        let records = self.backend.fetch(&self.path(T::COLLECTION)).await?;
        let mut entities = Vec::with_capacity(records.len());
        for (key, value) in records {
            match decode(&key, value) {
                Ok(entity) => entities.push(entity),
                Err(error) => tracing::warn!("Skipping remote record: {}", error),
            }
        }
        mirror.clear();
        for entity in &entities {
            mirror.insert(entity.id().to_string(), entity.clone());
        }
        Ok(entities)
    }

    async fn update_record<T: Entity>(
        &self,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> SyncResult<bool> {
        let existed = self
            .backend
            .update(&self.path(T::COLLECTION), id, fields)
            .await?;
        if !existed {
            tracing::warn!(
                "update of {} {} in {}: no such record",
                T::COLLECTION,
                id,
                self.namespace
            );
        }
        Ok(existed)
    }

    async fn delete_record<T: Entity>(&self, id: &str, mirror: &DashMap<String, T>) -> SyncResult<()> {
        self.backend.remove(&self.path(T::COLLECTION), id).await?;
        if mirror.remove(id).is_none() {
            tracing::debug!(
                "delete of {} {} in {}: already gone",
                T::COLLECTION,
                id,
                self.namespace
            );
        }
        Ok(())
    }
}

fn spawn_collection_listener<T: Entity>(
    mut stream: ChangeStream,
    mirror: Arc<DashMap<String, T>>,
    decode: Decoder<T>,
    wrap: fn(Delta<T>) -> CollectionChange,
    handler: Arc<dyn ChangeHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = stream.recv().await {
            match change {
                RemoteChange::Added { key, value } | RemoteChange::Changed { key, value } => {
                    match decode(&key, value) {
                        Ok(entity) => {
                            mirror.insert(key, entity.clone());
                            handler.on_change(wrap(Delta::Added(entity)));
                        }
                        Err(error) => tracing::warn!("Dropping remote change: {}", error),
                    }
                }
                RemoteChange::Removed { key } => {
                    mirror.remove(&key);
                    handler.on_change(wrap(Delta::Removed(key)));
                }
            }
        }
    })
}

fn spawn_settings_listener(mut stream: ChangeStream, handler: Arc<dyn ChangeHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = stream.recv().await {
            let value = match change {
                RemoteChange::Added { key, value } | RemoteChange::Changed { key, value }
                    if key == SETTINGS_RECORD_ID =>
                {
                    value
                }
                _ => continue,
            };
            match wire::decode_settings(value) {
                Ok(patch) => handler.on_change(CollectionChange::Settings(patch)),
                Err(error) => tracing::warn!("Dropping remote settings change: {}", error),
            }
        }
    })
}

#[async_trait]
impl StorageAdapter for RemoteAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn save_note(&self, draft: NoteDraft) -> SyncResult<String> {
        let value = wire::encode(&WireNote::from(&draft))?;
        let id = self.backend.push(&self.path(Note::COLLECTION), value).await?;
        self.notes.insert(id.clone(), draft.into_note(id.clone()));
        Ok(id)
    }

    async fn update_note(&self, id: &str, patch: NotePatch) -> SyncResult<()> {
        let updated_at = now_millis();
        let fields = wire::encode_note_patch(&patch, updated_at);
        if self.update_record::<Note>(id, fields).await? {
            if let Some(mut note) = self.notes.get_mut(id) {
                note.apply_patch(&patch, updated_at);
            }
        }
        Ok(())
    }

    async fn delete_note(&self, id: &str) -> SyncResult<()> {
        self.delete_record(id, &*self.notes).await
    }

    async fn get_notes(&self) -> SyncResult<Vec<Note>> {
        self.fetch_all(&*self.notes, wire::decode_note).await
    }

    async fn save_image(&self, draft: ImageDraft) -> SyncResult<String> {
        let value = wire::encode(&WireImage::from(&draft))?;
        let id = self
            .backend
            .push(&self.path(CanvasImage::COLLECTION), value)
            .await?;
        self.images.insert(id.clone(), draft.into_image(id.clone()));
        Ok(id)
    }

    async fn update_image(&self, id: &str, patch: ImagePatch) -> SyncResult<()> {
        let fields = wire::encode_image_patch(&patch);
        if fields.is_empty() {
            return Ok(());
        }
        if self.update_record::<CanvasImage>(id, fields).await? {
            if let Some(mut image) = self.images.get_mut(id) {
                image.apply_patch(&patch);
            }
        }
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> SyncResult<()> {
        self.delete_record(id, &*self.images).await
    }

    async fn get_images(&self) -> SyncResult<Vec<CanvasImage>> {
        self.fetch_all(&*self.images, wire::decode_image).await
    }

    async fn save_file(&self, draft: FileDraft) -> SyncResult<String> {
        let value = wire::encode(&WireFile::from(&draft))?;
        let id = self
            .backend
            .push(&self.path(CanvasFile::COLLECTION), value)
            .await?;
        self.files.insert(id.clone(), draft.into_file(id.clone()));
        Ok(id)
    }

    async fn update_file(&self, id: &str, patch: FilePatch) -> SyncResult<()> {
        let fields = wire::encode_file_patch(&patch)?;
        if fields.is_empty() {
            return Ok(());
        }
        if self.update_record::<CanvasFile>(id, fields).await? {
            if let Some(mut file) = self.files.get_mut(id) {
                file.apply_patch(&patch);
            }
        }
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> SyncResult<()> {
        self.delete_record(id, &*self.files).await
    }

    async fn get_files(&self) -> SyncResult<Vec<CanvasFile>> {
        self.fetch_all(&*self.files, wire::decode_file).await
    }

    async fn save_settings(&self, patch: SettingsPatch) -> SyncResult<()> {
        let fields = wire::encode_settings_patch(&patch)?;
        if fields.is_empty() {
            return Ok(());
        }
        let path = self.path(SETTINGS_COLLECTION);
        if !self
            .backend
            .update(&path, SETTINGS_RECORD_ID, fields.clone())
            .await?
        {
            self.backend
                .set(&path, SETTINGS_RECORD_ID, Value::Object(fields))
                .await?;
        }
        Ok(())
    }

    async fn get_settings(&self) -> SyncResult<SettingsPatch> {
        let records = self.backend.fetch(&self.path(SETTINGS_COLLECTION)).await?;
        match records
            .into_iter()
            .find(|(key, _)| key == SETTINGS_RECORD_ID)
        {
            Some((_, value)) => Ok(wire::decode_settings(value)?),
            None => Ok(SettingsPatch::default()),
        }
    }

    async fn subscribe_to_changes(
        &self,
        handler: Arc<dyn ChangeHandler>,
    ) -> SyncResult<Option<Subscription>> {
        let tasks = vec![
            spawn_collection_listener(
                self.backend.listen(&self.path(Note::COLLECTION)),
                self.notes.clone(),
                wire::decode_note,
                CollectionChange::Notes,
                handler.clone(),
            ),
            spawn_collection_listener(
                self.backend.listen(&self.path(CanvasImage::COLLECTION)),
                self.images.clone(),
                wire::decode_image,
                CollectionChange::Images,
                handler.clone(),
            ),
            spawn_collection_listener(
                self.backend.listen(&self.path(CanvasFile::COLLECTION)),
                self.files.clone(),
                wire::decode_file,
                CollectionChange::Files,
                handler.clone(),
            ),
            spawn_settings_listener(self.backend.listen(&self.path(SETTINGS_COLLECTION)), handler),
        ];
        Ok(Some(Subscription::new(self.root.clone(), tasks)))
    }

    async fn cleanup(&self) {
        self.notes.clear();
        self.images.clear();
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{models::Point, realtime::backend::MemoryBackend};

    fn remote(backend: &MemoryBackend) -> RemoteAdapter {
        RemoteAdapter::new(Namespace::User("u1".to_string()), Arc::new(backend.clone()))
            .expect("remote namespace")
    }

    #[test]
    fn local_namespace_has_no_remote_adapter() {
        let result = RemoteAdapter::new(Namespace::Local, Arc::new(MemoryBackend::new()));
        assert!(matches!(result, Err(SyncError::Unconfigured(_))));
    }

    #[tokio::test]
    async fn notes_round_trip_through_the_backend() {
        let backend = MemoryBackend::new();
        let adapter = remote(&backend);

        let id = adapter
            .save_note(NoteDraft::at(Point::new(100.0, 100.0), 4))
            .await
            .expect("save");
        adapter
            .update_note(&id, NotePatch::content("remote"))
            .await
            .expect("update");

        let stored = backend.fetch("users/u1/notes").await.expect("fetch");
        assert!(stored[0].1["updatedAt"].is_i64());

        let notes = adapter.get_notes().await.expect("notes");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, id);
        assert_eq!(notes[0].content, "remote");
        assert_eq!(notes[0].z_index, 4);
    }

    #[tokio::test]
    async fn missing_records_are_not_errors() {
        let backend = MemoryBackend::new();
        let adapter = remote(&backend);
        adapter
            .update_note("ghost", NotePatch::content("x"))
            .await
            .expect("update of missing record");
        adapter.delete_note("ghost").await.expect("delete");
        adapter.delete_note("ghost").await.expect("delete again");
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_on_fetch() {
        let backend = MemoryBackend::new();
        backend
            .set("users/u1/notes", "bad", json!({"x": "left"}))
            .await
            .expect("set");
        let adapter = remote(&backend);
        adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 1))
            .await
            .expect("save");
        assert_eq!(adapter.get_notes().await.expect("notes").len(), 1);
    }

    #[tokio::test]
    async fn offline_writes_fail_with_remote_error() {
        let backend = MemoryBackend::new();
        let adapter = remote(&backend);
        backend.set_online(false);
        let error = adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 1))
            .await
            .expect_err("offline");
        assert!(matches!(error, SyncError::Remote(_)));
    }

    #[tokio::test]
    async fn settings_record_is_created_then_merged() {
        let backend = MemoryBackend::new();
        let adapter = remote(&backend);
        adapter
            .save_settings(SettingsPatch {
                dark_mode: Some(true),
                ..SettingsPatch::default()
            })
            .await
            .expect("create");
        adapter
            .save_settings(SettingsPatch {
                language: Some("vi".to_string()),
                ..SettingsPatch::default()
            })
            .await
            .expect("merge");

        let settings = adapter.get_settings().await.expect("settings");
        assert_eq!(settings.dark_mode, Some(true));
        assert_eq!(settings.language.as_deref(), Some("vi"));
    }

    #[tokio::test]
    async fn subscription_fans_in_all_collections_until_closed() {
        let backend = MemoryBackend::new();
        let adapter = remote(&backend);
        let existing = adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 1))
            .await
            .expect("save");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn ChangeHandler> = Arc::new(move |change: CollectionChange| {
            let _ = tx.send(change);
        });
        let subscription = adapter
            .subscribe_to_changes(handler)
            .await
            .expect("subscribe")
            .expect("remote adapters subscribe");

        match rx.recv().await.expect("flood") {
            CollectionChange::Notes(Delta::Added(note)) => assert_eq!(note.id, existing),
            other => panic!("unexpected change {other:?}"),
        }

        adapter
            .save_settings(SettingsPatch {
                dark_mode: Some(true),
                ..SettingsPatch::default()
            })
            .await
            .expect("settings");
        match rx.recv().await.expect("settings change") {
            CollectionChange::Settings(patch) => assert_eq!(patch.dark_mode, Some(true)),
            other => panic!("unexpected change {other:?}"),
        }

        adapter.delete_note(&existing).await.expect("delete");
        assert_eq!(
            rx.recv().await.expect("removal"),
            CollectionChange::Notes(Delta::Removed(existing))
        );

        assert!(subscription.close());
        tokio::task::yield_now().await;
        adapter
            .save_note(NoteDraft::at(Point::new(0.0, 0.0), 2))
            .await
            .expect("save");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
