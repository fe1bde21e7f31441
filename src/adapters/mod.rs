//! Storage adapters: one contract, a device-local and a remote implementation.

pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::SyncResult,
    models::{
        CanvasFile, CanvasImage, FileDraft, FilePatch, ImageDraft, ImagePatch, Namespace, Note,
        NoteDraft, NotePatch, SettingsPatch,
    },
    realtime::subscription::Subscription,
};

pub use local::LocalAdapter;
pub use remote::RemoteAdapter;

/// Incremental change for one entity. A changed record arrives as `Added`
/// carrying the full replacement.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    Added(T),
    Removed(String),
}

impl<T: crate::models::Entity> Delta<T> {
    pub fn id(&self) -> &str {
        match self {
            Delta::Added(entity) => entity.id(),
            Delta::Removed(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange {
    Notes(Delta<Note>),
    Images(Delta<CanvasImage>),
    Files(Delta<CanvasFile>),
    Settings(SettingsPatch),
}

/// Receives every change of a subscription, across all four collections.
pub trait ChangeHandler: Send + Sync {
    fn on_change(&self, change: CollectionChange);
}

impl<F> ChangeHandler for F
where
    F: Fn(CollectionChange) + Send + Sync,
{
    fn on_change(&self, change: CollectionChange) {
        self(change)
    }
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    async fn save_note(&self, draft: NoteDraft) -> SyncResult<String>;
    async fn update_note(&self, id: &str, patch: NotePatch) -> SyncResult<()>;
    async fn delete_note(&self, id: &str) -> SyncResult<()>;
    async fn get_notes(&self) -> SyncResult<Vec<Note>>;

    async fn save_image(&self, draft: ImageDraft) -> SyncResult<String>;
    async fn update_image(&self, id: &str, patch: ImagePatch) -> SyncResult<()>;
    async fn delete_image(&self, id: &str) -> SyncResult<()>;
    async fn get_images(&self) -> SyncResult<Vec<CanvasImage>>;

    async fn save_file(&self, draft: FileDraft) -> SyncResult<String>;
    async fn update_file(&self, id: &str, patch: FilePatch) -> SyncResult<()>;
    async fn delete_file(&self, id: &str) -> SyncResult<()>;
    async fn get_files(&self) -> SyncResult<Vec<CanvasFile>>;

    async fn save_settings(&self, patch: SettingsPatch) -> SyncResult<()>;
    async fn get_settings(&self) -> SyncResult<SettingsPatch>;

    /// Live change feed. Adapters without one return `None`.
    async fn subscribe_to_changes(
        &self,
        _handler: Arc<dyn ChangeHandler>,
    ) -> SyncResult<Option<Subscription>> {
        Ok(None)
    }

    /// Releases whatever the adapter holds. Safe to call more than once.
    async fn cleanup(&self) {}
}
