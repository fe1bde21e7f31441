//! Hosted realtime database boundary.
//!
//! Records live under collection paths such as `users/{uid}/notes`, keyed by
//! push ids. Listeners receive child events, starting with one `Added` event
//! per existing child.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Added { key: String, value: Value },
    Changed { key: String, value: Value },
    Removed { key: String },
}

impl RemoteChange {
    pub fn key(&self) -> &str {
        match self {
            RemoteChange::Added { key, .. }
            | RemoteChange::Changed { key, .. }
            | RemoteChange::Removed { key } => key,
        }
    }
}

pub type ChangeStream = mpsc::UnboundedReceiver<RemoteChange>;

#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Stores `value` under a freshly generated key and returns the key.
    async fn push(&self, path: &str, value: Value) -> SyncResult<String>;

    /// Creates or replaces the record at `path/key`.
    async fn set(&self, path: &str, key: &str, value: Value) -> SyncResult<()>;

    /// Merges `fields` into the record at `path/key`. Returns false when there
    /// is no such record.
    async fn update(&self, path: &str, key: &str, fields: Map<String, Value>) -> SyncResult<bool>;

    async fn remove(&self, path: &str, key: &str) -> SyncResult<()>;

    async fn fetch(&self, path: &str) -> SyncResult<Vec<(String, Value)>>;

    fn listen(&self, path: &str) -> ChangeStream;

    /// Online/offline status of this connection.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

struct Listener {
    tx: mpsc::UnboundedSender<RemoteChange>,
    online: watch::Receiver<bool>,
}

#[derive(Default)]
struct PathState {
    children: BTreeMap<String, Value>,
    listeners: Vec<Listener>,
}

impl PathState {
    fn broadcast(&mut self, change: RemoteChange) {
        self.listeners.retain(|listener| !listener.tx.is_closed());
        for listener in &self.listeners {
            // A disconnected client misses whatever happens meanwhile.
            if *listener.online.borrow() {
                let _ = listener.tx.send(change.clone());
            }
        }
    }
}

/// In-process realtime database. Every connection made with
/// [`MemoryBackend::connect_peer`] shares the same data but has its own
/// connectivity, so two clients can collaborate and go offline independently.
#[derive(Clone)]
pub struct MemoryBackend {
    paths: Arc<DashMap<String, PathState>>,
    online: Arc<watch::Sender<bool>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            paths: Arc::new(DashMap::new()),
            online: Arc::new(online),
        }
    }

    /// A second connection to the same data.
    pub fn connect_peer(&self) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            paths: self.paths.clone(),
            online: Arc::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn child_count(&self, path: &str) -> usize {
        self.paths
            .get(path)
            .map(|state| state.children.len())
            .unwrap_or(0)
    }

    fn ensure_online(&self, operation: &str, path: &str) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Remote(format!("{operation} {path}: client is offline")))
        }
    }
}

#[async_trait]
impl RealtimeBackend for MemoryBackend {
    async fn push(&self, path: &str, value: Value) -> SyncResult<String> {
        self.ensure_online("push", path)?;
        let key = Uuid::now_v7().simple().to_string();
        let mut state = self.paths.entry(path.to_string()).or_default();
        state.children.insert(key.clone(), value.clone());
        state.broadcast(RemoteChange::Added {
            key: key.clone(),
            value,
        });
        Ok(key)
    }

    async fn set(&self, path: &str, key: &str, value: Value) -> SyncResult<()> {
        self.ensure_online("set", path)?;
        let mut state = self.paths.entry(path.to_string()).or_default();
        let existed = state
            .children
            .insert(key.to_string(), value.clone())
            .is_some();
        let key = key.to_string();
        state.broadcast(if existed {
            RemoteChange::Changed { key, value }
        } else {
            RemoteChange::Added { key, value }
        });
        Ok(())
    }

    async fn update(&self, path: &str, key: &str, fields: Map<String, Value>) -> SyncResult<bool> {
        self.ensure_online("update", path)?;
        let Some(mut state) = self.paths.get_mut(path) else {
            return Ok(false);
        };
        let Some(Value::Object(record)) = state.children.get_mut(key) else {
            return Ok(false);
        };
        for (field, value) in fields {
            if value.is_null() {
                record.remove(&field);
            } else {
                record.insert(field, value);
            }
        }
        let value = Value::Object(record.clone());
        state.broadcast(RemoteChange::Changed {
            key: key.to_string(),
            value,
        });
        Ok(true)
    }

    async fn remove(&self, path: &str, key: &str) -> SyncResult<()> {
        self.ensure_online("remove", path)?;
        if let Some(mut state) = self.paths.get_mut(path) {
            if state.children.remove(key).is_some() {
                state.broadcast(RemoteChange::Removed {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn fetch(&self, path: &str) -> SyncResult<Vec<(String, Value)>> {
        self.ensure_online("fetch", path)?;
        Ok(self
            .paths
            .get(path)
            .map(|state| {
                state
                    .children
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn listen(&self, path: &str) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.paths.entry(path.to_string()).or_default();
        if self.is_online() {
            for (key, value) in &state.children {
                let _ = tx.send(RemoteChange::Added {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        state.listeners.push(Listener {
            tx,
            online: self.online.subscribe(),
        });
        rx
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn listen_starts_with_existing_children() {
        let backend = MemoryBackend::new();
        let first = backend.push("users/u1/notes", json!({"content": "a"})).await.expect("push");
        let second = backend.push("users/u1/notes", json!({"content": "b"})).await.expect("push");
        assert!(first < second, "push keys sort by creation");

        let mut stream = backend.listen("users/u1/notes");
        assert_eq!(stream.recv().await.expect("event").key(), first);
        assert_eq!(stream.recv().await.expect("event").key(), second);

        backend.remove("users/u1/notes", &first).await.expect("remove");
        assert_eq!(
            stream.recv().await.expect("event"),
            RemoteChange::Removed { key: first }
        );
    }

    #[tokio::test]
    async fn update_merges_and_reports_missing_records() {
        let backend = MemoryBackend::new();
        let key = backend
            .push("canvases/c1/notes", json!({"content": "a", "zIndex": 1}))
            .await
            .expect("push");
        let mut fields = Map::new();
        fields.insert("content".to_string(), json!("ab"));

        assert!(backend.update("canvases/c1/notes", &key, fields.clone()).await.expect("update"));
        assert!(!backend.update("canvases/c1/notes", "missing", fields).await.expect("update"));

        let records = backend.fetch("canvases/c1/notes").await.expect("fetch");
        assert_eq!(records[0].1, json!({"content": "ab", "zIndex": 1}));
    }

    #[tokio::test]
    async fn offline_connection_fails_writes_and_misses_events() {
        let backend = MemoryBackend::new();
        let peer = backend.connect_peer();
        let mut stream = backend.listen("users/u1/notes");

        backend.set_online(false);
        let error = backend.push("users/u1/notes", json!({})).await.expect_err("offline");
        assert!(matches!(error, SyncError::Remote(_)));
        assert!(backend.fetch("users/u1/notes").await.is_err());

        peer.push("users/u1/notes", json!({"content": "peer"})).await.expect("peer online");
        backend.set_online(true);
        assert!(stream.try_recv().is_err());
        assert_eq!(backend.fetch("users/u1/notes").await.expect("fetch").len(), 1);
    }
}
