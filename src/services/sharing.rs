use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    error::{SyncError, SyncResult},
    models::{SharedCanvas, SharedRole},
};

/// Canvas-sharing collaborator: turns a share token into a canvas id and the
/// caller's role on it.
#[async_trait]
pub trait ShareService: Send + Sync {
    async fn resolve(&self, token: &str) -> SyncResult<SharedCanvas>;
}

/// Share links registered in process.
#[derive(Debug, Default)]
pub struct InMemoryShareService {
    links: DashMap<String, SharedCanvas>,
}

impl InMemoryShareService {
    pub fn register(&self, token: impl Into<String>, canvas_id: impl Into<String>, role: SharedRole) {
        self.links.insert(
            token.into(),
            SharedCanvas {
                canvas_id: canvas_id.into(),
                role,
            },
        );
    }

    pub fn revoke(&self, token: &str) {
        self.links.remove(token);
    }
}

#[async_trait]
impl ShareService for InMemoryShareService {
    async fn resolve(&self, token: &str) -> SyncResult<SharedCanvas> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SyncError::NotFound("share link".to_string()));
        }
        self.links
            .get(token)
            .map(|link| link.value().clone())
            .ok_or_else(|| SyncError::NotFound("share link".to_string()))
    }
}
