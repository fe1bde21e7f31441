//! Two-tier local cache: SQLite holds everything, the key-value tier holds a
//! truncated copy for when SQLite is unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;

use crate::{
    config::SyncConfig,
    dto::cache::{CacheSnapshot, FallbackBlob, FallbackLimits},
    error::{SyncError, SyncResult},
    models::{CanvasImage, Namespace},
    repositories::{
        cache as cache_repo,
        fallback::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore},
    },
    services::cache_writer::CacheSink,
    telemetry::SyncEvent,
};

const FALLBACK_KEY_PREFIX: &str = "canvas-cache";

fn fallback_key(namespace: &Namespace) -> String {
    format!("{FALLBACK_KEY_PREFIX}:{}", namespace.cache_key())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReport {
    pub large_tier_written: bool,
    pub fallback_written: bool,
    pub fallback_truncated: bool,
}

#[derive(Clone)]
pub struct PersistentCache {
    pool: Option<SqlitePool>,
    fallback: Arc<dyn KeyValueStore>,
    limits: FallbackLimits,
}

impl PersistentCache {
    pub fn new(
        pool: Option<SqlitePool>,
        fallback: Arc<dyn KeyValueStore>,
        limits: FallbackLimits,
    ) -> Self {
        Self {
            pool,
            fallback,
            limits,
        }
    }

    /// Opens both tiers from configuration. A SQLite failure is logged and the
    /// cache continues with the fallback tier only.
    pub async fn open(config: &SyncConfig) -> SyncResult<Self> {
        let fallback: Arc<dyn KeyValueStore> = match &config.fallback_dir {
            Some(dir) => Arc::new(FileKeyValueStore::open(dir, config.fallback_quota_bytes)?),
            None => Arc::new(MemoryKeyValueStore::new(config.fallback_quota_bytes)),
        };

        let pool = match cache_repo::connect(&config.cache_url).await {
            Ok(pool) => Some(pool),
            Err(error) => {
                tracing::warn!(
                    "Large cache tier unavailable at {}, using fallback only: {}",
                    config.cache_url,
                    error
                );
                None
            }
        };

        Ok(Self::new(pool, fallback, config.cache_writer.fallback_limits))
    }

    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    /// The key-value store backing the fallback tier. The local adapter keeps
    /// its own blob in the same store.
    pub fn key_value_store(&self) -> Arc<dyn KeyValueStore> {
        self.fallback.clone()
    }

    /// Cached state for `namespace`, preferring the large tier.
    pub async fn load(&self, namespace: &Namespace) -> Option<CacheSnapshot> {
        let key = namespace.cache_key();
        if let Some(pool) = &self.pool {
            match cache_repo::load_namespace(pool, &key).await {
                Ok(Some(snapshot)) => return Some(snapshot),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Failed to read large cache tier for {}: {}", key, error);
                }
            }
        }

        let raw = match self.fallback.get(&fallback_key(namespace)) {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!("Failed to read fallback cache for {}: {}", key, error);
                return None;
            }
        };
        match serde_json::from_str::<FallbackBlob>(&raw) {
            Ok(blob) => Some(blob.into_snapshot()),
            Err(error) => {
                tracing::warn!("Discarding unreadable fallback cache for {}: {}", key, error);
                None
            }
        }
    }

    /// Writes `snapshot` to both tiers. Fails only when neither tier accepted it.
    pub async fn write(
        &self,
        namespace: &Namespace,
        snapshot: &CacheSnapshot,
    ) -> SyncResult<WriteReport> {
        let key = namespace.cache_key();
        let now_ms = Utc::now().timestamp_millis();
        let mut report = WriteReport::default();
        let mut last_error = None;

        if let Some(pool) = &self.pool {
            match cache_repo::replace_namespace(pool, &key, snapshot, now_ms).await {
                Ok(()) => report.large_tier_written = true,
                Err(error) => {
                    tracing::error!("Failed to write large cache tier for {}: {}", key, error);
                    last_error = Some(error);
                }
            }
        }

        let blob = FallbackBlob::from_snapshot(snapshot, self.limits, now_ms);
        report.fallback_truncated = blob.notes.len() < snapshot.notes.len()
            || blob.images.len() < snapshot.images.len()
            || blob.files.len() < snapshot.files.len();
        let payload = serde_json::to_string(&blob)?;
        match self.fallback.set(&fallback_key(namespace), &payload) {
            Ok(()) => report.fallback_written = true,
            Err(error) => {
                if error.is_quota_exceeded() {
                    SyncEvent::QuotaExceeded {
                        namespace: key.clone(),
                        tier: "fallback".to_string(),
                    }
                    .log();
                } else {
                    tracing::error!("Failed to write fallback cache for {}: {}", key, error);
                }
                last_error = Some(error);
            }
        }

        match last_error {
            Some(error) if !report.large_tier_written && !report.fallback_written => Err(error),
            _ => Ok(report),
        }
    }

    pub async fn cached_image(&self, image: &CanvasImage) -> SyncResult<Option<Vec<u8>>> {
        match &self.pool {
            Some(pool) => cache_repo::get_image_blob(pool, &image.id, &image.src).await,
            None => Ok(None),
        }
    }

    pub async fn cache_image(&self, image: &CanvasImage, content: &[u8]) -> SyncResult<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| SyncError::Unconfigured("large cache tier".to_string()))?;
        cache_repo::put_image_blob(
            pool,
            &image.id,
            &image.src,
            content,
            Utc::now().timestamp_millis(),
        )
        .await
    }

    /// Removes cached image bytes older than `retention_days`.
    pub async fn evict_images(&self, retention_days: u32) -> SyncResult<u64> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let removed = cache_repo::evict_image_blobs_before(pool, cutoff.timestamp_millis()).await?;
        SyncEvent::ImageCacheEvicted {
            removed,
            retention_days,
        }
        .log();
        Ok(removed)
    }
}

#[async_trait]
impl CacheSink for PersistentCache {
    async fn write_snapshot(&self, namespace: &Namespace, snapshot: CacheSnapshot) -> SyncResult<()> {
        let report = self.write(namespace, &snapshot).await?;
        SyncEvent::CacheWritten {
            namespace: namespace.cache_key(),
            notes: snapshot.notes.len(),
            images: snapshot.images.len(),
            files: snapshot.files.len(),
            fallback_truncated: report.fallback_truncated,
        }
        .log();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageDraft, NoteDraft, Point, Size};

    fn snapshot(notes: i64) -> CacheSnapshot {
        CacheSnapshot {
            notes: (0..notes)
                .map(|index| NoteDraft::at(Point::new(0.0, 0.0), index).into_note(format!("n{index}")))
                .collect(),
            ..CacheSnapshot::default()
        }
    }

    async fn cache_with_pool(quota: usize) -> PersistentCache {
        let pool = cache_repo::connect("sqlite::memory:").await.expect("pool");
        PersistentCache::new(
            Some(pool),
            Arc::new(MemoryKeyValueStore::new(quota)),
            FallbackLimits::default(),
        )
    }

    #[tokio::test]
    async fn write_fills_large_tier_and_truncated_fallback() {
        let cache = cache_with_pool(1024 * 1024).await;
        let namespace = Namespace::User("u1".to_string());

        let report = cache.write(&namespace, &snapshot(60)).await.expect("write");
        assert!(report.large_tier_written);
        assert!(report.fallback_written);
        assert!(report.fallback_truncated);

        let loaded = cache.load(&namespace).await.expect("cached");
        assert_eq!(loaded.notes.len(), 60);

        let raw = cache
            .key_value_store()
            .get("canvas-cache:user:u1")
            .expect("get")
            .expect("fallback blob");
        let blob: FallbackBlob = serde_json::from_str(&raw).expect("blob");
        assert_eq!(blob.notes.len(), 50);
    }

    #[tokio::test]
    async fn load_falls_back_to_key_value_tier() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new(1024 * 1024));
        let writer = PersistentCache::new(None, store.clone(), FallbackLimits::default());
        let namespace = Namespace::Local;
        writer.write(&namespace, &snapshot(3)).await.expect("write");

        let reader = PersistentCache::new(None, store, FallbackLimits::default());
        let loaded = reader.load(&namespace).await.expect("fallback copy");
        assert_eq!(loaded.notes.len(), 3);
        assert_eq!(reader.load(&Namespace::Canvas("other".to_string())).await, None);
    }

    #[tokio::test]
    async fn fallback_quota_does_not_fail_when_large_tier_succeeds() {
        let cache = cache_with_pool(10).await;
        let report = cache
            .write(&Namespace::Local, &snapshot(2))
            .await
            .expect("large tier accepted it");
        assert!(report.large_tier_written);
        assert!(!report.fallback_written);
    }

    #[tokio::test]
    async fn fallback_quota_fails_without_large_tier() {
        let cache = PersistentCache::new(
            None,
            Arc::new(MemoryKeyValueStore::new(10)),
            FallbackLimits::default(),
        );
        let error = cache
            .write(&Namespace::Local, &snapshot(2))
            .await
            .expect_err("nothing accepted the write");
        assert!(error.is_quota_exceeded());
    }

    #[tokio::test]
    async fn image_bytes_are_invalidated_by_url_change() {
        let cache = cache_with_pool(1024).await;
        let mut image = ImageDraft::new(
            Point::new(0.0, 0.0),
            Size::new(10.0, 10.0),
            "https://cdn.example/a.png",
            "a.png",
            3,
        )
        .into_image("img-1".to_string());

        cache.cache_image(&image, &[1, 2, 3]).await.expect("cache");
        assert_eq!(cache.cached_image(&image).await.expect("get"), Some(vec![1, 2, 3]));

        image.src = "https://cdn.example/b.png".to_string();
        assert_eq!(cache.cached_image(&image).await.expect("get"), None);
        assert_eq!(cache.evict_images(30).await.expect("evict"), 0);
    }

    #[tokio::test]
    async fn evicting_without_large_tier_is_a_no_op() {
        let cache = PersistentCache::new(
            None,
            Arc::new(MemoryKeyValueStore::new(1024)),
            FallbackLimits::default(),
        );
        assert_eq!(cache.evict_images(30).await.expect("evict"), 0);
    }
}
