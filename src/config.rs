use std::{path::PathBuf, time::Duration};

use crate::dto::cache::FallbackLimits;

pub const DEFAULT_CACHE_URL: &str = "sqlite://canvas-cache.db";
/// Roughly what browsers grant a single origin for synchronous storage.
pub const DEFAULT_FALLBACK_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Timing knobs of the debounced cache writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWriterConfig {
    pub debounce: Duration,
    pub min_interval: Duration,
    pub max_wait: Duration,
    pub idle_timeout: Duration,
    pub fallback_limits: FallbackLimits,
}

impl Default for CacheWriterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            min_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1),
            fallback_limits: FallbackLimits::default(),
        }
    }
}

/// Options shared by every canvas store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub history_limit: usize,
    pub z_index_debounce: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            history_limit: 50,
            z_index_debounce: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub cache_url: String,
    pub fallback_dir: Option<PathBuf>,
    pub fallback_quota_bytes: usize,
    pub cache_writer: CacheWriterConfig,
    pub store: StoreOptions,
    pub frame_interval: Duration,
    pub reconnect_debounce: Duration,
    pub image_retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_url: DEFAULT_CACHE_URL.to_string(),
            fallback_dir: None,
            fallback_quota_bytes: DEFAULT_FALLBACK_QUOTA_BYTES,
            cache_writer: CacheWriterConfig::default(),
            store: StoreOptions::default(),
            frame_interval: Duration::from_millis(16),
            reconnect_debounce: Duration::from_millis(500),
            image_retention_days: 30,
        }
    }
}

impl SyncConfig {
    /// Reads overrides from the environment (and `.env`), keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        let writer_defaults = defaults.cache_writer;
        let limit_defaults = writer_defaults.fallback_limits;

        Self {
            cache_url: std::env::var("CANVAS_CACHE_URL").unwrap_or(defaults.cache_url),
            fallback_dir: std::env::var("CANVAS_FALLBACK_DIR").ok().map(PathBuf::from),
            fallback_quota_bytes: read_env_usize("CANVAS_FALLBACK_QUOTA_BYTES")
                .unwrap_or(defaults.fallback_quota_bytes),
            cache_writer: CacheWriterConfig {
                debounce: read_env_millis("CACHE_DEBOUNCE_MS").unwrap_or(writer_defaults.debounce),
                min_interval: read_env_millis("CACHE_MIN_INTERVAL_MS")
                    .unwrap_or(writer_defaults.min_interval),
                max_wait: read_env_millis("CACHE_MAX_WAIT_MS").unwrap_or(writer_defaults.max_wait),
                idle_timeout: read_env_millis("CACHE_IDLE_TIMEOUT_MS")
                    .unwrap_or(writer_defaults.idle_timeout),
                fallback_limits: FallbackLimits {
                    max_notes: read_env_usize("FALLBACK_MAX_NOTES")
                        .unwrap_or(limit_defaults.max_notes),
                    max_images: read_env_usize("FALLBACK_MAX_IMAGES")
                        .unwrap_or(limit_defaults.max_images),
                    max_files: read_env_usize("FALLBACK_MAX_FILES")
                        .unwrap_or(limit_defaults.max_files),
                },
            },
            store: StoreOptions {
                history_limit: read_env_usize("HISTORY_LIMIT")
                    .unwrap_or(defaults.store.history_limit),
                z_index_debounce: read_env_millis("ZINDEX_DEBOUNCE_MS")
                    .unwrap_or(defaults.store.z_index_debounce),
            },
            frame_interval: read_env_millis("FRAME_INTERVAL_MS").unwrap_or(defaults.frame_interval),
            reconnect_debounce: read_env_millis("RECONNECT_DEBOUNCE_MS")
                .unwrap_or(defaults.reconnect_debounce),
            image_retention_days: read_env_u32("IMAGE_CACHE_RETENTION_DAYS")
                .unwrap_or(defaults.image_retention_days),
        }
    }
}

fn read_env_u32(key: &str) -> Option<u32> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

fn read_env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
}

fn read_env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
