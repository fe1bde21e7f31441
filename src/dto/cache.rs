use serde::{Deserialize, Serialize};

use crate::models::{CanvasFile, CanvasImage, Note, Settings};

pub const FALLBACK_SCHEMA_VERSION: u32 = 1;
pub const LOCAL_BLOB_VERSION: u32 = 1;
pub const CACHE_SCHEMA_VERSION: i64 = 1;

/// Everything the cache writer persists for one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheSnapshot {
    pub notes: Vec<Note>,
    pub images: Vec<CanvasImage>,
    pub files: Vec<CanvasFile>,
    pub settings: Settings,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.images.is_empty() && self.files.is_empty()
    }
}

/// How much of a snapshot fits in the small-capacity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackLimits {
    pub max_notes: usize,
    pub max_images: usize,
    pub max_files: usize,
}

impl Default for FallbackLimits {
    fn default() -> Self {
        Self {
            max_notes: 50,
            max_images: 20,
            max_files: 10,
        }
    }
}

/// Fallback-tier record, one per namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FallbackBlob {
    pub version: u32,
    pub last_updated: i64,
    pub notes: Vec<Note>,
    pub images: Vec<CanvasImage>,
    pub files: Vec<CanvasFile>,
    #[serde(default)]
    pub dark_mode: bool,
}

impl FallbackBlob {
    pub fn from_snapshot(snapshot: &CacheSnapshot, limits: FallbackLimits, now_ms: i64) -> Self {
        Self {
            version: FALLBACK_SCHEMA_VERSION,
            last_updated: now_ms,
            notes: snapshot.notes.iter().take(limits.max_notes).cloned().collect(),
            images: snapshot.images.iter().take(limits.max_images).cloned().collect(),
            files: snapshot.files.iter().take(limits.max_files).cloned().collect(),
            dark_mode: snapshot.settings.dark_mode,
        }
    }

    pub fn into_snapshot(self) -> CacheSnapshot {
        CacheSnapshot {
            notes: self.notes,
            images: self.images,
            files: self.files,
            settings: Settings {
                dark_mode: self.dark_mode,
                ..Settings::default()
            },
        }
    }
}

/// Whole-canvas blob owned by the local adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalBlob {
    pub version: u32,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub images: Vec<CanvasImage>,
    #[serde(default)]
    pub files: Vec<CanvasFile>,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for LocalBlob {
    fn default() -> Self {
        Self {
            version: LOCAL_BLOB_VERSION,
            notes: Vec::new(),
            images: Vec::new(),
            files: Vec::new(),
            settings: Settings::default(),
        }
    }
}

/// Per-namespace bookkeeping stored next to the large-tier collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub namespace: String,
    pub note_count: i64,
    pub image_count: i64,
    pub file_count: i64,
    pub last_sync: i64,
    pub schema_version: i64,
}
