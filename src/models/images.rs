use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entity, Point, Size, now_millis};

/// Longest edge an image is displayed at when first dropped on the canvas.
pub const MAX_IMAGE_DISPLAY_EDGE: f64 = 400.0;

/// An image placed on the canvas. Only position and size change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanvasImage {
    pub id: String,
    pub position: Point,
    pub size: Size,
    pub original_size: Size,
    pub src: String,
    pub file_name: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
}

impl Entity for CanvasImage {
    const COLLECTION: &'static str = "images";

    fn id(&self) -> &str {
        &self.id
    }
}

impl CanvasImage {
    pub fn is_data_uri(&self) -> bool {
        self.src.starts_with("data:")
    }

    pub fn apply_patch(&mut self, patch: &ImagePatch) -> bool {
        let before = (self.position, self.size);
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
        before != (self.position, self.size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDraft {
    pub position: Point,
    pub size: Size,
    pub original_size: Size,
    pub src: String,
    pub file_name: String,
    pub byte_size: u64,
    /// Object-storage path when `src` points at uploaded content.
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ImageDraft {
    pub fn new(
        position: Point,
        original_size: Size,
        src: impl Into<String>,
        file_name: impl Into<String>,
        byte_size: u64,
    ) -> Self {
        Self {
            position,
            size: original_size.fit_within(MAX_IMAGE_DISPLAY_EDGE),
            original_size,
            src: src.into(),
            file_name: file_name.into(),
            byte_size,
            storage_path: None,
            created_at: now_millis(),
        }
    }

    pub fn into_image(self, id: String) -> CanvasImage {
        CanvasImage {
            id,
            position: self.position,
            size: self.size,
            original_size: self.original_size,
            src: self.src,
            file_name: self.file_name,
            byte_size: self.byte_size,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImagePatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
}

impl From<&CanvasImage> for ImageDraft {
    fn from(image: &CanvasImage) -> Self {
        Self {
            position: image.position,
            size: image.size,
            original_size: image.original_size,
            src: image.src.clone(),
            file_name: image.file_name.clone(),
            byte_size: image.byte_size,
            storage_path: None,
            created_at: image.created_at,
        }
    }
}

impl From<&CanvasImage> for ImagePatch {
    fn from(image: &CanvasImage) -> Self {
        Self {
            position: Some(image.position),
            size: Some(image.size),
        }
    }
}
