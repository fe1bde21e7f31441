use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entity, Point, Size, now_millis};

pub const FILE_DISPLAY_SIZE: Size = Size::new(200.0, 240.0);

/// Coarse classification derived from the MIME type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Pdf,
    Document,
    Other,
}

const DOCUMENT_MIME_TYPES: [&str; 8] = [
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/rtf",
    "application/vnd.oasis.opendocument.text",
];

impl FileKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            FileKind::Image
        } else if mime == "application/pdf" {
            FileKind::Pdf
        } else if mime.starts_with("text/") || DOCUMENT_MIME_TYPES.contains(&mime.as_str()) {
            FileKind::Document
        } else {
            FileKind::Other
        }
    }

    /// A MIME type that classifies back to this kind. Used when a file has to
    /// be stored again and only its kind is known.
    pub fn canonical_mime(self) -> &'static str {
        match self {
            FileKind::Image => "image/*",
            FileKind::Pdf => "application/pdf",
            FileKind::Document => "text/plain",
            FileKind::Other => "application/octet-stream",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputDevice {
    #[default]
    Mouse,
    Pen,
    Touch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrokePoint {
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stroke {
    pub points: Vec<StrokePoint>,
    pub device: InputDevice,
    pub color: String,
    pub width: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnnotationKind {
    Highlight { size: Size, color: String },
    Text { content: String },
    Freehand { strokes: Vec<Stroke> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: String,
    pub page: u32,
    pub position: Point,
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AnnotationKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PdfDocument {
    pub page_count: u32,
    pub page_sizes: Vec<Size>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanvasFile {
    pub id: String,
    pub position: Point,
    pub size: Size,
    pub file_name: String,
    pub kind: FileKind,
    pub byte_size: u64,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pdf: Option<PdfDocument>,
}

impl Entity for CanvasFile {
    const COLLECTION: &'static str = "files";

    fn id(&self) -> &str {
        &self.id
    }
}

impl CanvasFile {
    pub fn apply_patch(&mut self, patch: &FilePatch) -> bool {
        let before = self.clone();
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
        if let Some(pdf) = patch.pdf.as_ref() {
            self.pdf = Some(pdf.clone());
        }
        *self != before
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDraft {
    pub position: Point,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub url: String,
    pub storage_path: Option<String>,
    pub thumbnail_url: Option<String>,
    pub pdf: Option<PdfDocument>,
    pub created_at: DateTime<Utc>,
}

impl FileDraft {
    pub fn new(
        position: Point,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        byte_size: u64,
        url: impl Into<String>,
    ) -> Self {
        Self {
            position,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            byte_size,
            url: url.into(),
            storage_path: None,
            thumbnail_url: None,
            pdf: None,
            created_at: now_millis(),
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mime(&self.mime_type)
    }

    pub fn into_file(self, id: String) -> CanvasFile {
        CanvasFile {
            id,
            position: self.position,
            size: FILE_DISPLAY_SIZE,
            kind: self.kind(),
            file_name: self.file_name,
            byte_size: self.byte_size,
            url: self.url,
            thumbnail_url: self.thumbnail_url,
            created_at: self.created_at,
            pdf: self.pdf,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilePatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub pdf: Option<PdfDocument>,
}

impl From<&CanvasFile> for FileDraft {
    fn from(file: &CanvasFile) -> Self {
        Self {
            position: file.position,
            file_name: file.file_name.clone(),
            mime_type: file.kind.canonical_mime().to_string(),
            byte_size: file.byte_size,
            url: file.url.clone(),
            storage_path: None,
            thumbnail_url: file.thumbnail_url.clone(),
            pdf: file.pdf.clone(),
            created_at: file.created_at,
        }
    }
}

impl From<&CanvasFile> for FilePatch {
    fn from(file: &CanvasFile) -> Self {
        Self {
            position: Some(file.position),
            size: Some(file.size),
            pdf: file.pdf.clone(),
        }
    }
}
