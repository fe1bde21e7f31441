//! Remote wire schema, one tagged struct per collection.
//!
//! The hosted store speaks camelCase JSON with epoch-millisecond timestamps.
//! Every payload coming back from it passes through a `decode_*` function here
//! before it reaches the rest of the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::DecodeError,
    models::{
        Annotation, AnnotationKind, CanvasFile, CanvasImage, Entity, FileDraft, FileKind,
        FilePatch, ImageDraft, ImagePatch, Note, NoteColor, NoteDraft, NotePatch, PdfDocument,
        Point, SettingsPatch, Size, Viewport, files::FILE_DISPLAY_SIZE, from_epoch_millis,
    },
};

pub const SETTINGS_COLLECTION: &str = "settings";
/// Settings live in a single record of the settings collection.
pub const SETTINGS_RECORD_ID: &str = "preferences";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireNote {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub z_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&NoteDraft> for WireNote {
    fn from(draft: &NoteDraft) -> Self {
        Self {
            x: draft.position.x,
            y: draft.position.y,
            width: draft.size.width,
            height: draft.size.height,
            content: draft.content.clone(),
            color: draft.color,
            z_index: draft.z_index,
            important: draft.important.then_some(true),
            created_at: draft.created_at.timestamp_millis(),
            updated_at: draft.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireImage {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub original_width: f64,
    pub original_height: f64,
    pub src: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    pub created_at: i64,
}

impl From<&ImageDraft> for WireImage {
    fn from(draft: &ImageDraft) -> Self {
        Self {
            x: draft.position.x,
            y: draft.position.y,
            width: draft.size.width,
            height: draft.size.height,
            original_width: draft.original_size.width,
            original_height: draft.original_size.height,
            src: draft.src.clone(),
            file_name: draft.file_name.clone(),
            byte_size: draft.byte_size,
            storage_path: draft.storage_path.clone(),
            created_at: draft.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireAnnotation {
    pub id: String,
    pub page: u32,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub author: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub kind: AnnotationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WirePdf {
    pub page_count: u32,
    #[serde(default)]
    pub page_sizes: Vec<Size>,
    #[serde(default)]
    pub annotations: Vec<WireAnnotation>,
}

impl From<&PdfDocument> for WirePdf {
    fn from(pdf: &PdfDocument) -> Self {
        Self {
            page_count: pdf.page_count,
            page_sizes: pdf.page_sizes.clone(),
            annotations: pdf
                .annotations
                .iter()
                .map(|annotation| WireAnnotation {
                    id: annotation.id.clone(),
                    page: annotation.page,
                    x: annotation.position.x,
                    y: annotation.position.y,
                    author: annotation.author.clone(),
                    created_at: annotation.created_at.timestamp_millis(),
                    kind: annotation.kind.clone(),
                })
                .collect(),
        }
    }
}

impl WirePdf {
    fn into_pdf(self) -> PdfDocument {
        PdfDocument {
            page_count: self.page_count,
            page_sizes: self.page_sizes,
            annotations: self
                .annotations
                .into_iter()
                .map(|annotation| Annotation {
                    id: annotation.id,
                    page: annotation.page,
                    position: Point::new(annotation.x, annotation.y),
                    author: annotation.author,
                    created_at: from_epoch_millis(annotation.created_at),
                    kind: annotation.kind,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireFile {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_file_width")]
    pub width: f64,
    #[serde(default = "default_file_height")]
    pub height: f64,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub byte_size: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<WirePdf>,
}

fn default_file_width() -> f64 {
    FILE_DISPLAY_SIZE.width
}

fn default_file_height() -> f64 {
    FILE_DISPLAY_SIZE.height
}

impl From<&FileDraft> for WireFile {
    fn from(draft: &FileDraft) -> Self {
        Self {
            x: draft.position.x,
            y: draft.position.y,
            width: FILE_DISPLAY_SIZE.width,
            height: FILE_DISPLAY_SIZE.height,
            file_name: draft.file_name.clone(),
            mime_type: draft.mime_type.clone(),
            byte_size: draft.byte_size,
            url: draft.url.clone(),
            storage_path: draft.storage_path.clone(),
            thumbnail_url: draft.thumbnail_url.clone(),
            created_at: draft.created_at.timestamp_millis(),
            pdf: draft.pdf.as_ref().map(WirePdf::from),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

impl From<&SettingsPatch> for WireSettings {
    fn from(patch: &SettingsPatch) -> Self {
        Self {
            dark_mode: patch.dark_mode,
            language: patch.language.clone(),
            viewport: patch.viewport,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    collection: &'static str,
    id: &str,
    value: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|error| DecodeError::new(collection, id, error.to_string()))
}

fn ensure_finite(collection: &'static str, id: &str, values: &[f64]) -> Result<(), DecodeError> {
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(DecodeError::new(collection, id, "non-finite coordinate"))
    }
}

pub fn decode_note(id: &str, value: Value) -> Result<Note, DecodeError> {
    let wire: WireNote = parse(Note::COLLECTION, id, value)?;
    ensure_finite(
        Note::COLLECTION,
        id,
        &[wire.x, wire.y, wire.width, wire.height],
    )?;
    Ok(Note {
        id: id.to_string(),
        position: Point::new(wire.x, wire.y),
        size: Size::new(wire.width, wire.height),
        content: wire.content,
        color: wire.color,
        z_index: wire.z_index,
        important: wire.important.unwrap_or(false),
        created_at: from_epoch_millis(wire.created_at),
        updated_at: from_epoch_millis(wire.updated_at),
    })
}

pub fn decode_image(id: &str, value: Value) -> Result<CanvasImage, DecodeError> {
    let wire: WireImage = parse(CanvasImage::COLLECTION, id, value)?;
    ensure_finite(
        CanvasImage::COLLECTION,
        id,
        &[wire.x, wire.y, wire.width, wire.height],
    )?;
    Ok(CanvasImage {
        id: id.to_string(),
        position: Point::new(wire.x, wire.y),
        size: Size::new(wire.width, wire.height),
        original_size: Size::new(wire.original_width, wire.original_height),
        src: wire.src,
        file_name: wire.file_name,
        byte_size: wire.byte_size,
        created_at: from_epoch_millis(wire.created_at),
    })
}

pub fn decode_file(id: &str, value: Value) -> Result<CanvasFile, DecodeError> {
    let wire: WireFile = parse(CanvasFile::COLLECTION, id, value)?;
    ensure_finite(CanvasFile::COLLECTION, id, &[wire.x, wire.y])?;
    Ok(CanvasFile {
        id: id.to_string(),
        position: Point::new(wire.x, wire.y),
        size: Size::new(wire.width, wire.height),
        kind: FileKind::from_mime(&wire.mime_type),
        file_name: wire.file_name,
        byte_size: wire.byte_size,
        url: wire.url,
        thumbnail_url: wire.thumbnail_url,
        created_at: from_epoch_millis(wire.created_at),
        pdf: wire.pdf.map(WirePdf::into_pdf),
    })
}

pub fn decode_settings(value: Value) -> Result<SettingsPatch, DecodeError> {
    let wire: WireSettings = parse(SETTINGS_COLLECTION, SETTINGS_RECORD_ID, value)?;
    if let Some(viewport) = wire.viewport.as_ref() {
        if !viewport.is_valid() {
            return Err(DecodeError::new(
                SETTINGS_COLLECTION,
                SETTINGS_RECORD_ID,
                format!("viewport scale must be positive, got {}", viewport.scale),
            ));
        }
    }
    Ok(SettingsPatch {
        dark_mode: wire.dark_mode,
        language: wire.language,
        viewport: wire.viewport,
    })
}

pub fn encode<T: Serialize>(wire: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(wire)
}

pub fn encode_note_patch(patch: &NotePatch, updated_at: DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(position) = patch.position {
        fields.insert("x".to_string(), Value::from(position.x));
        fields.insert("y".to_string(), Value::from(position.y));
    }
    if let Some(size) = patch.size {
        fields.insert("width".to_string(), Value::from(size.width));
        fields.insert("height".to_string(), Value::from(size.height));
    }
    if let Some(content) = patch.content.as_ref() {
        fields.insert("content".to_string(), Value::from(content.clone()));
    }
    if let Some(color) = patch.color {
        if let Ok(value) = serde_json::to_value(color) {
            fields.insert("color".to_string(), value);
        }
    }
    if let Some(z_index) = patch.z_index {
        fields.insert("zIndex".to_string(), Value::from(z_index));
    }
    if let Some(important) = patch.important {
        fields.insert("important".to_string(), Value::from(important));
    }
    fields.insert(
        "updatedAt".to_string(),
        Value::from(updated_at.timestamp_millis()),
    );
    fields
}

pub fn encode_image_patch(patch: &ImagePatch) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(position) = patch.position {
        fields.insert("x".to_string(), Value::from(position.x));
        fields.insert("y".to_string(), Value::from(position.y));
    }
    if let Some(size) = patch.size {
        fields.insert("width".to_string(), Value::from(size.width));
        fields.insert("height".to_string(), Value::from(size.height));
    }
    fields
}

pub fn encode_file_patch(patch: &FilePatch) -> Result<Map<String, Value>, serde_json::Error> {
    let mut fields = Map::new();
    if let Some(position) = patch.position {
        fields.insert("x".to_string(), Value::from(position.x));
        fields.insert("y".to_string(), Value::from(position.y));
    }
    if let Some(size) = patch.size {
        fields.insert("width".to_string(), Value::from(size.width));
        fields.insert("height".to_string(), Value::from(size.height));
    }
    if let Some(pdf) = patch.pdf.as_ref() {
        fields.insert("pdf".to_string(), serde_json::to_value(WirePdf::from(pdf))?);
    }
    Ok(fields)
}

pub fn encode_settings_patch(patch: &SettingsPatch) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(WireSettings::from(patch))? {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::now_millis;

    #[test]
    fn note_round_trips_through_wire_timestamps() {
        let draft = NoteDraft::at(Point::new(100.0, 100.0), 3);
        let value = encode(&WireNote::from(&draft)).expect("encode");
        assert!(value["createdAt"].is_i64());
        let note = decode_note("n1", value).expect("decode");
        assert_eq!(note, draft.into_note("n1".to_string()));
    }

    #[test]
    fn decode_rejects_unknown_color() {
        let value = json!({
            "x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0,
            "color": "magenta", "createdAt": 0, "updatedAt": 0
        });
        let error = decode_note("n2", value).expect_err("should fail");
        assert_eq!(error.collection, "notes");
        assert_eq!(error.id, "n2");
    }

    #[test]
    fn decode_file_derives_kind_from_mime() {
        let value = json!({
            "x": 1.0, "y": 2.0, "fileName": "report.pdf", "mimeType": "application/pdf",
            "byteSize": 2048, "url": "https://files/report.pdf",
            "storagePath": "users/u1/files/report.pdf", "createdAt": 1_700_000_000_000i64
        });
        let file = decode_file("f1", value).expect("decode");
        assert_eq!(file.kind, FileKind::Pdf);
        assert_eq!(file.size, FILE_DISPLAY_SIZE);
    }

    #[test]
    fn decode_settings_rejects_zero_scale() {
        let value = json!({ "viewport": { "x": 0.0, "y": 0.0, "scale": 0.0 } });
        assert!(decode_settings(value).is_err());
    }

    #[test]
    fn note_patch_only_carries_set_fields() {
        let stamp = now_millis();
        let fields = encode_note_patch(&NotePatch::z_index(7), stamp);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["zIndex"], json!(7));
        assert_eq!(fields["updatedAt"], json!(stamp.timestamp_millis()));
    }
}
