use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entity, Point, Size, now_millis};

pub const DEFAULT_NOTE_SIZE: Size = Size::new(260.0, 180.0);

/// Sticky note palette.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NoteColor {
    #[default]
    Yellow,
    Pink,
    Blue,
    Green,
    Purple,
    Orange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: String,
    pub position: Point,
    pub size: Size,
    pub content: String,
    pub color: NoteColor,
    pub z_index: i64,
    #[serde(default)]
    pub important: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Note {
    const COLLECTION: &'static str = "notes";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A note that has not been persisted yet and therefore has no id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteDraft {
    pub position: Point,
    pub size: Size,
    pub content: String,
    pub color: NoteColor,
    pub z_index: i64,
    pub important: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoteDraft {
    pub fn at(position: Point, z_index: i64) -> Self {
        let now = now_millis();
        Self {
            position,
            size: DEFAULT_NOTE_SIZE,
            content: String::new(),
            color: NoteColor::default(),
            z_index,
            important: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_note(self, id: String) -> Note {
        Note {
            id,
            position: self.position,
            size: self.size,
            content: self.content,
            color: self.color,
            z_index: self.z_index,
            important: self.important,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl From<&Note> for NoteDraft {
    fn from(note: &Note) -> Self {
        Self {
            position: note.position,
            size: note.size,
            content: note.content.clone(),
            color: note.color,
            z_index: note.z_index,
            important: note.important,
            created_at: note.created_at,
            updated_at: note.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotePatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub content: Option<String>,
    pub color: Option<NoteColor>,
    pub z_index: Option<i64>,
    pub important: Option<bool>,
}

impl NotePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn z_index(z_index: i64) -> Self {
        Self {
            z_index: Some(z_index),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl From<&Note> for NotePatch {
    /// Every mutable field, used to overwrite a stored note wholesale.
    fn from(note: &Note) -> Self {
        Self {
            position: Some(note.position),
            size: Some(note.size),
            content: Some(note.content.clone()),
            color: Some(note.color),
            z_index: Some(note.z_index),
            important: Some(note.important),
        }
    }
}

impl Note {
    /// Merges the patch into the note. Returns false when nothing changed.
    pub fn apply_patch(&mut self, patch: &NotePatch, updated_at: DateTime<Utc>) -> bool {
        let before = self.clone();
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
        if let Some(content) = patch.content.as_ref() {
            self.content = content.clone();
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(z_index) = patch.z_index {
            self.z_index = z_index;
        }
        if let Some(important) = patch.important {
            self.important = important;
        }
        if *self == before {
            return false;
        }
        self.updated_at = updated_at;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_uses_default_size_and_empty_content() {
        let draft = NoteDraft::at(Point::new(100.0, 100.0), 1);
        assert_eq!(draft.size, DEFAULT_NOTE_SIZE);
        assert_eq!(draft.content, "");
        assert_eq!(draft.color, NoteColor::Yellow);
    }

    #[test]
    fn apply_patch_reports_noop() {
        let mut note = NoteDraft::at(Point::default(), 1).into_note("n1".to_string());
        let stamp = note.updated_at;
        assert!(!note.apply_patch(&NotePatch::content(""), now_millis()));
        assert_eq!(note.updated_at, stamp);
        assert!(note.apply_patch(&NotePatch::content("hello"), now_millis()));
        assert_eq!(note.content, "hello");
    }
}
