use serde::{Deserialize, Serialize};

/// What is currently selected on the canvas. At most one entity at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Selection {
    #[default]
    None,
    Note(String),
    Image(String),
    File(String),
}

impl Selection {
    pub fn note_id(&self) -> Option<&str> {
        match self {
            Selection::Note(id) => Some(id),
            _ => None,
        }
    }

    pub fn image_id(&self) -> Option<&str> {
        match self {
            Selection::Image(id) => Some(id),
            _ => None,
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Selection::File(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Selection::None)
    }
}
