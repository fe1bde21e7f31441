pub mod files;
pub mod geometry;
pub mod images;
pub mod namespace;
pub mod notes;
pub mod selection;
pub mod settings;
pub mod sharing;

use chrono::{DateTime, Utc};

pub use files::{
    Annotation, AnnotationKind, CanvasFile, FileDraft, FileKind, FilePatch, InputDevice,
    PdfDocument, Stroke, StrokePoint,
};
pub use geometry::{Point, Size};
pub use images::{CanvasImage, ImageDraft, ImagePatch};
pub use namespace::Namespace;
pub use notes::{Note, NoteColor, NoteDraft, NotePatch};
pub use selection::Selection;
pub use settings::{Settings, SettingsPatch, Viewport};
pub use sharing::{Identity, SharedCanvas, SharedRole};

/// A record that lives in one of the synchronized collections.
pub trait Entity: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    /// Collection name, used for remote paths, cache tables and logs.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

/// Current time truncated to whole milliseconds, the resolution of the remote
/// wire format.
pub fn now_millis() -> DateTime<Utc> {
    from_epoch_millis(Utc::now().timestamp_millis())
}

pub fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_has_no_sub_millisecond_part() {
        let now = now_millis();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(from_epoch_millis(now.timestamp_millis()), now);
    }
}
