//! Whole-document undo/redo.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::models::{CanvasFile, CanvasImage, Note};

/// The part of canvas state that undo restores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasDocument {
    pub notes: Vec<Note>,
    pub images: Vec<CanvasImage>,
    pub files: Vec<CanvasFile>,
}

/// Two stacks of document snapshots. The undo stack drops its oldest entry
/// once it holds `max_steps`.
#[derive(Debug, Clone)]
pub struct History {
    undo_stack: VecDeque<CanvasDocument>,
    redo_stack: Vec<CanvasDocument>,
    max_steps: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(50)
    }
}

impl History {
    pub fn new(max_steps: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_steps,
        }
    }

    /// Records the state as it was before an edit.
    pub fn record(&mut self, before: CanvasDocument) {
        self.redo_stack.clear();
        self.push_undo(before);
    }

    fn push_undo(&mut self, document: CanvasDocument) {
        if self.max_steps == 0 {
            return;
        }
        if self.undo_stack.len() >= self.max_steps {
            self.undo_stack.pop_front();
        }
        self.undo_stack.push_back(document);
    }

    /// Swaps `current` for the most recent snapshot, if any.
    pub fn undo(&mut self, current: CanvasDocument) -> Option<CanvasDocument> {
        let previous = self.undo_stack.pop_back()?;
        self.redo_stack.push(current);
        Some(previous)
    }

    pub fn redo(&mut self, current: CanvasDocument) -> Option<CanvasDocument> {
        let next = self.redo_stack.pop()?;
        self.push_undo(current);
        Some(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteDraft, Point};

    fn doc(notes: usize) -> CanvasDocument {
        CanvasDocument {
            notes: (0..notes)
                .map(|index| {
                    NoteDraft::at(Point::new(0.0, 0.0), index as i64).into_note(format!("n{index}"))
                })
                .collect(),
            ..CanvasDocument::default()
        }
    }

    #[test]
    fn undo_then_redo_restores_both_ways() {
        let mut history = History::new(10);
        history.record(doc(0));
        let restored = history.undo(doc(1)).expect("undo");
        assert_eq!(restored.notes.len(), 0);
        assert!(history.can_redo());
        let again = history.redo(restored).expect("redo");
        assert_eq!(again.notes.len(), 1);
        assert!(history.undo(doc(1)).is_some());
        assert!(history.undo(doc(0)).is_none());
    }

    #[test]
    fn new_edit_clears_redo() {
        let mut history = History::new(10);
        history.record(doc(0));
        history.undo(doc(1));
        history.record(doc(0));
        assert!(!history.can_redo());
    }

    #[test]
    fn depth_is_bounded() {
        let mut history = History::new(3);
        for count in 0..10 {
            history.record(doc(count));
        }
        assert_eq!(history.undo_depth(), 3);
        assert_eq!(history.undo(doc(10)).expect("undo").notes.len(), 9);
        assert_eq!(history.undo(doc(9)).expect("undo").notes.len(), 8);
        assert_eq!(history.undo(doc(8)).expect("undo").notes.len(), 7);
        assert!(history.undo(doc(7)).is_none());
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut history = History::new(0);
        history.record(doc(1));
        assert!(!history.can_undo());
    }
}
