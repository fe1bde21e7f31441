use std::sync::Mutex;

/// Toast surface for user-visible warnings.
pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);

    fn error(&self, message: &str);
}

/// Forwards notifications to the log. Used when the host has no toast surface.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn warn(&self, message: &str) {
        tracing::warn!(target: "user_notice", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "user_notice", "{}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Warning(String),
    Error(String),
}

/// Keeps every notification so a host (or a test) can drain and render them.
#[derive(Debug, Default)]
pub struct QueuedNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl QueuedNotifier {
    pub fn drain(&self) -> Vec<Notice> {
        match self.notices.lock() {
            Ok(mut notices) => notices.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }

    fn push(&self, notice: Notice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

impl Notifier for QueuedNotifier {
    fn warn(&self, message: &str) {
        self.push(Notice::Warning(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(Notice::Error(message.to_string()));
    }
}
