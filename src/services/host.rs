use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};

/// Signals the embedding host exposes to the sync core: page visibility and a
/// way to wait for idle time.
pub trait HostEnvironment: Send + Sync {
    fn is_visible(&self) -> bool;

    /// Resolves once the host is idle, or after `cap` at the latest.
    fn idle(&self, cap: Duration) -> BoxFuture<'static, ()>;
}

/// Host without an idle callback: work runs on the next scheduler turn.
/// Visibility is pushed in by the embedding application.
#[derive(Debug)]
pub struct DefaultHost {
    visible: AtomicBool,
    idle_hint: Option<Duration>,
}

impl Default for DefaultHost {
    fn default() -> Self {
        Self {
            visible: AtomicBool::new(true),
            idle_hint: None,
        }
    }
}

impl DefaultHost {
    /// Host that reports idle after `hint` (never longer than the caller's cap).
    pub fn with_idle_hint(hint: Duration) -> Self {
        Self {
            visible: AtomicBool::new(true),
            idle_hint: Some(hint),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

impl HostEnvironment for DefaultHost {
    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn idle(&self, cap: Duration) -> BoxFuture<'static, ()> {
        match self.idle_hint {
            Some(hint) => tokio::time::sleep(hint.min(cap)).boxed(),
            None => tokio::task::yield_now().boxed(),
        }
    }
}
