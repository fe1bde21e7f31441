use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::JoinHandle;

/// Owned handle over the listener tasks of one remote subscription. Closing
/// aborts every task; it happens at most once, on `close()` or on drop.
#[derive(Debug)]
pub struct Subscription {
    label: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Subscription {
    pub fn new(label: impl Into<String>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            label: label.into(),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true only for the call that actually closed the subscription.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in &tasks {
            task.abort();
        }
        tracing::debug!("Closed subscription {} ({} listeners)", self.label, tasks.len());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_aborts_tasks() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let subscription = Subscription::new("users/u1", vec![task]);
        assert!(subscription.close());
        assert!(!subscription.close());
        assert!(subscription.is_closed());
    }

    #[tokio::test]
    async fn drop_closes_the_subscription() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        drop(Subscription::new("canvases/c1", vec![task]));
        // The aborted task drops its sender.
        assert!(rx.await.is_err());
    }
}
