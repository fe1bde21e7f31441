use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};

pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Watches a connectivity signal and fires `on_reconnect` once the link has
/// been back online for `debounce` without dropping again.
pub struct ReconnectWatcher {
    task: JoinHandle<()>,
}

impl ReconnectWatcher {
    pub fn spawn(
        connectivity: watch::Receiver<bool>,
        debounce: Duration,
        on_reconnect: ReconnectHook,
    ) -> Self {
        Self {
            task: tokio::spawn(watch_connectivity(connectivity, debounce, on_reconnect)),
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ReconnectWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_connectivity(
    mut connectivity: watch::Receiver<bool>,
    debounce: Duration,
    on_reconnect: ReconnectHook,
) {
    let mut online = *connectivity.borrow_and_update();
    loop {
        if connectivity.changed().await.is_err() {
            return;
        }
        let now_online = *connectivity.borrow_and_update();
        if online || !now_online {
            online = now_online;
            continue;
        }
        online = true;

        // Back online: wait for the link to settle. Every change restarts the wait.
        let settled = loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break true,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*connectivity.borrow_and_update() {
                        online = false;
                        break false;
                    }
                }
            }
        };

        if settled {
            tracing::info!("Connection restored, refreshing collections");
            on_reconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, ReconnectHook) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        let hook: ReconnectHook = Arc::new(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, hook)
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_once_after_debounced_reconnect() {
        let (tx, rx) = watch::channel(true);
        let (count, hook) = counter();
        let _watcher = ReconnectWatcher::spawn(rx, Duration::from_millis(500), hook);

        tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_connection_restarts_the_wait() {
        let (tx, rx) = watch::channel(false);
        let (count, hook) = counter();
        let _watcher = ReconnectWatcher::spawn(rx, Duration::from_millis(500), hook);

        for _ in 0..3 {
            tx.send_replace(true);
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send_replace(false);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_watcher_never_fires() {
        let (tx, rx) = watch::channel(false);
        let (count, hook) = counter();
        let watcher = ReconnectWatcher::spawn(rx, Duration::from_millis(500), hook);
        watcher.stop();

        tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
