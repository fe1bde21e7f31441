use std::{sync::Mutex, time::Duration};

pub type FrameTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs work on the next frame. Reconcilers use it to coalesce flushes.
pub trait FrameScheduler: Send + Sync {
    fn schedule(&self, task: FrameTask);
}

/// Approximates an animation-frame cadence with a tokio timer.
#[derive(Debug, Clone, Copy)]
pub struct IntervalFrameScheduler {
    frame: Duration,
}

impl IntervalFrameScheduler {
    pub fn new(frame: Duration) -> Self {
        Self { frame }
    }
}

impl FrameScheduler for IntervalFrameScheduler {
    fn schedule(&self, task: FrameTask) {
        let frame = self.frame;
        tokio::spawn(async move {
            tokio::time::sleep(frame).await;
            task();
        });
    }
}

/// Queues tasks until the host drives a frame with [`ManualFrameScheduler::run_frame`].
/// Fits hosts that own their render loop.
#[derive(Default)]
pub struct ManualFrameScheduler {
    queue: Mutex<Vec<FrameTask>>,
}

impl ManualFrameScheduler {
    pub fn pending(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Runs everything queued so far. Tasks scheduled while running wait for the
    /// next frame. Returns how many tasks ran.
    pub fn run_frame(&self) -> usize {
        let tasks: Vec<FrameTask> = match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl FrameScheduler for ManualFrameScheduler {
    fn schedule(&self, task: FrameTask) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn manual_scheduler_defers_until_frame() {
        let scheduler = ManualFrameScheduler::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.run_frame(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_frame(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_scheduler_runs_after_one_frame() {
        let scheduler = IntervalFrameScheduler::new(Duration::from_millis(16));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
