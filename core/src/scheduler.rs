use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A single pending timer that is replaced on every `schedule` call, so a
/// burst of triggers results in one run of the last producer.
pub struct CoalescingScheduler {
    rt: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingScheduler {
    #[must_use]
    pub fn new(rt: Handle) -> Self {
        Self {
            rt,
            pending: Mutex::new(None),
        }
    }

    /// Cancel any pending timer and arm a new one. When it expires the
    /// producer's future runs as its own task, so a later `schedule` or
    /// `cancel` never interrupts a write already under way.
    pub fn schedule<F, Fut>(&self, delay: Duration, producer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rt = self.rt.clone();
        let timer = self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            rt.spawn(producer());
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(timer) {
            previous.abort();
        }
    }

    /// Cancel the pending timer. Returns whether one was still waiting.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.take() {
            Some(timer) if !timer.is_finished() => {
                timer.abort();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.as_ref().is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for CoalescingScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_producer(
        hits: &Arc<AtomicUsize>,
        value: usize,
        last: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let hits = Arc::clone(hits);
        let last = Arc::clone(last);
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
            last.store(value, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_last_producer_once() {
        let scheduler = CoalescingScheduler::new(Handle::current());
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        for value in 1..=3 {
            scheduler.schedule(Duration::from_secs(5), counter_producer(&hits, value, &last));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(scheduler.is_pending());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let scheduler = CoalescingScheduler::new(Handle::current());
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(Duration::from_secs(5), counter_producer(&hits, 1, &last));
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_timer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = CoalescingScheduler::new(Handle::current());
            scheduler.schedule(Duration::from_secs(5), counter_producer(&hits, 1, &last));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
