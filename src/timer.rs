use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A one-shot delayed callback running on the tokio runtime.
///
/// Cancelling, or dropping, the handle before the delay elapses prevents the callback from running. Once the delay has
/// elapsed the callback is left to complete even if its own handle gets dropped meanwhile, so callbacks must re-check
/// whatever condition they act upon.
#[derive(Debug)]
pub struct TimerHandle {
    task:  JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Run `callback` after `delay`. Returns `None` when called outside of a tokio runtime, e.g. when a subscription is
    /// dropped after the runtime has shut down.
    pub fn arm<Fut>(delay: Duration, callback: Fut) -> Option<Self>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().ok()?;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        Some(Self {
            task: runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                flag.store(true, Ordering::Release);
                callback.await;
            }),
            fired,
        })
    }

    pub fn cancel(self) {
        drop(self)
    }

    /// The delay has elapsed and the callback has been started.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if !self.has_fired() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let timer = TimerHandle::arm(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timer.has_fired());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timer.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let timer = TimerHandle::arm(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_runtime_no_timer() {
        assert!(TimerHandle::arm(Duration::from_millis(1), async {}).is_none());
    }
}
