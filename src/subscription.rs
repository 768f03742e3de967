use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a query's observer group currently stands with respect to automatic revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disabled,
    Unobserved,
    Observed,
}

/// A state change reported by [`SubscriptionManager`]. Transitions are the only trigger for arming or disarming the
/// revalidation and pruning timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from:     SubscriptionState,
    pub to:       SubscriptionState,
    /// Observer count before the change.
    pub previous: usize,
    /// Observer count after the change.
    pub count:    usize,
}

impl Transition {
    /// The last observer is gone.
    pub fn became_unobserved(&self) -> bool {
        self.previous > 0 && self.count == 0
    }

    pub fn became_disabled(&self) -> bool {
        self.to == SubscriptionState::Disabled && self.from != SubscriptionState::Disabled
    }

    pub fn became_enabled(&self) -> bool {
        self.from == SubscriptionState::Disabled && self.to != SubscriptionState::Disabled
    }
}

#[derive(Debug, Default)]
struct Counters {
    enabled: bool,
    count:   usize,
}

impl Counters {
    fn state(&self) -> SubscriptionState {
        if !self.enabled {
            SubscriptionState::Disabled
        }
        else if self.count == 0 {
            SubscriptionState::Unobserved
        }
        else {
            SubscriptionState::Observed
        }
    }
}

/// Reference counter of a query's observers plus its auto-revalidation switch. Performs no I/O.
#[derive(Debug)]
pub struct SubscriptionManager {
    counters: Mutex<Counters>,
}

impl SubscriptionManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            counters: Mutex::new(Counters { enabled, count: 0 }),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.counters.lock().state()
    }

    pub fn is_enabled(&self) -> bool {
        self.counters.lock().enabled
    }

    pub fn count(&self) -> usize {
        self.counters.lock().count
    }

    /// Both the switch and the count are read under the same lock.
    pub fn snapshot(&self) -> (bool, usize) {
        let counters = self.counters.lock();
        (counters.enabled, counters.count)
    }

    /// Register a new observer. The returned handle unregisters it when disposed or dropped.
    pub fn subscribe(self: &Arc<Self>) -> (SubscriptionHandle, Transition) {
        let transition = self.update(|c| c.count += 1);
        (
            SubscriptionHandle {
                manager:  Arc::clone(self),
                disposed: AtomicBool::new(false),
            },
            transition,
        )
    }

    pub fn set_enabled(&self, enabled: bool) -> Transition {
        self.update(|c| c.enabled = enabled)
    }

    fn unsubscribe(&self) -> Transition {
        self.update(|c| c.count = c.count.saturating_sub(1))
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) -> Transition {
        let mut counters = self.counters.lock();
        let from = counters.state();
        let previous = counters.count;
        f(&mut counters);
        Transition {
            from,
            to: counters.state(),
            previous,
            count: counters.count,
        }
    }
}

/// Disposable registration of one observer with a [`SubscriptionManager`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    manager:  Arc<SubscriptionManager>,
    disposed: AtomicBool,
}

impl SubscriptionHandle {
    /// Unregister the observer. Only the first call has an effect and reports a transition.
    pub fn dispose(&self) -> Option<Transition> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.manager.unsubscribe())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionState::*;

    #[test]
    fn counts_observers() {
        let manager = Arc::new(SubscriptionManager::new(true));
        assert_eq!(manager.state(), Unobserved);

        let (first, t) = manager.subscribe();
        assert_eq!((t.from, t.to, t.count), (Unobserved, Observed, 1));
        let (second, t) = manager.subscribe();
        assert_eq!((t.from, t.to, t.count), (Observed, Observed, 2));

        let t = first.dispose().unwrap();
        assert_eq!((t.to, t.count), (Observed, 1));
        assert!(!t.became_unobserved());
        // Redundant disposal is a no-op.
        assert!(first.dispose().is_none());
        assert_eq!(manager.count(), 1);

        drop(second);
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.state(), Unobserved);
        drop(first);
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn last_observer_leaving() {
        let manager = Arc::new(SubscriptionManager::new(true));
        let (handle, _) = manager.subscribe();
        assert!(handle.dispose().unwrap().became_unobserved());

        let disabled = Arc::new(SubscriptionManager::new(false));
        let (handle, t) = disabled.subscribe();
        assert_eq!((t.from, t.to), (Disabled, Disabled));
        let t = handle.dispose().unwrap();
        assert_eq!((t.to, t.count), (Disabled, 0));
        assert!(t.became_unobserved());
    }

    #[test]
    fn enabling_keeps_count() {
        let manager = Arc::new(SubscriptionManager::new(true));
        let (_handle, _) = manager.subscribe();

        let t = manager.set_enabled(false);
        assert!(t.became_disabled());
        assert_eq!((t.to, t.count), (Disabled, 1));
        assert_eq!(manager.snapshot(), (false, 1));

        let t = manager.set_enabled(true);
        assert!(t.became_enabled());
        assert_eq!((t.to, t.count), (Observed, 1));

        let t = manager.set_enabled(true);
        assert!(!t.became_enabled());
    }
}
