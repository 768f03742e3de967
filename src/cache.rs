use crate::entry::{CacheEntry, EntrySnapshot, FetchOutcome};
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::timer::TimerHandle;
use crate::traits::QueryFetcher;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// What happened when a cleanup timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PruneOutcome {
    Pruned,
    /// A subscriber showed up while the timer was firing.
    Rescued,
    /// The timer has been replaced by a newer one.
    Superseded,
    /// A fetch is in flight. The entry is rescheduled once the fetch is applied.
    Deferred,
    Missing,
}

/// The shared mapping of query keys to cache entries of one query group.
///
/// Every mutation is a single synchronous step under the entries lock. The lock is never held across an `.await`.
pub(crate) struct CacheStore<F>
where
    F: QueryFetcher,
{
    name:       &'static str,
    debug:      bool,
    cache_time: Duration,
    entries:    Mutex<HashMap<QueryKey, CacheEntry<F>>>,
    generation: AtomicU64,
    myself:     Weak<Self>,
}

impl<F> CacheStore<F>
where
    F: QueryFetcher,
{
    pub(crate) fn new(options: &QueryOptions) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            name:       options.name(),
            debug:      options.debug_mode(),
            cache_time: options.cache_time(),
            entries:    Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            myself:     myself.clone(),
        })
    }

    #[inline]
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<F>>> {
        self.entries.lock()
    }

    /// Allocate a write generation. Generations are unique across the store and strictly increasing.
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn get(&self, key: &QueryKey) -> Option<EntrySnapshot<F::Data>> {
        self.entries.lock().get(key).map(CacheEntry::snapshot)
    }

    pub(crate) fn data(&self, key: &QueryKey) -> Option<Arc<F::Data>> {
        self.entries.lock().get(key).and_then(|e| e.data.clone())
    }

    /// Remaining freshness of the key's data or `None` if there is no data or it is stale already.
    pub(crate) fn fresh_for(&self, key: &QueryKey, stale_time: Duration) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        entry.data.as_ref()?;
        let age = entry.age()?;
        (age < stale_time).then(|| stale_time - age)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Add `count` subscription references to the key's entry, creating the entry if necessary. A pending cleanup is
    /// cancelled and the entry with its data is reused.
    pub(crate) fn upsert_on_subscribe(&self, key: &QueryKey, count: usize) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            qdebug!(self.debug, cache = self.name, %key, "new cache entry");
            CacheEntry::new()
        });
        entry.subscription_count += count;
        if let Some(timer) = entry.cleanup_timer.take() {
            timer.cancel();
            qdebug!(self.debug, cache = self.name, %key, "entry rescued from pruning");
        }
    }

    /// Drop `count` subscription references. When none are left the pruning countdown starts.
    pub(crate) fn release(&self, key: &QueryKey, count: usize) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key)
        else {
            trace!(cache = self.name, %key, "release of a missing entry");
            return;
        };
        entry.subscription_count = entry.subscription_count.saturating_sub(count);
        if entry.subscription_count == 0 && !self.schedule_cleanup(key, entry) {
            entries.remove(key);
            Self::release_storage(&mut entries);
        }
    }

    /// Put a settled fetch into the entry. Returns `true` if the data was stored.
    ///
    /// Failures never touch the cached data. A success is discarded if the entry has been written by a later
    /// generation meanwhile.
    pub(crate) fn apply_fetch_result(&self, key: &QueryKey, generation: u64, outcome: &FetchOutcome<F>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key)
        else {
            trace!(cache = self.name, %key, generation, "fetch settled for a dropped entry");
            return false;
        };

        if entry.active_fetch.as_ref().is_some_and(|f| f.generation == generation) {
            entry.active_fetch = None;
        }

        let applied = match outcome {
            Ok(data) if generation > entry.data_generation => {
                entry.data = Some(Arc::clone(data));
                entry.data_generation = generation;
                entry.touch();
                true
            }
            Ok(_) => {
                qdebug!(self.debug, cache = self.name, %key, generation, "discarding outdated fetch result");
                false
            }
            Err(_) => false,
        };

        if entry.subscription_count == 0
            && entry.active_fetch.is_none()
            && entry.cleanup_timer.is_none()
            && !self.schedule_cleanup(key, entry)
        {
            entries.remove(key);
            Self::release_storage(&mut entries);
        }

        applied
    }

    /// Write data directly. Any fetch in flight for the key at this moment will not overwrite it.
    pub(crate) fn set_data(&self, key: &QueryKey, data: Arc<F::Data>) {
        let generation = self.next_generation();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        entry.data = Some(data);
        entry.data_generation = generation;
        entry.touch();
        if entry.subscription_count == 0
            && entry.cleanup_timer.is_none()
            && !entry.is_fetching()
            && !self.schedule_cleanup(key, entry)
        {
            entries.remove(key);
            Self::release_storage(&mut entries);
        }
    }

    /// Mark the key's data stale while keeping it. Returns `false` if there is no such entry.
    pub(crate) fn invalidate(&self, key: &QueryKey) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_fetched_at = None;
                qdebug!(self.debug, cache = self.name, %key, "invalidated");
                true
            }
            None => false,
        }
    }

    pub(crate) fn prune(&self, key: &QueryKey, token: u64) -> PruneOutcome {
        let mut entries = self.entries.lock();
        let outcome = match entries.get_mut(key) {
            None => PruneOutcome::Missing,
            Some(entry) if entry.cleanup_token != token => PruneOutcome::Superseded,
            Some(entry) if entry.subscription_count > 0 => {
                entry.cleanup_timer = None;
                PruneOutcome::Rescued
            }
            Some(entry) if entry.is_fetching() => {
                entry.cleanup_timer = None;
                PruneOutcome::Deferred
            }
            Some(_) => PruneOutcome::Pruned,
        };

        if outcome == PruneOutcome::Pruned {
            entries.remove(key);
            Self::release_storage(&mut entries);
            qdebug!(self.debug, cache = self.name, %key, "pruned");
        }
        else {
            trace!(cache = self.name, %key, ?outcome, "cleanup timer fired");
        }
        outcome
    }

    /// Forget all cached data. Unobserved entries are dropped along with their pending timers. Observed ones keep only
    /// their subscription references. Fetches in flight complete, but their results go nowhere except to their awaiting
    /// observers.
    pub(crate) fn destroy(&self) {
        let generation = self.next_generation();
        let (dropped, kept) = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.subscription_count > 0);
            for entry in entries.values_mut() {
                entry.data = None;
                entry.last_fetched_at = None;
                entry.active_fetch = None;
                entry.data_generation = generation;
            }
            Self::release_storage(&mut entries);
            (before - entries.len(), entries.len())
        };
        qdebug!(self.debug, cache = self.name, dropped, kept, "destroyed");
    }

    // Returns `false` if no timer could be armed; the caller is expected to drop the entry right away then.
    fn schedule_cleanup(&self, key: &QueryKey, entry: &mut CacheEntry<F>) -> bool {
        if entry.is_fetching() {
            return true;
        }

        entry.cleanup_token += 1;
        let token = entry.cleanup_token;
        let store = self.myself.clone();
        let timer_key = key.clone();
        entry.cleanup_timer = TimerHandle::arm(self.cache_time, async move {
            if let Some(store) = store.upgrade() {
                store.prune(&timer_key, token);
            }
        });

        if entry.cleanup_timer.is_some() {
            qdebug!(self.debug, cache = self.name, %key, cache_time = ?self.cache_time, "unobserved, pruning scheduled");
            true
        }
        else {
            trace!(cache = self.name, %key, "no runtime to schedule pruning on");
            false
        }
    }

    fn release_storage(entries: &mut HashMap<QueryKey, CacheEntry<F>>) {
        if entries.is_empty() {
            entries.shrink_to_fit();
        }
    }
}

impl<F> Debug for CacheStore<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("cache_time", &self.cache_time)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
