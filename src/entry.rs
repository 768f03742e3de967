use crate::error::QueryError;
use crate::timer::TimerHandle;
use crate::traits::QueryFetcher;
use futures::future::Shared;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a fetch settles with. Every observer awaiting the same fetch receives a clone of it.
pub type FetchOutcome<F> = Result<Arc<<F as QueryFetcher>::Data>, QueryError<<F as QueryFetcher>::Error>>;

// The receiving end of a running fetch task. `Shared` lets any number of observers await the one result.
pub(crate) type FetchChannel<F> = Shared<oneshot::Receiver<FetchOutcome<F>>>;

pub(crate) struct InFlight<F>
where
    F: QueryFetcher,
{
    pub(crate) generation: u64,
    pub(crate) channel:    FetchChannel<F>,
}

/// The most recently known state of one query key. Owned by [`CacheStore`](crate::cache::CacheStore); only ever
/// mutated under the store lock.
pub(crate) struct CacheEntry<F>
where
    F: QueryFetcher,
{
    pub(crate) data:               Option<Arc<F::Data>>,
    pub(crate) last_fetched_at:    Option<Instant>,
    pub(crate) subscription_count: usize,
    pub(crate) active_fetch:       Option<InFlight<F>>,
    pub(crate) cleanup_timer:      Option<TimerHandle>,
    // Identifies the armed cleanup timer so that a timer which fired late cannot prune on behalf of a newer one.
    pub(crate) cleanup_token:      u64,
    // Generation of the write `data` came from. Fetch results from older generations are discarded.
    pub(crate) data_generation:    u64,
}

impl<F> CacheEntry<F>
where
    F: QueryFetcher,
{
    pub(crate) fn new() -> Self {
        Self {
            data:               None,
            last_fetched_at:    None,
            subscription_count: 0,
            active_fetch:       None,
            cleanup_timer:      None,
            cleanup_token:      0,
            data_generation:    0,
        }
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.active_fetch.is_some()
    }

    /// Time since the last successful fetch, if there was one and it hasn't been invalidated.
    pub(crate) fn age(&self) -> Option<std::time::Duration> {
        self.last_fetched_at.map(|at| at.elapsed())
    }

    // Clock skew notwithstanding, the fetch timestamp never goes backwards.
    pub(crate) fn touch(&mut self) {
        let now = Instant::now();
        self.last_fetched_at = Some(self.last_fetched_at.map_or(now, |prev| prev.max(now)));
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot<F::Data> {
        EntrySnapshot {
            data:               self.data.clone(),
            last_fetched_at:    self.last_fetched_at,
            subscription_count: self.subscription_count,
            is_fetching:        self.is_fetching(),
            cleanup_pending:    self.cleanup_timer.is_some(),
        }
    }
}

impl<F> Debug for CacheEntry<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("data", &self.data)
            .field("last_fetched_at", &self.last_fetched_at)
            .field("subscription_count", &self.subscription_count)
            .field("active_fetch", &self.active_fetch.as_ref().map(|f| f.generation))
            .field("cleanup_pending", &self.cleanup_timer.is_some())
            .finish()
    }
}

/// A read-only copy of a cache entry's state.
pub struct EntrySnapshot<D> {
    pub data:               Option<Arc<D>>,
    /// `None` if never fetched or invalidated since.
    pub last_fetched_at:    Option<Instant>,
    pub subscription_count: usize,
    pub is_fetching:        bool,
    /// The entry is unobserved and scheduled for pruning.
    pub cleanup_pending:    bool,
}

impl<D> Clone for EntrySnapshot<D> {
    fn clone(&self) -> Self {
        Self {
            data:               self.data.clone(),
            last_fetched_at:    self.last_fetched_at,
            subscription_count: self.subscription_count,
            is_fetching:        self.is_fetching,
            cleanup_pending:    self.cleanup_pending,
        }
    }
}

impl<D> Debug for EntrySnapshot<D>
where
    D: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("data", &self.data)
            .field("last_fetched_at", &self.last_fetched_at)
            .field("subscription_count", &self.subscription_count)
            .field("is_fetching", &self.is_fetching)
            .field("cleanup_pending", &self.cleanup_pending)
            .finish()
    }
}
