use crate::cache::CacheStore;
use crate::entry::{CacheEntry, FetchChannel, FetchOutcome, InFlight};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::traits::QueryFetcher;
use futures::FutureExt;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// What [`FetchCoordinator::ensure`] decided to do for a key.
pub(crate) enum Plan<F>
where
    F: QueryFetcher,
{
    /// The cached data is fresh for at least `fresh_for` more. `fetching` tells if a forced fetch is in flight anyway.
    Fresh {
        data:      Arc<F::Data>,
        fresh_for: Duration,
        fetching:  bool,
    },
    /// A fetch is in flight, either just started or joined. `cached` is whatever stale data the entry still has.
    Pending {
        fetch:  PendingFetch<F>,
        cached: Option<Arc<F::Data>>,
    },
}

/// A handle on a fetch in flight. Any number of them may exist for the same fetch.
pub(crate) struct PendingFetch<F>
where
    F: QueryFetcher,
{
    key:        QueryKey,
    generation: u64,
    started:    bool,
    channel:    FetchChannel<F>,
}

impl<F> PendingFetch<F>
where
    F: QueryFetcher,
{
    /// `false` if an already running fetch has been joined.
    #[inline]
    pub(crate) fn started(&self) -> bool {
        self.started
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) async fn wait(self) -> FetchOutcome<F> {
        // The sender only gets dropped without sending if the fetch task has been torn down with the runtime.
        self.channel.await.unwrap_or(Err(QueryError::Aborted { key: self.key }))
    }
}

/// Serves a key from the cache or makes sure exactly one fetch is running for it.
pub(crate) struct FetchCoordinator<F>
where
    F: QueryFetcher,
{
    fetcher: Arc<F>,
    store:   Arc<CacheStore<F>>,
    options: QueryOptions,
}

impl<F> FetchCoordinator<F>
where
    F: QueryFetcher,
{
    pub(crate) fn new(fetcher: F, options: QueryOptions) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            store: CacheStore::new(&options),
            options,
        }
    }

    #[inline]
    pub(crate) fn store(&self) -> &Arc<CacheStore<F>> {
        &self.store
    }

    #[inline]
    pub(crate) fn options(&self) -> &QueryOptions {
        &self.options
    }

    #[inline]
    pub(crate) fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    /// Decide between fresh cached data, joining the fetch in flight, or starting a new fetch. With `force` the data is
    /// treated as stale no matter its age.
    ///
    /// The decision and the registration of a new fetch happen under a single store lock, therefore two callers can
    /// never both start a fetch for the same key.
    pub(crate) fn ensure(&self, key: &QueryKey, params: &F::Params, force: bool) -> Plan<F> {
        let debug = self.options.debug_mode();
        let name = self.options.name();
        let mut entries = self.store.lock();
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);

        if !force {
            if let (Some(data), Some(age)) = (&entry.data, entry.age()) {
                if !self.options.is_stale_at(age) {
                    qdebug!(debug, query = name, %key, ?age, "cache hit");
                    return Plan::Fresh {
                        data:      Arc::clone(data),
                        fresh_for: self.options.stale_time().saturating_sub(age),
                        fetching:  entry.is_fetching(),
                    };
                }
            }
        }

        let cached = entry.data.clone();
        if let Some(in_flight) = &entry.active_fetch {
            qdebug!(debug, query = name, %key, generation = in_flight.generation, "joining active fetch");
            return Plan::Pending {
                fetch: PendingFetch {
                    key: key.clone(),
                    generation: in_flight.generation,
                    started: false,
                    channel: in_flight.channel.clone(),
                },
                cached,
            };
        }

        let generation = self.store.next_generation();
        qdebug!(debug, query = name, %key, generation, stale = cached.is_some(), "cache miss, fetching");
        let channel = self.spawn_fetch(key.clone(), params.clone(), generation);
        entry.active_fetch = Some(InFlight {
            generation,
            channel: channel.clone(),
        });

        Plan::Pending {
            fetch: PendingFetch {
                key: key.clone(),
                generation,
                started: true,
                channel,
            },
            cached,
        }
    }

    // The task settles the store before publishing the outcome so that every joiner observes the updated entry.
    fn spawn_fetch(&self, key: QueryKey, params: F::Params, generation: u64) -> FetchChannel<F> {
        let (tx, rx) = oneshot::channel();
        let fetcher = Arc::clone(&self.fetcher);
        let store = Arc::clone(&self.store);
        let debug = self.options.debug_mode();

        tokio::spawn(async move {
            let attempt = async {
                match fetcher.fetch(params).await {
                    Ok(data) => {
                        fetcher.on_fetched(&key, &data).await;
                        Ok(data)
                    }
                    Err(err) => {
                        fetcher.on_error(&key, &err).await;
                        Err(err)
                    }
                }
            };

            let outcome: FetchOutcome<F> = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(Ok(data)) => {
                    qdebug!(debug, query = store.name(), %key, generation, "fetch succeeded");
                    Ok(Arc::new(data))
                }
                Ok(Err(err)) => {
                    qdebug!(debug, query = store.name(), %key, generation, error = %err, "fetch failed");
                    Err(QueryError::fetch(&key, err))
                }
                Err(_) => {
                    warn!(query = store.name(), %key, generation, "fetcher panicked");
                    Err(QueryError::Aborted { key: key.clone() })
                }
            };

            store.apply_fetch_result(&key, generation, &outcome);
            if tx.send(outcome).is_err() {
                trace!(query = store.name(), %key, generation, "nobody is waiting for the fetch");
            }
        });

        rx.shared()
    }
}

impl<F> Debug for FetchCoordinator<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish()
    }
}
