use crate::coordinator::{FetchCoordinator, PendingFetch, Plan};
use crate::entry::FetchOutcome;
use crate::error::{EncodingError, QueryError};
use crate::key::QueryKey;
use crate::subscription::{SubscriptionHandle, SubscriptionManager, SubscriptionState};
use crate::timer::TimerHandle;
use crate::traits::QueryFetcher;
use crate::types::QueryState;
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// The observer-facing state of a query backed by fetcher `F`.
pub type QueryStateOf<F> = QueryState<<F as QueryFetcher>::Data, <F as QueryFetcher>::Error>;

struct Local<F>
where
    F: QueryFetcher,
{
    params:        F::Params,
    // The key subscription references are held on and fetches are issued for.
    key:           QueryKey,
    // The key `data` belongs to. Differs from `key` only while previous data is kept.
    displayed_key: QueryKey,
    data:          Option<Arc<F::Data>>,
    error:         Option<QueryError<F::Error>>,
    is_fetching:   bool,
    stale_timer:   Option<TimerHandle>,
}

impl<F> Local<F>
where
    F: QueryFetcher,
{
    fn has_stale_timer(&self) -> bool {
        self.stale_timer.as_ref().is_some_and(|t| !t.has_fired())
    }

    fn cancel_stale_timer(&mut self) -> bool {
        self.stale_timer.take().map(TimerHandle::cancel).is_some()
    }
}

enum Started<F>
where
    F: QueryFetcher,
{
    Fresh(Arc<F::Data>),
    Pending {
        fetch_id: u64,
        key:      QueryKey,
        fetch:    PendingFetch<F>,
    },
}

struct QueryInner<F>
where
    F: QueryFetcher,
{
    coordinator:   Arc<FetchCoordinator<F>>,
    subscriptions: Arc<SubscriptionManager>,
    local:         Mutex<Local<F>>,
    // Id of the most recent fetch this query has started or joined. Settlements of older ones leave the state alone.
    latest_fetch:  AtomicU64,
    state_tx:      watch::Sender<QueryStateOf<F>>,
    myself:        Weak<Self>,
}

impl<F> QueryInner<F>
where
    F: QueryFetcher,
{
    #[inline]
    fn debug(&self) -> bool {
        self.coordinator.options().debug_mode()
    }

    #[inline]
    fn name(&self) -> &'static str {
        self.coordinator.options().name()
    }

    fn snapshot(&self, local: &Local<F>) -> QueryStateOf<F> {
        QueryState {
            data:        self
                .coordinator
                .store()
                .data(&local.displayed_key)
                .or_else(|| local.data.clone()),
            error:       local.error.clone(),
            is_fetching: local.is_fetching,
            query_key:   local.displayed_key.clone(),
        }
    }

    fn publish(&self, local: &Local<F>) {
        self.state_tx.send_replace(self.snapshot(local));
    }

    // Switch the displayed data to `key`. Without anything cached for it, previous data stays if so configured.
    fn show_key(&self, local: &mut Local<F>, key: &QueryKey, cached: Option<Arc<F::Data>>) {
        if local.displayed_key == *key {
            if cached.is_some() {
                local.data = cached;
            }
        }
        else if cached.is_some() || !self.coordinator.options().keep_previous_data() {
            local.displayed_key = key.clone();
            local.data = cached;
        }
    }

    fn start(&self, force: bool) -> Started<F> {
        let mut local = self.local.lock();
        self.start_locked(&mut local, force)
    }

    fn start_locked(&self, local: &mut Local<F>, force: bool) -> Started<F> {
        let key = local.key.clone();

        let started = match self.coordinator.ensure(&key, &local.params, force) {
            Plan::Fresh {
                data,
                fresh_for,
                fetching,
            } => {
                local.displayed_key = key;
                local.data = Some(Arc::clone(&data));
                // A fetch this query awaits for the same key, a forced one for instance, still owns the outcome.
                if !(fetching && local.is_fetching) {
                    self.latest_fetch.fetch_add(1, Ordering::AcqRel);
                    local.error = None;
                    local.is_fetching = false;
                }
                if !local.has_stale_timer() {
                    self.arm_stale_timer(local, fresh_for);
                }
                Started::Fresh(data)
            }
            Plan::Pending { fetch, cached } => {
                let fetch_id = self.latest_fetch.fetch_add(1, Ordering::AcqRel) + 1;
                if !fetch.started() {
                    qdebug!(self.debug(), query = self.name(), %key, "awaiting a fetch started elsewhere");
                }
                self.show_key(local, &key, cached);
                local.is_fetching = true;
                Started::Pending { fetch_id, key, fetch }
            }
        };

        self.publish(local);
        started
    }

    async fn finish(&self, fetch_id: u64, key: QueryKey, fetch: PendingFetch<F>) -> FetchOutcome<F> {
        let generation = fetch.generation();
        let outcome = fetch.wait().await;

        let mut local = self.local.lock();
        if self.latest_fetch.load(Ordering::Acquire) != fetch_id {
            qdebug!(self.debug(), query = self.name(), %key, generation, "superseded fetch settled, state left intact");
            return outcome;
        }

        local.is_fetching = false;
        match &outcome {
            Ok(data) => {
                // A newer direct write may have outdated the fetched data.
                let current = self.coordinator.store().data(&key).unwrap_or_else(|| Arc::clone(data));
                local.displayed_key = key;
                local.data = Some(current);
                local.error = None;
                if let Some(delay) = self.coordinator.options().revalidation_interval() {
                    local.cancel_stale_timer();
                    self.arm_stale_timer(&mut local, delay);
                }
            }
            Err(err) => {
                qdebug!(self.debug(), query = self.name(), %key, error = %err, "query failed");
                if local.displayed_key != key {
                    local.data = self.coordinator.store().data(&key);
                    local.displayed_key = key;
                }
                local.error = Some(err.clone());
            }
        }

        self.publish(&local);
        outcome
    }

    async fn run(&self, force: bool) -> FetchOutcome<F> {
        match self.start(force) {
            Started::Fresh(data) => Ok(data),
            Started::Pending { fetch_id, key, fetch } => self.finish(fetch_id, key, fetch).await,
        }
    }

    // Completes a started fetch in the background. Whatever comes out of it is reflected in the query state.
    fn spawn_finish(&self, started: Started<F>) {
        let Started::Pending { fetch_id, key, fetch } = started
        else {
            return;
        };
        let Some(myself) = self.myself.upgrade()
        else {
            return;
        };
        tokio::spawn(async move {
            let _ = myself.finish(fetch_id, key, fetch).await;
        });
    }

    fn arm_stale_timer(&self, local: &mut Local<F>, delay: Duration) {
        if self.coordinator.options().revalidation_interval().is_none() {
            return;
        }
        let (enabled, count) = self.subscriptions.snapshot();
        if !enabled || count == 0 {
            return;
        }

        let myself = self.myself.clone();
        local.stale_timer = TimerHandle::arm(delay, async move {
            if let Some(query) = myself.upgrade() {
                query.revalidate().await;
            }
        });
        trace!(query = self.name(), key = %local.key, ?delay, "stale timer armed");
    }

    async fn revalidate(&self) {
        {
            let mut local = self.local.lock();
            if local.stale_timer.as_ref().is_some_and(|t| t.has_fired()) {
                local.stale_timer = None;
            }
        }

        let (enabled, count) = self.subscriptions.snapshot();
        if !enabled || count == 0 {
            return;
        }

        qdebug!(self.debug(), query = self.name(), "stale data, revalidating");
        let _ = self.run(false).await;
    }

    fn release(&self, handle: &SubscriptionHandle) {
        let mut local = self.local.lock();
        let Some(transition) = handle.dispose()
        else {
            return;
        };
        self.coordinator.store().release(&local.key, 1);
        if transition.became_unobserved() && local.cancel_stale_timer() {
            trace!(query = self.name(), key = %local.key, "stale timer cancelled");
        }
        qdebug!(self.debug(), query = self.name(), key = %local.key, count = transition.count, "unsubscribed");
    }
}

/// A group of observers sharing one query definition: parameters, the enabled switch and the stale revalidation
/// timer. All queries of a [`QueryClient`](crate::client::QueryClient) share its cache.
///
/// Cloning a query produces another handle on the same group.
pub struct Query<F>
where
    F: QueryFetcher,
{
    inner: Arc<QueryInner<F>>,
}

impl<F> Query<F>
where
    F: QueryFetcher,
{
    pub(crate) fn new(
        coordinator: Arc<FetchCoordinator<F>>,
        params: F::Params,
        enabled: bool,
    ) -> Result<Self, EncodingError> {
        let key = QueryKey::from_params(&params)?;
        let (state_tx, _) = watch::channel(QueryState::new(key.clone()));
        let inner = Arc::new_cyclic(|myself| QueryInner {
            coordinator,
            subscriptions: Arc::new(SubscriptionManager::new(enabled)),
            local: Mutex::new(Local {
                params,
                key: key.clone(),
                displayed_key: key,
                data: None,
                error: None,
                is_fetching: false,
                stale_timer: None,
            }),
            latest_fetch: AtomicU64::new(0),
            state_tx,
            myself: myself.clone(),
        });
        Ok(Self { inner })
    }

    /// Mount an observer. Must be called within a tokio runtime.
    ///
    /// The observer adds a reference to the current key's cache entry. If the query is enabled, the entry is brought up
    /// to date in the background: fresh data is served right away, stale or missing data is fetched.
    pub fn subscribe(&self) -> Subscription<F> {
        let inner = &self.inner;
        let (handle, started) = {
            let mut local = inner.local.lock();
            let (handle, transition) = inner.subscriptions.subscribe();
            inner.coordinator.store().upsert_on_subscribe(&local.key, 1);
            qdebug!(inner.debug(), query = inner.name(), key = %local.key, count = transition.count, "subscribed");
            let started = (transition.to != SubscriptionState::Disabled).then(|| inner.start_locked(&mut local, false));
            (handle, started)
        };

        if let Some(started) = started {
            inner.spawn_finish(started);
        }

        Subscription {
            query: Arc::clone(inner),
            handle,
        }
    }

    /// Change the query parameters. Subscriptions move over to the new key; enabled and observed queries start bringing
    /// it up to date immediately.
    pub fn set_params(&self, params: F::Params) -> Result<(), EncodingError> {
        let key = QueryKey::from_params(&params)?;
        let inner = &self.inner;

        let started = {
            let mut local = inner.local.lock();
            local.params = params;
            if local.key == key {
                return Ok(());
            }

            let old_key = std::mem::replace(&mut local.key, key.clone());
            // Superseded fetches must not come back into the state.
            inner.latest_fetch.fetch_add(1, Ordering::AcqRel);
            local.is_fetching = false;
            let (enabled, count) = inner.subscriptions.snapshot();
            let store = inner.coordinator.store();
            if count > 0 {
                store.upsert_on_subscribe(&key, count);
                store.release(&old_key, count);
            }
            local.cancel_stale_timer();
            local.error = None;
            qdebug!(inner.debug(), query = inner.name(), from = %old_key, to = %key, "query key changed");

            if enabled && count > 0 {
                Some(inner.start_locked(&mut local, false))
            }
            else {
                let cached = store.data(&key);
                inner.show_key(&mut local, &key, cached);
                inner.publish(&local);
                None
            }
        };

        if let Some(started) = started {
            inner.spawn_finish(started);
        }
        Ok(())
    }

    /// Toggle automatic revalidation without touching subscriptions. Disabling cancels the pending stale timer but not a
    /// fetch in flight.
    pub fn set_enabled(&self, enabled: bool) {
        let inner = &self.inner;
        let started = {
            let mut local = inner.local.lock();
            let transition = inner.subscriptions.set_enabled(enabled);
            if transition.became_disabled() {
                local.cancel_stale_timer();
                qdebug!(inner.debug(), query = inner.name(), key = %local.key, "disabled");
                None
            }
            else if transition.became_enabled() {
                qdebug!(inner.debug(), query = inner.name(), key = %local.key, "enabled");
                (transition.count > 0).then(|| inner.start_locked(&mut local, false))
            }
            else {
                None
            }
        };

        if let Some(started) = started {
            inner.spawn_finish(started);
        }
    }

    /// Bring the current key up to date and wait for the outcome. Fresh data is returned without fetching.
    pub async fn ensure_fresh(&self) -> FetchOutcome<F> {
        self.inner.run(false).await
    }

    /// Fetch regardless of freshness. A fetch already in flight for the key is joined instead of starting another one.
    pub async fn refetch(&self) -> FetchOutcome<F> {
        self.inner.run(true).await
    }

    pub fn state(&self) -> QueryStateOf<F> {
        let local = self.inner.local.lock();
        self.inner.snapshot(&local)
    }

    /// A receiver updated on every state transition of this query: subscriptions, key changes and settlements of its
    /// own fetches.
    ///
    /// Writes to the cache made elsewhere, such as [`QueryClient::set_data`](crate::client::QueryClient::set_data) or a
    /// fetch settled through another query on the same key, show up in [`state`](Self::state) right away but reach
    /// the receiver only with this query's next transition.
    pub fn watch(&self) -> watch::Receiver<QueryStateOf<F>> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the query isn't fetching.
    pub async fn settled(&self) -> QueryStateOf<F> {
        let mut rx = self.watch();
        // The sender lives as long as this query does.
        let _ = rx.wait_for(|state| !state.is_fetching).await;
        self.state()
    }

    pub fn query_key(&self) -> QueryKey {
        self.inner.local.lock().key.clone()
    }

    pub fn params(&self) -> F::Params {
        self.inner.local.lock().params.clone()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.inner.subscriptions.state()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.count()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.subscriptions.is_enabled()
    }

    /// Whether a stale revalidation is currently scheduled.
    pub fn has_stale_timer(&self) -> bool {
        self.inner.local.lock().has_stale_timer()
    }
}

impl<F> Clone for Query<F>
where
    F: QueryFetcher,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> Debug for Query<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.inner.local.lock();
        f.debug_struct("Query")
            .field("name", &self.inner.name())
            .field("key", &local.key)
            .field("subscriptions", &self.inner.subscriptions)
            .field("is_fetching", &local.is_fetching)
            .finish()
    }
}

/// One mounted observer of a [`Query`]. Dropping it unsubscribes.
pub struct Subscription<F>
where
    F: QueryFetcher,
{
    query:  Arc<QueryInner<F>>,
    handle: SubscriptionHandle,
}

impl<F> Subscription<F>
where
    F: QueryFetcher,
{
    /// Redundant calls are no-ops.
    pub fn unsubscribe(&self) {
        self.query.release(&self.handle);
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_disposed()
    }

    pub fn query(&self) -> Query<F> {
        Query {
            inner: Arc::clone(&self.query),
        }
    }

    pub fn state(&self) -> QueryStateOf<F> {
        let local = self.query.local.lock();
        self.query.snapshot(&local)
    }
}

impl<F> Drop for Subscription<F>
where
    F: QueryFetcher,
{
    fn drop(&mut self) {
        self.query.release(&self.handle);
    }
}

impl<F> Debug for Subscription<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("query", &self.query.name())
            .field("active", &self.is_active())
            .finish()
    }
}
