use crate::coordinator::{FetchCoordinator, Plan};
use crate::entry::{EntrySnapshot, FetchOutcome};
use crate::error::EncodingError;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::Query;
use crate::traits::QueryFetcher;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// A logical query group: one fetcher, one set of options and the cache shared by every query created from it.
///
/// ```ignore
/// let client = QueryClient::new(BalanceFetcher::new(rpc), QueryOptions::builder().build()?);
/// let query = client.query(BalanceParams { address: "0xabc".into() }, true)?;
/// let subscription = query.subscribe();
/// let state = query.settled().await;
/// ```
///
/// Clones share the cache. The cache lives until the last clone and the last query are gone, or until
/// [`destroy`](Self::destroy) is called.
pub struct QueryClient<F>
where
    F: QueryFetcher,
{
    coordinator: Arc<FetchCoordinator<F>>,
}

impl<F> QueryClient<F>
where
    F: QueryFetcher,
{
    pub fn new(fetcher: F, options: QueryOptions) -> Self {
        Self {
            coordinator: Arc::new(FetchCoordinator::new(fetcher, options)),
        }
    }

    pub fn options(&self) -> &QueryOptions {
        self.coordinator.options()
    }

    pub fn fetcher(&self) -> &F {
        self.coordinator.fetcher()
    }

    /// Create an observer group for `params`. Nothing is fetched until it gets a subscriber.
    pub fn query(&self, params: F::Params, enabled: bool) -> Result<Query<F>, EncodingError> {
        Query::new(Arc::clone(&self.coordinator), params, enabled)
    }

    /// Fresh cached data, or the outcome of a fetch started or joined for `params`. No subscription is involved, hence
    /// fetched data becomes subject to pruning right away.
    pub async fn fetch(&self, params: F::Params) -> FetchOutcome<F> {
        let key = QueryKey::from_params(&params)?;
        match self.coordinator.ensure(&key, &params, false) {
            Plan::Fresh { data, .. } => Ok(data),
            Plan::Pending { fetch, .. } => fetch.wait().await,
        }
    }

    /// Cached data for `params`, fresh or stale.
    pub fn get_data(&self, params: &F::Params) -> Result<Option<Arc<F::Data>>, EncodingError> {
        Ok(self.coordinator.store().data(&QueryKey::from_params(params)?))
    }

    /// Whether bringing `params` up to date requires a fetch.
    pub fn is_stale(&self, params: &F::Params) -> Result<bool, EncodingError> {
        let key = QueryKey::from_params(params)?;
        Ok(self
            .coordinator
            .store()
            .fresh_for(&key, self.options().stale_time())
            .is_none())
    }

    /// Put data into the cache as if it was just fetched. A fetch in flight for the same key will not overwrite it.
    pub fn set_data(&self, params: &F::Params, data: F::Data) -> Result<(), EncodingError> {
        let key = QueryKey::from_params(params)?;
        self.coordinator.store().set_data(&key, Arc::new(data));
        Ok(())
    }

    /// Mark cached data stale without dropping it. Returns `false` if nothing is cached for `params`.
    pub fn invalidate(&self, params: &F::Params) -> Result<bool, EncodingError> {
        Ok(self.coordinator.store().invalidate(&QueryKey::from_params(params)?))
    }

    pub fn entry(&self, key: &QueryKey) -> Option<EntrySnapshot<F::Data>> {
        self.coordinator.store().get(key)
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.coordinator.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinator.store().is_empty()
    }

    /// Forget all cached data and cancel all pending pruning. Queries created from this client stay usable and start
    /// over with an empty cache; their mounted observers keep holding references to their keys.
    pub fn destroy(&self) {
        self.coordinator.store().destroy();
    }
}

impl<F> Clone for QueryClient<F>
where
    F: QueryFetcher,
{
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<F> Debug for QueryClient<F>
where
    F: QueryFetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
