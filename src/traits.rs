use crate::key::QueryKey;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::fmt::Display;

/// The data source behind a query group.
///
/// The fetcher is the only place where actual I/O happens. It may be invoked concurrently for different parameters,
/// but never concurrently for parameters sharing the same [`QueryKey`] within one query group.
#[async_trait]
pub trait QueryFetcher: Sized + Send + Sync + 'static {
    /// Parameters the query key is derived from. They must serialize into a map.
    type Params: Serialize + Debug + Clone + Send + Sync + 'static;
    type Data: Debug + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    async fn fetch(&self, params: Self::Params) -> Result<Self::Data, Self::Error>;

    /// Called with freshly fetched data before it is put into the cache.
    #[inline(always)]
    async fn on_fetched(&self, _key: &QueryKey, _data: &Self::Data) {}

    /// Called when a fetch fails. Previously cached data, if any, is kept intact.
    #[inline(always)]
    async fn on_error(&self, _key: &QueryKey, _error: &Self::Error) {}
}
