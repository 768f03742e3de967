//! # query-cache
//!
//! Reference-counted, stale-time driven query cache with request deduplication and background revalidation.
//!
//! Think of it as the data layer behind reactive views: many independent observers ask for the same logical data at
//! overlapping times and the cache makes sure they are served from one place.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Data is identified by a parameter object; e.g., an account address plus a chain id.
//! - Fetching it is slow or expensive; e.g., a network round-trip.
//! - Many observers come and go at a high rate, like rows of a scrolled list.
//!
//! The cache operates on the following principles:
//!
//! - Parameters are turned into a canonical [`QueryKey`]: the order of fields doesn't matter, `None` fields are
//!   omitted.
//! - At most one fetch per key is in flight at any moment. Concurrent observers of a key await the same fetch and
//!   receive the same outcome.
//! - Data younger than `stale_time` is served without fetching. Older data is still served while a fetch refreshes
//!   it in the background.
//! - Observed and enabled queries revalidate automatically once their data goes stale.
//! - A failed fetch never wipes cached data. The error is reported to the observers of that fetch only.
//! - When the last observer of a key leaves, the key's entry is pruned after `cache_time` unless somebody subscribes
//!   again in the meantime.
//! - Responses to outdated requests never overwrite newer data.
//!
//! # Fetcher
//!
//! The only place where actual I/O happens is the [`QueryFetcher`] implementation. Through its associated types it also
//! defines the types of query parameters, data and errors:
//!
//! ```ignore
//! struct Balances { rpc: RpcClient }
//!
//! #[async_trait]
//! impl QueryFetcher for Balances {
//!     type Params = BalanceParams;
//!     type Data = Balance;
//!     type Error = RpcError;
//!
//!     async fn fetch(&self, params: BalanceParams) -> Result<Balance, RpcError> {
//!         self.rpc.balance_of(&params.address).await
//!     }
//! }
//! ```
//!
//! # Queries And Subscriptions
//!
//! A [`QueryClient`] owns the cache of one logical query group. A [`Query`] is an observer group created from it; every
//! [`Subscription`] is one mounted observer. Dropping a subscription unsubscribes it.
//!
//! ```ignore
//! let client = QueryClient::new(Balances { rpc }, QueryOptions::builder().stale_time(Duration::from_secs(30)).build()?);
//! let query = client.query(BalanceParams { address: "0xabc".into() }, true)?;
//!
//! let subscription = query.subscribe();
//! let state = query.settled().await;
//! println!("{:?}", state.data);
//!
//! query.set_params(BalanceParams { address: "0xdef".into() })?;
//! ```
//!
//! # Logging
//!
//! The crate logs with [`tracing`]. With [`QueryOptions::debug_mode`](options::QueryOptions::debug_mode) on, every
//! cache hit, miss, fetch start and settlement is reported at the `debug` level; otherwise at `trace`.

// Emit at `debug` level when the query group is in debug mode, at `trace` otherwise.
macro_rules! qdebug {
    ($on:expr, $($arg:tt)+) => {
        if $on {
            ::tracing::debug!($($arg)+)
        }
        else {
            ::tracing::trace!($($arg)+)
        }
    };
}

pub(crate) mod cache;
pub mod client;
pub(crate) mod coordinator;
pub mod entry;
pub mod error;
pub mod key;
pub mod options;
pub mod query;
pub mod subscription;
pub mod timer;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use client::QueryClient;
#[doc(inline)]
pub use key::QueryKey;
#[doc(inline)]
pub use query::{Query, Subscription};
#[doc(inline)]
pub use traits::QueryFetcher;

pub mod prelude {
    pub use crate::client::QueryClient;
    pub use crate::entry::EntrySnapshot;
    pub use crate::error::{EncodingError, QueryError};
    pub use crate::key::{compute_key, QueryKey};
    pub use crate::options::QueryOptions;
    pub use crate::query::{Query, QueryStateOf, Subscription};
    pub use crate::traits::QueryFetcher;
    pub use crate::types::*;
}
