use crate::error::QueryError;
use crate::key::QueryKey;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

pub use crate::subscription::{SubscriptionState, Transition};

/// Coarse state of a query, derived from its [`QueryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing fetched yet and nothing in flight.
    Idle,
    /// A fetch is in flight.
    Loading,
    Success,
    Error,
}

/// What an observer sees.
pub struct QueryState<D, E>
where
    E: Debug + Display,
{
    /// The data for `query_key`, or for the previous key while `keep_previous_data` is in effect.
    pub data:        Option<Arc<D>>,
    /// Outcome of this query's last fetch attempt. Never shared with other queries.
    pub error:       Option<QueryError<E>>,
    pub is_fetching: bool,
    /// The key `data` belongs to.
    pub query_key:   QueryKey,
}

impl<D, E> QueryState<D, E>
where
    E: Debug + Display,
{
    pub(crate) fn new(query_key: QueryKey) -> Self {
        Self {
            data: None,
            error: None,
            is_fetching: false,
            query_key,
        }
    }

    pub fn status(&self) -> QueryStatus {
        if self.is_fetching {
            QueryStatus::Loading
        }
        else if self.error.is_some() {
            QueryStatus::Error
        }
        else if self.data.is_some() {
            QueryStatus::Success
        }
        else {
            QueryStatus::Idle
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Fetching with nothing to show yet.
    pub fn is_initial_loading(&self) -> bool {
        self.is_fetching && self.data.is_none()
    }
}

impl<D, E> Clone for QueryState<D, E>
where
    E: Debug + Display,
{
    fn clone(&self) -> Self {
        Self {
            data:        self.data.clone(),
            error:       self.error.clone(),
            is_fetching: self.is_fetching,
            query_key:   self.query_key.clone(),
        }
    }
}

impl<D, E> Debug for QueryState<D, E>
where
    D: Debug,
    E: Debug + Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_fetching", &self.is_fetching)
            .field("query_key", &self.query_key)
            .finish()
    }
}
