use crate::key::QueryKey;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;

/// Query parameters could not be turned into a [`QueryKey`].
#[derive(Debug, Clone, Error)]
pub enum EncodingError {
    #[error("query parameters are not serializable: {0}")]
    Serialize(Arc<serde_json::Error>),

    /// Parameters must serialize into a map (a struct, a map, or unit for "no parameters").
    #[error("query parameters must serialize into a map, got {0}")]
    NotAMap(&'static str),
}

impl From<serde_json::Error> for EncodingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }
}

/// Errors reported to query observers.
///
/// A failed fetch is shared by every observer that awaited it, hence the error is cheaply cloneable and the fetcher's
/// own error is kept behind an `Arc`. Errors never make it into the shared cache entries.
#[derive(Debug, Error)]
pub enum QueryError<E>
where
    E: Debug + Display,
{
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("fetch for query key {key} failed: {cause}")]
    Fetch { key: QueryKey, cause: Arc<E> },

    #[error("fetch for query key {key} was aborted before producing a result")]
    Aborted { key: QueryKey },
}

impl<E> QueryError<E>
where
    E: Debug + Display,
{
    pub(crate) fn fetch(key: &QueryKey, cause: E) -> Self {
        Self::Fetch {
            key:   key.clone(),
            cause: Arc::new(cause),
        }
    }

    /// The fetcher's error, if this is a fetch failure.
    pub fn cause(&self) -> Option<&Arc<E>> {
        match self {
            Self::Fetch { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encoding(_))
    }
}

// Deriving would require `E: Clone`, which is not needed with the cause behind an `Arc`.
impl<E> Clone for QueryError<E>
where
    E: Debug + Display,
{
    fn clone(&self) -> Self {
        match self {
            Self::Encoding(err) => Self::Encoding(err.clone()),
            Self::Fetch { key, cause } => Self::Fetch {
                key:   key.clone(),
                cause: Arc::clone(cause),
            },
            Self::Aborted { key } => Self::Aborted { key: key.clone() },
        }
    }
}
