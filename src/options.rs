use fieldx::fxstruct;
use std::time::Duration;

/// Static configuration of a query group.
///
/// ```ignore
/// let options = QueryOptions::builder()
///     .stale_time(Duration::from_secs(30))
///     .cache_time(Duration::from_secs(60))
///     .keep_previous_data(true)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
#[fxstruct(no_new, builder, get(copy))]
pub struct QueryOptions {
    /// How long fetched data is considered fresh. `Duration::ZERO` or `Duration::MAX` turn automatic background
    /// revalidation off; manual refetches keep working.
    #[fieldx(default(Duration::from_secs(2 * 60)))]
    stale_time: Duration,

    /// Grace period between the last observer of a key leaving and the key's entry being pruned.
    #[fieldx(default(Duration::from_secs(5 * 60)))]
    cache_time: Duration,

    /// Never arm the stale revalidation timer.
    #[fieldx(default(false))]
    disable_auto_refetching: bool,

    /// When the query key changes, keep showing the previous key's data until the new key's fetch settles.
    #[fieldx(default(false))]
    keep_previous_data: bool,

    /// Emit a debug event for every cache hit, miss, fetch start and settlement.
    #[fieldx(default(false))]
    debug_mode: bool,

    /// Query group name. Most useful for debugging and logging.
    #[fieldx(default("query"))]
    name: &'static str,
}

impl QueryOptions {
    /// The delay to arm the stale revalidation timer with, or `None` if automatic revalidation is off.
    pub fn revalidation_interval(&self) -> Option<Duration> {
        let stale_time = self.stale_time();
        if self.disable_auto_refetching() || stale_time.is_zero() || stale_time == Duration::MAX {
            None
        }
        else {
            Some(stale_time)
        }
    }

    /// Whether data fetched `age` ago must be refetched.
    pub fn is_stale_at(&self, age: Duration) -> bool {
        age >= self.stale_time()
    }
}
