use super::{balance_key, client, client_with, params, sleep_ms, BalanceFetcher, Step};
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::options::QueryOptions;
use crate::types::{QueryStatus, SubscriptionState};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn concurrent_observers_share_one_fetch() {
    let client = client(1000, 500);
    let queries: Vec<_> = (0..5).map(|_| client.query(params("0xabc"), true).unwrap()).collect();
    let subscriptions: Vec<_> = queries.iter().map(|q| q.subscribe()).collect();

    assert!(queries.iter().all(|q| q.state().is_initial_loading()));
    assert_eq!(client.entry(&balance_key("0xabc")).unwrap().subscription_count, 5);

    let states = join_all(queries.iter().map(|q| q.settled())).await;
    assert_eq!(client.fetcher().calls(), 1);
    let first = states[0].data.clone().unwrap();
    assert_eq!((first.address.as_str(), first.balance), ("0xabc", 100));
    for state in &states {
        assert!(Arc::ptr_eq(state.data.as_ref().unwrap(), &first));
        assert_eq!(state.status(), QueryStatus::Success);
    }

    // Imperative callers are deduplicated just the same.
    let outcomes = join_all((0..4).map(|_| client.fetch(params("0xdef")))).await;
    assert_eq!(client.fetcher().calls(), 2);
    let first = outcomes[0].as_ref().unwrap();
    assert!(outcomes.iter().all(|o| Arc::ptr_eq(o.as_ref().unwrap(), first)));

    drop(subscriptions);
}

#[tokio::test(start_paused = true)]
async fn concurrent_observers_share_one_failure() {
    let client = client(1000, 500);
    client.fetcher().push("0xbad", Step::Fail { delay_ms: 20 });

    let queries: Vec<_> = (0..3).map(|_| client.query(params("0xbad"), true).unwrap()).collect();
    let _subscriptions: Vec<_> = queries.iter().map(|q| q.subscribe()).collect();
    let states = join_all(queries.iter().map(|q| q.settled())).await;

    assert_eq!(client.fetcher().calls(), 1);
    assert_eq!(client.fetcher().failed(), 1);
    let cause = Arc::clone(states[0].error.as_ref().unwrap().cause().unwrap());
    for state in &states {
        assert_eq!(state.status(), QueryStatus::Error);
        assert!(state.data.is_none());
        assert!(Arc::ptr_eq(state.error.as_ref().unwrap().cause().unwrap(), &cause));
    }
    assert!(!client.entry(&balance_key("0xbad")).unwrap().is_fetching);
}

#[tokio::test(start_paused = true)]
async fn fresh_data_is_served_without_fetching() {
    let client = client(1000, 500);
    let first = client.query(params("0xabc"), true).unwrap();
    let _s1 = first.subscribe();
    first.settled().await;

    let second = client.query(params("0xabc"), true).unwrap();
    let _s2 = second.subscribe();
    let state = second.state();
    assert!(!state.is_fetching);
    assert_eq!(state.data.unwrap().balance, 100);

    sleep_ms(500).await;
    assert_eq!(second.ensure_fresh().await.unwrap().balance, 100);
    assert_eq!(client.fetcher().calls(), 1);
    assert!(!client.is_stale(&params("0xabc")).unwrap());
}

#[tokio::test(start_paused = true)]
async fn failed_revalidation_keeps_stale_data() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    assert_eq!(client.fetcher().calls(), 1);

    client.fetcher().push("0xabc", Step::Fail { delay_ms: 10 });
    sleep_ms(1100).await;
    assert_eq!(client.fetcher().calls(), 2);

    let state = query.state();
    assert_eq!(state.data.as_ref().unwrap().balance, 100);
    assert!(matches!(state.error, Some(QueryError::Fetch { .. })));
    assert_eq!(client.entry(&balance_key("0xabc")).unwrap().data.unwrap().balance, 100);

    // The error belongs to the observers of the failed fetch only.
    let bystander = client.query(params("0xabc"), false).unwrap();
    let _other = bystander.subscribe();
    let state = bystander.state();
    assert!(state.error.is_none());
    assert_eq!(state.data.unwrap().balance, 100);

    // No retries on its own.
    sleep_ms(5000).await;
    assert_eq!(client.fetcher().calls(), 2);
    assert!(!query.has_stale_timer());
}

#[tokio::test(start_paused = true)]
async fn pruning_grace_period() {
    let client = client(1000, 500);
    let key = balance_key("0xabc");
    let query = client.query(params("0xabc"), true).unwrap();

    let subscription = query.subscribe();
    query.settled().await;
    drop(subscription);
    assert!(client.entry(&key).unwrap().cleanup_pending);
    assert!(!query.has_stale_timer());

    // Coming back within the grace period reuses the data.
    sleep_ms(250).await;
    let subscription = query.subscribe();
    let entry = client.entry(&key).unwrap();
    assert!(!entry.cleanup_pending);
    assert_eq!(entry.subscription_count, 1);
    assert_eq!(query.state().data.unwrap().call, 1);
    assert_eq!(client.fetcher().calls(), 1);

    subscription.unsubscribe();
    sleep_ms(499).await;
    assert_eq!(client.len(), 1);
    sleep_ms(2).await;
    assert!(client.entry(&key).is_none());
    assert!(client.is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_response_never_overwrites_newer_key() {
    let client = client(1000, 500);
    client.fetcher().push("0xaaa", Step::Ok {
        balance:  1,
        delay_ms: 300,
    });
    client.fetcher().push("0xbbb", Step::Ok {
        balance:  2,
        delay_ms: 50,
    });

    let query = client.query(params("0xaaa"), true).unwrap();
    let _subscription = query.subscribe();
    sleep_ms(10).await;
    query.set_params(params("0xbbb")).unwrap();
    assert_eq!(query.query_key(), balance_key("0xbbb"));

    sleep_ms(100).await;
    let state = query.state();
    assert_eq!(state.query_key, balance_key("0xbbb"));
    assert_eq!(state.data.as_ref().unwrap().balance, 2);

    // The slow response for the old key lands in its own entry only.
    sleep_ms(300).await;
    let state = query.state();
    assert_eq!(state.query_key, balance_key("0xbbb"));
    assert_eq!(state.data.unwrap().balance, 2);
    assert!(!state.is_fetching);
    assert_eq!(client.get_data(&params("0xaaa")).unwrap().unwrap().balance, 1);
    assert_eq!(client.fetcher().calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn concrete_timeline() {
    let client = client(1000, 500);

    // t=0
    let first = client.query(params("0xabc"), true).unwrap();
    let _s1 = first.subscribe();
    sleep_ms(20).await;
    assert_eq!(first.state().data.unwrap().balance, 100);

    // t=200
    sleep_ms(180).await;
    let second = client.query(params("0xabc"), true).unwrap();
    let _s2 = second.subscribe();
    let state = second.state();
    assert!(!state.is_fetching);
    assert_eq!(state.data.unwrap().balance, 100);
    assert_eq!(client.fetcher().calls(), 1);

    // t=1100
    sleep_ms(900).await;
    assert_eq!(client.fetcher().calls(), 2);
    assert_eq!(first.state().data.unwrap().call, 2);
    assert_eq!(second.state().data.unwrap().call, 2);
}

#[tokio::test(start_paused = true)]
async fn previous_data_kept_until_new_key_settles() {
    let client = client_with(
        QueryOptions::builder()
            .stale_time(Duration::from_millis(1000))
            .cache_time(Duration::from_millis(500))
            .keep_previous_data(true)
            .build()
            .unwrap(),
    );
    client.fetcher().set_balance("0xaaa", 1);
    client.fetcher().push("0xbbb", Step::Ok {
        balance:  2,
        delay_ms: 100,
    });
    client.fetcher().push("0xccc", Step::Fail { delay_ms: 50 });

    let query = client.query(params("0xaaa"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;

    query.set_params(params("0xbbb")).unwrap();
    let state = query.state();
    assert!(state.is_fetching);
    assert_eq!(state.query_key, balance_key("0xaaa"));
    assert_eq!(state.data.unwrap().balance, 1);

    let state = query.settled().await;
    assert_eq!(state.query_key, balance_key("0xbbb"));
    assert_eq!(state.data.unwrap().balance, 2);

    // A failing new key stops showing previous data once it fails.
    query.set_params(params("0xccc")).unwrap();
    assert_eq!(query.state().data.unwrap().balance, 2);
    let state = query.settled().await;
    assert_eq!(state.query_key, balance_key("0xccc"));
    assert!(state.data.is_none());
    assert!(state.is_error());

    // Fresh cached data is switched to immediately.
    query.set_params(params("0xbbb")).unwrap();
    let state = query.state();
    assert!(!state.is_fetching);
    assert!(state.error.is_none());
    assert_eq!(state.query_key, balance_key("0xbbb"));
    assert_eq!(state.data.unwrap().balance, 2);
    assert_eq!(client.fetcher().calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn previous_data_cleared_by_default() {
    let client = client(1000, 500);
    client.fetcher().push("0xbbb", Step::Ok {
        balance:  2,
        delay_ms: 100,
    });
    let query = client.query(params("0xaaa"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;

    query.set_params(params("0xbbb")).unwrap();
    let state = query.state();
    assert!(state.is_initial_loading());
    assert_eq!(state.query_key, balance_key("0xbbb"));
}

#[tokio::test(start_paused = true)]
async fn key_change_moves_subscriptions() {
    let client = client(1000, 500);
    let query = client.query(params("0xaaa"), true).unwrap();
    let _s1 = query.subscribe();
    let _s2 = query.subscribe();
    query.settled().await;

    query.set_params(params("0xbbb")).unwrap();
    let old = client.entry(&balance_key("0xaaa")).unwrap();
    assert_eq!(old.subscription_count, 0);
    assert!(old.cleanup_pending);
    assert_eq!(client.entry(&balance_key("0xbbb")).unwrap().subscription_count, 2);

    // Parameters mapping to the current key change nothing.
    query.set_params(params("0xbbb")).unwrap();
    query.settled().await;
    assert_eq!(client.fetcher().calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn disabling_cancels_revalidation() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    assert!(query.has_stale_timer());

    query.set_enabled(false);
    assert_eq!(query.subscription_state(), SubscriptionState::Disabled);
    assert!(!query.has_stale_timer());
    assert_eq!(query.subscriber_count(), 1);

    sleep_ms(3000).await;
    assert_eq!(client.fetcher().calls(), 1);

    // Re-enabling finds the data stale.
    query.set_enabled(true);
    assert!(query.state().is_fetching);
    query.settled().await;
    assert_eq!(client.fetcher().calls(), 2);
    assert!(query.has_stale_timer());
}

#[tokio::test(start_paused = true)]
async fn disabled_query_fetches_on_demand_only() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), false).unwrap();
    let _subscription = query.subscribe();
    sleep_ms(100).await;
    assert_eq!(client.fetcher().calls(), 0);
    assert_eq!(query.state().status(), QueryStatus::Idle);

    assert_eq!(query.refetch().await.unwrap().balance, 100);
    assert_eq!(client.fetcher().calls(), 1);
    assert!(!query.has_stale_timer());
}

#[tokio::test(start_paused = true)]
async fn redundant_unsubscribe_is_harmless() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let first = query.subscribe();
    let second = query.subscribe();

    first.unsubscribe();
    first.unsubscribe();
    assert!(!first.is_active());
    assert_eq!(query.subscriber_count(), 1);
    assert_eq!(client.entry(&balance_key("0xabc")).unwrap().subscription_count, 1);

    drop(first);
    assert_eq!(query.subscriber_count(), 1);

    second.unsubscribe();
    drop(second);
    assert_eq!(query.subscriber_count(), 0);
    assert_eq!(client.entry(&balance_key("0xabc")).unwrap().subscription_count, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_fetcher_reports_abort() {
    let client = client(1000, 500);
    client.fetcher().push("0xabc", Step::Panic);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();

    let state = query.settled().await;
    assert!(matches!(state.error, Some(QueryError::Aborted { .. })));
    assert!(!client.entry(&balance_key("0xabc")).unwrap().is_fetching);

    // The key isn't stuck.
    assert_eq!(query.refetch().await.unwrap().balance, 100);
    assert!(query.state().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn direct_write_wins_over_fetch_in_flight() {
    let client = client(1000, 500);
    client.fetcher().push("0xabc", Step::Ok {
        balance:  1,
        delay_ms: 100,
    });
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();

    sleep_ms(10).await;
    client
        .set_data(&params("0xabc"), super::Balance::new("0xabc", 999))
        .unwrap();
    let state = query.settled().await;
    assert_eq!(state.data.unwrap().balance, 999);
    assert_eq!(client.get_data(&params("0xabc")).unwrap().unwrap().balance, 999);
    assert_eq!(client.fetcher().fetched(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalidated_data_is_refetched() {
    let client = client(1000, 500);
    client.fetcher().set_balance("0xabc", 5);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;

    client.fetcher().set_balance("0xabc", 6);
    assert!(client.invalidate(&params("0xabc")).unwrap());
    assert!(client.is_stale(&params("0xabc")).unwrap());
    assert_eq!(client.get_data(&params("0xabc")).unwrap().unwrap().balance, 5);

    assert_eq!(query.ensure_fresh().await.unwrap().balance, 6);
    assert_eq!(client.fetcher().calls(), 2);
    assert!(!client.invalidate(&params("0xnone")).unwrap());
}

#[tokio::test(start_paused = true)]
async fn unobserved_fetch_is_pruned() {
    let client = client(1000, 500);
    assert_eq!(client.fetch(params("0xabc")).await.unwrap().balance, 100);

    let entry = client.entry(&balance_key("0xabc")).unwrap();
    assert_eq!(entry.subscription_count, 0);
    assert!(entry.cleanup_pending);

    sleep_ms(501).await;
    assert!(client.is_empty());
}

#[tokio::test(start_paused = true)]
async fn destroy_drops_the_cache() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let subscription = query.subscribe();
    query.settled().await;
    let _ = client.fetch(params("0xdef")).await;
    assert_eq!(client.len(), 2);

    client.destroy();
    assert_eq!(client.len(), 1);
    let entry = client.entry(&balance_key("0xabc")).unwrap();
    assert!(entry.data.is_none());
    assert_eq!(entry.subscription_count, 1);
    assert!(client.get_data(&params("0xdef")).unwrap().is_none());

    // Queries outlive the cache and start over.
    assert_eq!(query.refetch().await.unwrap().call, 3);
    drop(subscription);
}

#[tokio::test(start_paused = true)]
async fn observers_survive_destroy() {
    let client = client(1000, 500);
    let key = balance_key("0xabc");
    let query = client.query(params("0xabc"), true).unwrap();
    let first = query.subscribe();
    query.settled().await;

    client.destroy();
    let _second = query.subscribe();
    let state = query.settled().await;
    assert_eq!(state.data.unwrap().call, 2);
    assert_eq!(client.entry(&key).unwrap().subscription_count, 2);

    drop(first);
    sleep_ms(600).await;
    assert_eq!(query.subscriber_count(), 1);
    let entry = client.entry(&key).unwrap();
    assert_eq!(entry.subscription_count, 1);
    assert!(!entry.cleanup_pending);
    assert_eq!(entry.data.unwrap().call, 2);
}

#[tokio::test(start_paused = true)]
async fn mounting_during_forced_refetch_keeps_its_outcome() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let _first = query.subscribe();
    query.settled().await;

    client.fetcher().push("0xabc", Step::Fail { delay_ms: 50 });
    let refetching = tokio::spawn({
        let query = query.clone();
        async move { query.refetch().await }
    });
    sleep_ms(10).await;
    assert!(query.state().is_fetching);

    // The data is still fresh, so the new observer is served from the cache without taking the fetch over.
    let _second = query.subscribe();
    let state = query.state();
    assert!(state.is_fetching);
    assert_eq!(state.data.unwrap().balance, 100);

    assert!(refetching.await.unwrap().is_err());
    let state = query.state();
    assert!(!state.is_fetching);
    assert!(matches!(state.error, Some(QueryError::Fetch { .. })));
    assert_eq!(state.data.unwrap().balance, 100);
    assert_eq!(client.fetcher().calls(), 2);
}

fn client_with_stale_time(stale_time: Duration, disable_auto_refetching: bool) -> QueryClient<BalanceFetcher> {
    client_with(
        QueryOptions::builder()
            .stale_time(stale_time)
            .cache_time(Duration::from_millis(500))
            .disable_auto_refetching(disable_auto_refetching)
            .build()
            .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn no_revalidation_when_auto_refetching_is_off() {
    let client = client_with_stale_time(Duration::from_millis(1000), true);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    assert!(!query.has_stale_timer());

    sleep_ms(5000).await;
    assert_eq!(client.fetcher().calls(), 1);
    assert!(!query.has_stale_timer());

    // Stale data is still refreshed on demand.
    assert!(client.is_stale(&params("0xabc")).unwrap());
    assert_eq!(query.ensure_fresh().await.unwrap().call, 2);
    assert!(!query.has_stale_timer());
}

#[tokio::test(start_paused = true)]
async fn zero_stale_time_fetches_every_time() {
    let client = client_with_stale_time(Duration::ZERO, false);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    assert!(!query.has_stale_timer());

    sleep_ms(5000).await;
    assert_eq!(client.fetcher().calls(), 1);

    for call in 2..5 {
        assert_eq!(query.ensure_fresh().await.unwrap().call, call);
    }
    assert_eq!(client.fetcher().calls(), 4);
    assert!(!query.has_stale_timer());
}

#[tokio::test(start_paused = true)]
async fn infinite_stale_time_never_revalidates() {
    let client = client_with_stale_time(Duration::MAX, false);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    assert!(!query.has_stale_timer());

    sleep_ms(24 * 3600 * 1000).await;
    assert_eq!(client.fetcher().calls(), 1);
    assert!(!query.has_stale_timer());
    assert!(!client.is_stale(&params("0xabc")).unwrap());
    assert_eq!(query.ensure_fresh().await.unwrap().call, 1);
}

#[tokio::test(start_paused = true)]
async fn watch_reports_transitions() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let mut rx = query.watch();
    assert_eq!(rx.borrow_and_update().status(), QueryStatus::Idle);

    let _subscription = query.subscribe();
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().is_fetching);

    rx.changed().await.unwrap();
    let state = rx.borrow_and_update().clone();
    assert!(state.is_success());
    assert_eq!(state.data.unwrap().balance, 100);
}

#[tokio::test(start_paused = true)]
async fn outside_writes_reach_watchers_with_the_next_transition() {
    let client = client(1000, 500);
    let query = client.query(params("0xabc"), true).unwrap();
    let _subscription = query.subscribe();
    query.settled().await;
    let mut rx = query.watch();
    rx.borrow_and_update();

    client.set_data(&params("0xabc"), super::Balance::new("0xabc", 7)).unwrap();
    assert_eq!(query.state().data.unwrap().balance, 7);
    assert!(!rx.has_changed().unwrap());

    query.ensure_fresh().await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().data.as_ref().unwrap().balance, 7);
    assert_eq!(client.fetcher().calls(), 1);
}
