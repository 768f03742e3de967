//! Simulates a scrolled list of wallet rows. Every row subscribes to the balance of its address while it's visible;
//! rows scroll in and out of view faster than balances go stale.
//!
//! ```text
//! RUST_LOG=query_cache=debug cargo run --example balances --features demo -- --debug
//! ```

use async_trait::async_trait;
use clap::Parser;
use fieldx::fxstruct;
use query_cache::prelude::*;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "balances")]
struct Cli {
    /// Number of distinct addresses in the list.
    #[clap(long, env = "QCACHE_ADDRESSES", default_value_t = 20)]
    addresses: usize,

    /// How many rows are visible at once.
    #[clap(long, env = "QCACHE_VISIBLE", default_value_t = 6)]
    visible: usize,

    /// Scroll steps to simulate.
    #[clap(long, env = "QCACHE_STEPS", default_value_t = 60)]
    steps: usize,

    /// Delay between scroll steps, ms.
    #[clap(long, env = "QCACHE_SCROLL_MS", default_value_t = 50)]
    scroll_ms: u64,

    /// Simulated network latency, ms.
    #[clap(long, env = "QCACHE_LATENCY_MS", default_value_t = 120)]
    latency_ms: u64,

    #[clap(long, env = "QCACHE_STALE_MS", default_value_t = 2_000)]
    stale_ms: u64,

    #[clap(long, env = "QCACHE_CACHE_MS", default_value_t = 500)]
    cache_ms: u64,

    /// Keep showing the previous address' balance while a row is being reused for another one.
    #[clap(long, env = "QCACHE_KEEP_PREVIOUS", default_value_t = false)]
    keep_previous: bool,

    /// Report every cache hit, miss and fetch at debug level.
    #[clap(long, short, env = "QCACHE_DEBUG", default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone, Serialize)]
struct BalanceOf {
    address: String,
}

#[derive(Debug, thiserror::Error)]
#[error("node unavailable")]
struct NodeUnavailable;

struct Node {
    latency: Duration,
    calls:   AtomicUsize,
}

#[async_trait]
impl QueryFetcher for Node {
    type Data = u64;
    type Error = NodeUnavailable;
    type Params = BalanceOf;

    async fn fetch(&self, params: BalanceOf) -> Result<u64, NodeUnavailable> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        // Every 13th request fails to show that cached balances survive failures.
        if call % 13 == 12 {
            return Err(NodeUnavailable);
        }
        Ok(params.address.bytes().map(u64::from).sum::<u64>() * 1_000 + call as u64)
    }

    async fn on_error(&self, key: &QueryKey, error: &NodeUnavailable) {
        info!(%key, %error, "node request failed");
    }
}

fn address(idx: usize) -> BalanceOf {
    BalanceOf {
        address: format!("0x{:04x}", idx * 0x11),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = QueryOptions::builder()
        .name("balances")
        .stale_time(Duration::from_millis(cli.stale_ms()))
        .cache_time(Duration::from_millis(cli.cache_ms()))
        .keep_previous_data(cli.keep_previous())
        .debug_mode(cli.debug())
        .build()?;
    let client = QueryClient::new(
        Node {
            latency: Duration::from_millis(cli.latency_ms()),
            calls:   AtomicUsize::new(0),
        },
        options,
    );

    // One query per visible row; rows get reused for other addresses as the list scrolls.
    let visible = cli.visible().clamp(1, cli.addresses().max(1));
    let rows = (0..visible)
        .map(|idx| client.query(address(idx), true))
        .collect::<Result<Vec<_>, _>>()?;
    let mut mounted: VecDeque<_> = rows.iter().map(|row| row.subscribe()).collect();

    // Scroll down to the end of the list and back up again, one row at a time.
    let span = cli.addresses().max(1) - visible + 1;
    for step in 0..cli.steps() {
        let phase = step / visible % (2 * span);
        let top = if phase < span { phase } else { 2 * span - 1 - phase };
        let row = &rows[step % visible];

        mounted.pop_front();
        row.set_params(address(top + step % visible))?;
        mounted.push_back(row.subscribe());

        tokio::time::sleep(Duration::from_millis(cli.scroll_ms())).await;
    }

    for row in &rows {
        let state = row.settled().await;
        info!(
            key = %state.query_key,
            data = ?state.data,
            error = ?state.error.as_ref().map(ToString::to_string),
            "row"
        );
    }

    info!(
        fetches = client.fetcher().calls.load(Ordering::Relaxed),
        entries = client.len(),
        "done"
    );

    drop(mounted);
    tokio::time::sleep(Duration::from_millis(cli.cache_ms() + 1)).await;
    info!(entries = client.len(), "after the grace period");
    client.destroy();

    Ok(())
}
