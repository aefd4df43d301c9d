pub mod builder;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod mocks;
pub mod node;
pub mod nonce;
pub mod observe;
pub mod retry;
pub mod risk;
pub mod scanner;
pub mod searcher;
pub mod signer;
pub mod sim;
pub mod strategy;
pub mod submission;
pub mod tx;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;

use crate::config::{Config, VenueConfig};
use crate::executor::{Relay, RelayClient};
use crate::mocks::{MockNode, MockRelay, MockResponse};
use crate::node::{EthersNode, NodeClient};
use crate::observe::{Observer, TracingObserver};
use crate::searcher::{Searcher, SearcherStats};
use crate::signer::{Keyring, LocalKeySigner};

/// Runs the searcher against a live node and the configured relays until ctrl-c.
pub async fn run(config: Config) -> Result<SearcherStats> {
    let rpc_url = config.node.rpc_urls.first().context("node.rpc_urls is empty")?;
    let fork_url = config.fork_rpc_url().context("no fork rpc url configured")?;
    let node: Arc<dyn NodeClient> =
        Arc::new(EthersNode::new(rpc_url, fork_url, &config.venues, config.builder.priority_fee_wei)?);

    let signers = LocalKeySigner::from_env().context("failed to load signing keys from PRIVATE_KEY")?;
    let mut keyring = Keyring::new();
    for signer in signers {
        keyring.insert(Arc::new(signer));
    }
    for account in [config.accounts.treasury, config.accounts.executor] {
        if !keyring.accounts().contains(&account) {
            bail!("no signing key for configured account {account:?}");
        }
    }

    let relays = config
        .relays
        .iter()
        .map(|r| RelayClient::from_config(r, config.relay_deadline()).map(|c| Arc::new(c) as Arc<dyn Relay>))
        .collect::<Result<Vec<_>>>()?;
    if relays.is_empty() {
        tracing::warn!("no relays configured; bundles will expire unsent");
    }

    let observer: Arc<dyn Observer> = Arc::new(TracingObserver);
    let searcher = Searcher::assemble(&config, node, keyring, relays, observer);
    let (tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received; shutting down");
        }
        let _ = tx.send(true);
    });
    Ok(searcher.run(shutdown).await)
}

/// Dry run: the full pipeline over an in-process node whose venues follow a
/// seeded random walk, with a relay that includes everything it accepts.
pub async fn simulate(mut config: Config, duration: Duration, seed: u64) -> Result<SearcherStats> {
    let (keyring, treasury, executor) = mocks::dev_keyring();
    config.accounts.treasury = treasury;
    config.accounts.executor = executor;

    let node = Arc::new(MockNode::new(1));
    let venues = mocks::demo_venues();
    config.venues = venues
        .iter()
        .map(|v| VenueConfig { id: v.id.0, address: v.address, token0: v.token0, token1: v.token1, fee_bps: v.fee_bps })
        .collect();
    for v in venues {
        node.set_venue(v);
    }
    config.node.ws_urls.clear();
    config.validate()?;

    let relay = MockRelay::new("dry-run", MockResponse::AcceptAndInclude).linked_to(Arc::clone(&node));
    let observer: Arc<dyn Observer> = Arc::new(TracingObserver);
    let searcher = Searcher::assemble(
        &config,
        Arc::clone(&node) as Arc<dyn NodeClient>,
        keyring,
        vec![Arc::new(relay) as Arc<dyn Relay>],
        observer,
    );

    let (tx, shutdown) = watch::channel(false);
    let block_time = Duration::from_millis(config.node.poll_interval_ms.max(1) * 4);
    let walker = data::start_synthetic(Arc::clone(&node), block_time, seed, shutdown.clone());
    let run = tokio::spawn(searcher.run(shutdown));

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("ctrl-c received; ending dry run early"),
    }
    let _ = tx.send(true);
    let _ = walker.await;
    let stats = run.await.context("searcher task panicked")?;
    tracing::info!(?stats, "dry run finished");
    Ok(stats)
}
