use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::Address;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::cache::ChainStateCache;
use crate::mocks::MockNode;
use crate::node::NodeClient;
use crate::types::{VenueId, VenueState};

const MIN_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Normalized chain observation published by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    NewHead { height: u64, base_fee: Option<u128> },
    Venue(VenueState),
    Account { address: Address, nonce: u64, height: u64 },
}

impl ChainEvent {
    /// Writes the observation into the cache. Returns false when the cache
    /// already held something at least as recent.
    pub fn apply_to(&self, cache: &ChainStateCache) -> bool {
        match self {
            ChainEvent::NewHead { height, .. } => cache.set_head(*height),
            ChainEvent::Venue(state) => cache.update_venue(state.clone()),
            ChainEvent::Account { address, nonce, height } => {
                cache.update_account(*address, *nonce, *height);
                true
            }
        }
    }
}

/// Block-driven source of venue and account observations.
///
/// Heads come from polling the node or from a `newHeads` websocket
/// subscription; on every new head the tracked venues and accounts are
/// re-read at that height and published on a broadcast channel.
pub struct BlockFeed {
    pub sender: broadcast::Sender<ChainEvent>,
    node: Arc<dyn NodeClient>,
    venues: Vec<VenueId>,
    accounts: Vec<Address>,
}

impl BlockFeed {
    pub fn new(node: Arc<dyn NodeClient>, venues: Vec<VenueId>, accounts: Vec<Address>, capacity: usize) -> Self {
        let (sender, _recv) = broadcast::channel(capacity.max(1));
        Self { sender, node, venues, accounts }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    /// Publishes the head, then every tracked venue and account read at it.
    /// Returns the number of events sent.
    pub async fn publish_head(&self, height: u64, base_fee: Option<u128>) -> usize {
        let _ = self.sender.send(ChainEvent::NewHead { height, base_fee });
        let mut sent = 1;
        for id in &self.venues {
            match self.node.venue_at(*id, height).await {
                Ok(state) => {
                    let _ = self.sender.send(ChainEvent::Venue(state));
                    sent += 1;
                }
                Err(e) => tracing::warn!(venue = %id, height, error = %e, "venue refresh failed"),
            }
        }
        for address in &self.accounts {
            match self.node.nonce_at(*address, height).await {
                Ok(nonce) => {
                    let _ = self.sender.send(ChainEvent::Account { address: *address, nonce, height });
                    sent += 1;
                }
                Err(e) => tracing::warn!(account = ?address, height, error = %e, "nonce refresh failed"),
            }
        }
        sent
    }

    /// Polls the node head every `interval`, backing off exponentially while it errors.
    pub fn start_polling(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            let mut last: Option<u64> = None;
            let mut backoff = MIN_BACKOFF_MS;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let wait = match feed.node.head().await {
                    Ok(height) => {
                        if last.is_none_or(|l| height > l) {
                            last = Some(height);
                            feed.publish_head(height, None).await;
                        }
                        backoff = MIN_BACKOFF_MS;
                        interval
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, backoff_ms = backoff, "head poll error, backing off");
                        let wait = Duration::from_millis(backoff);
                        backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                        wait
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("block feed poller stopped");
        })
    }

    /// Follows `newHeads` on a websocket endpoint, reconnecting with backoff.
    pub fn start_ws(self: &Arc<Self>, url: String, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = MIN_BACKOFF_MS;
            let mut last: Option<u64> = None;
            while !*shutdown.borrow() {
                match connect_async(url.as_str()).await {
                    Ok((mut ws, _resp)) => {
                        tracing::info!(%url, "ws connected");
                        let sub = json!({"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]});
                        if ws.send(Message::Text(sub.to_string())).await.is_err() {
                            tracing::warn!(%url, "ws subscribe failed");
                        } else {
                            backoff = MIN_BACKOFF_MS;
                            loop {
                                let msg = tokio::select! {
                                    msg = ws.next() => msg,
                                    _ = shutdown.changed() => None,
                                };
                                match msg {
                                    Some(Ok(Message::Text(txt))) => {
                                        if let Some((height, base_fee)) = parse_new_head(&txt)
                                            && last.is_none_or(|l| height > l)
                                        {
                                            last = Some(height);
                                            feed.publish_head(height, base_fee).await;
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        tracing::warn!(%url, error = %e, "ws recv error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            tracing::info!(%url, "ws disconnected");
                        }
                    }
                    Err(e) => tracing::warn!(%url, error = %e, "ws connect failed, backing off"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
            tracing::info!(%url, "ws feed stopped");
        })
    }
}

/// Extracts `(number, baseFeePerGas)` from an `eth_subscription` newHeads notification.
pub fn parse_new_head(txt: &str) -> Option<(u64, Option<u128>)> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    let head = v.get("params")?.get("result")?;
    let hex = |s: &str| s.trim_start_matches("0x").to_string();
    let number = u64::from_str_radix(&hex(head.get("number")?.as_str()?), 16).ok()?;
    let base_fee = head
        .get("baseFeePerGas")
        .and_then(|b| b.as_str())
        .and_then(|b| u128::from_str_radix(&hex(b), 16).ok());
    Some((number, base_fee))
}

/// Random walk over a mock node's venues for dry runs: every tick each
/// venue's `reserve0` moves by up to 50 bps and the head advances by one.
pub fn start_synthetic(
    node: Arc<MockNode>,
    interval: Duration,
    seed: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        while !*shutdown.borrow() {
            for mut venue in node.venues() {
                let bps: i64 = rng.gen_range(-50..=50);
                let delta = venue.reserve0 / 10_000 * u128::from(bps.unsigned_abs());
                venue.reserve0 = if bps < 0 {
                    venue.reserve0.saturating_sub(delta)
                } else {
                    venue.reserve0.saturating_add(delta)
                };
                node.set_venue(venue);
            }
            let height = node.advance_head();
            tracing::debug!(height, "synthetic block");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
