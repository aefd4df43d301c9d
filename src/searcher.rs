use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::builder::{BuilderSettings, BundleBuilder};
use crate::cache::ChainStateCache;
use crate::config::Config;
use crate::data::{BlockFeed, ChainEvent};
use crate::executor::Relay;
use crate::ledger::Ledger;
use crate::node::NodeClient;
use crate::observe::{CoreEvent, DropReason, Observer};
use crate::risk::RiskGuard;
use crate::scanner::Scanner;
use crate::signer::Keyring;
use crate::sim::SimulationEngine;
use crate::strategy::{CrossVenueArb, Strategy};
use crate::submission::{SubmissionManager, SubmissionOutcome, SubmissionSettings};
use crate::types::{Candidate, Verdict, VenueId};

/// Ledger records are kept this many blocks past their validity window.
const PRUNE_LAG: u64 = 64;

/// Counters over one searcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearcherStats {
    pub candidates: u64,
    pub expired_before_simulation: u64,
    pub valid: u64,
    pub invalid: u64,
    pub stale: u64,
    pub degraded: u64,
    pub included: u64,
    pub not_included: u64,
    pub rejected: u64,
    pub expired: u64,
    pub denied: u64,
    pub not_built: u64,
}

impl SearcherStats {
    fn record(&mut self, outcome: &SubmissionOutcome) {
        match outcome {
            SubmissionOutcome::Included { .. } => self.included += 1,
            SubmissionOutcome::NotIncluded { .. } => self.not_included += 1,
            SubmissionOutcome::Expired { .. } => self.expired += 1,
            SubmissionOutcome::Rejected { .. } => self.rejected += 1,
            SubmissionOutcome::Denied(_) => self.denied += 1,
            SubmissionOutcome::NotBuilt(_) => self.not_built += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearcherSettings {
    pub max_concurrent: usize,
    pub channel_capacity: usize,
    pub poll_interval: Duration,
    pub ws_urls: Vec<String>,
    pub validity_window: u64,
    pub dedup_capacity: usize,
}

impl From<&Config> for SearcherSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            max_concurrent: cfg.scanner.max_concurrent_candidates,
            channel_capacity: cfg.scanner.channel_capacity,
            poll_interval: Duration::from_millis(cfg.node.poll_interval_ms),
            ws_urls: cfg.node.ws_urls.clone(),
            validity_window: cfg.scanner.validity_window_blocks,
            dedup_capacity: cfg.scanner.dedup_capacity,
        }
    }
}

/// What a candidate worker needs, shared across workers.
struct Pipeline {
    cache: Arc<ChainStateCache>,
    engine: SimulationEngine,
    submissions: SubmissionManager,
    observer: Arc<dyn Observer>,
    rescans: mpsc::Sender<Vec<VenueId>>,
    stats: Mutex<SearcherStats>,
}

impl Pipeline {
    async fn process(&self, candidate: Arc<Candidate>) {
        let head = self.cache.head();
        if candidate.is_expired(head) {
            tracing::debug!(candidate = %candidate.id, head, "candidate expired while queued");
            self.observer.emit(CoreEvent::CandidateDropped {
                candidate: candidate.id,
                reason: DropReason::Expired {
                    observed: candidate.observed_height,
                    window: candidate.validity_window,
                    head,
                },
            });
            self.stats.lock().expired_before_simulation += 1;
            return;
        }

        let result = match self.engine.simulate(&candidate).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(candidate = %candidate.id, error = %e, "simulation failed");
                self.stats.lock().degraded += 1;
                return;
            }
        };
        match &result.verdict {
            Verdict::Valid => self.stats.lock().valid += 1,
            Verdict::Invalid(_) => {
                self.observer.emit(CoreEvent::CandidateDropped {
                    candidate: candidate.id,
                    reason: DropReason::Invalid(result.verdict.to_string()),
                });
                self.stats.lock().invalid += 1;
                return;
            }
            Verdict::Stale(_) => {
                self.stats.lock().stale += 1;
                if self.rescans.try_send(candidate.venues.clone()).is_err() {
                    tracing::debug!(candidate = %candidate.id, "rescan queue full; dropping request");
                }
                return;
            }
        }

        let outcome = self.submissions.submit_result(result.id).await;
        match &outcome {
            SubmissionOutcome::NotBuilt(rejection) if !rejection.is_governance() => {
                tracing::warn!(candidate = %candidate.id, error = %rejection, "bundle build failed");
            }
            other => tracing::debug!(candidate = %candidate.id, outcome = ?other, "candidate finished"),
        }
        self.stats.lock().record(&outcome);
    }
}

/// Wires feed, cache, scanner, simulation, building and submission into one
/// running pipeline.
pub struct Searcher {
    cache: Arc<ChainStateCache>,
    ledger: Arc<Ledger>,
    feed: Arc<BlockFeed>,
    scanner: Scanner,
    pipeline: Arc<Pipeline>,
    rescan_rx: mpsc::Receiver<Vec<VenueId>>,
    settings: SearcherSettings,
}

impl Searcher {
    /// Assembles the pipeline from configuration and collaborators.
    pub fn assemble(
        config: &Config,
        node: Arc<dyn NodeClient>,
        keyring: Keyring,
        relays: Vec<Arc<dyn Relay>>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let settings = SearcherSettings::from(config);
        let cache = Arc::new(ChainStateCache::new(config.accounts.max_in_flight, settings.channel_capacity));
        let ledger = Arc::new(Ledger::new());
        let risk = Arc::new(RiskGuard::new(config.risk.clone()));
        let retry_backoff = Duration::from_millis(config.node.retry_backoff_ms);

        let venue_ids: Vec<VenueId> = config.venues.iter().map(|v| VenueId(v.id)).collect();
        let accounts = vec![config.accounts.treasury, config.accounts.executor];
        let feed = Arc::new(BlockFeed::new(Arc::clone(&node), venue_ids, accounts, settings.channel_capacity));

        let strategies: Vec<Arc<dyn Strategy>> =
            vec![Arc::new(CrossVenueArb::new(config.strategy.clone(), &config.accounts))];
        let scanner = Scanner::new(
            Arc::clone(&cache),
            Arc::clone(&ledger),
            strategies,
            Arc::clone(&observer),
            settings.validity_window,
            settings.dedup_capacity,
        );

        let engine = SimulationEngine::new(
            Arc::clone(&node),
            Arc::clone(&ledger),
            Arc::clone(&observer),
            config.simulation.stale_tolerance_bps,
            config.simulation_deadline(),
        )
        .with_retry(config.node.retry_attempts, retry_backoff);

        let builder = Arc::new(BundleBuilder::new(
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&node),
            keyring,
            risk,
            Arc::clone(&observer),
            BuilderSettings {
                min_profit_margin: config.builder.profit_threshold_wei,
                target_offset: config.builder.target_offset,
                chain_id: config.node.chain_id,
                retry_attempts: config.node.retry_attempts,
                retry_backoff,
            },
        ));
        let submissions = SubmissionManager::new(
            builder,
            Arc::clone(&ledger),
            relays,
            node,
            Arc::clone(&observer),
            SubmissionSettings::from(&config.submission),
        );

        let (rescans, rescan_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let pipeline = Arc::new(Pipeline {
            cache: Arc::clone(&cache),
            engine,
            submissions,
            observer,
            rescans,
            stats: Mutex::new(SearcherStats::default()),
        });
        Self { cache, ledger, feed, scanner, pipeline, rescan_rx, settings }
    }

    pub fn cache(&self) -> &Arc<ChainStateCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Runs until `shutdown` flips to true, then waits for in-flight
    /// candidates to settle and returns the run's counters.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SearcherStats {
        let Searcher { cache, ledger, feed, scanner, pipeline, rescan_rx, settings } = self;
        let changes = cache.subscribe();

        let ingest =
            spawn_ingest(Arc::clone(&feed), Arc::clone(&cache), ledger, settings.validity_window, shutdown.clone());
        let mut feeds: Vec<JoinHandle<()>> = if settings.ws_urls.is_empty() {
            vec![feed.start_polling(settings.poll_interval, shutdown.clone())]
        } else {
            settings.ws_urls.iter().map(|url| feed.start_ws(url.clone(), shutdown.clone())).collect()
        };
        feeds.push(ingest);

        let (candidate_tx, mut candidate_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let scanner_task = tokio::spawn(scanner.run(changes, rescan_rx, candidate_tx, shutdown.clone()));

        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        tracing::info!(max_concurrent = settings.max_concurrent, "searcher started");
        loop {
            let candidate = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                c = candidate_rx.recv() => match c {
                    Some(c) => c,
                    None => break,
                },
            };
            pipeline.stats.lock().candidates += 1;
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let pipeline = Arc::clone(&pipeline);
            workers.retain(|w| !w.is_finished());
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                pipeline.process(candidate).await;
            }));
        }

        tracing::info!(in_flight = workers.len(), "searcher stopping; waiting for in-flight candidates");
        for w in workers {
            let _ = w.await;
        }
        let _ = scanner_task.await;
        for f in feeds {
            let _ = f.await;
        }
        let stats = pipeline.stats.lock().clone();
        tracing::info!(?stats, "searcher stopped");
        stats
    }
}

/// Applies feed events to the cache and prunes the ledger as heads advance.
fn spawn_ingest(
    feed: Arc<BlockFeed>,
    cache: Arc<ChainStateCache>,
    ledger: Arc<Ledger>,
    validity_window: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = feed.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                ev = events.recv() => ev,
            };
            match event {
                Ok(ev) => {
                    if let ChainEvent::NewHead { height, base_fee } = &ev {
                        tracing::debug!(height, base_fee = ?base_fee, "new head");
                        let cutoff = height.saturating_sub(validity_window + PRUNE_LAG);
                        let pruned = ledger.prune_before(cutoff);
                        if pruned > 0 {
                            tracing::debug!(pruned, cutoff, "pruned ledger");
                        }
                    }
                    ev.apply_to(&cache);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // the next head republishes every tracked venue and account
                    tracing::warn!(skipped, "cache ingest lagged behind the block feed");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
