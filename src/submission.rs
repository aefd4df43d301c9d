use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use tokio::time::{Instant, sleep, timeout};

use crate::builder::{BuildRejection, BundleBuilder};
use crate::cache::ChainStateCache;
use crate::config::SubmissionConfig;
use crate::error::{NonceError, RelayError};
use crate::executor::Relay;
use crate::ledger::Ledger;
use crate::node::{NodeClient, ReceiptInfo};
use crate::observe::{CoreEvent, Observer};
use crate::risk::{DenyReason, RiskDecision, RiskGuard};
use crate::types::{Bundle, BundleId, ResultId, SubmissionRecord, SubmissionStatus, unix_millis};

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    pub max_retries: u32,
    pub relay_deadline: Duration,
    pub inclusion_deadline: Duration,
    pub poll_interval: Duration,
}

impl From<&SubmissionConfig> for SubmissionSettings {
    fn from(cfg: &SubmissionConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            relay_deadline: Duration::from_millis(cfg.relay_deadline_ms),
            inclusion_deadline: Duration::from_millis(cfg.inclusion_deadline_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        }
    }
}

/// Final fate of one simulation result handed to the manager.
#[derive(Debug)]
pub enum SubmissionOutcome {
    Included { bundle: BundleId, block: u64 },
    NotIncluded { bundle: BundleId },
    Expired { bundle: BundleId },
    Rejected { bundle: BundleId, attempts: u32 },
    Denied(DenyReason),
    NotBuilt(BuildRejection),
}

enum BundleFate {
    Done(SubmissionOutcome),
    /// Every relay failed and at least one failure was transient.
    Retry { bundle: BundleId },
}

/// State shared with settlement guards, which must be able to settle from `Drop`.
struct Shared {
    cache: Arc<ChainStateCache>,
    risk: Arc<RiskGuard>,
    ledger: Arc<Ledger>,
    observer: Arc<dyn Observer>,
    records: DashMap<(BundleId, String), SubmissionRecord>,
    settled: DashSet<BundleId>,
}

impl Shared {
    fn transition(&self, bundle: BundleId, relay: &str, to: SubmissionStatus, detail: Option<String>) {
        let Some(mut record) = self.records.get_mut(&(bundle, relay.to_string())) else {
            return;
        };
        match record.transition(to, detail.clone()) {
            Ok(()) => {
                tracing::info!(
                    %bundle,
                    relay,
                    status = to.label(),
                    detail = detail.as_deref().unwrap_or(""),
                    "submission transition"
                );
                self.observer.emit(CoreEvent::SubmissionTransition {
                    bundle,
                    relay: relay.to_string(),
                    status: to.label(),
                    detail,
                });
            }
            Err(e) => tracing::debug!(error = %e, "ignoring transition of settled record"),
        }
    }

    /// Moves every still-pending record of `bundle` to `status` and returns its
    /// nonces to the cache: confirmed when included, released otherwise. Runs at
    /// most once per bundle; later calls return `false`.
    fn settle(&self, bundle: &Bundle, status: SubmissionStatus, detail: Option<String>, position_open: bool) -> bool {
        if !self.settled.insert(bundle.id) {
            tracing::warn!(bundle = %bundle.id, status = status.label(), "bundle already settled");
            return false;
        }
        let pending: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.bundle == bundle.id && r.status == SubmissionStatus::Pending)
            .map(|r| r.relay.clone())
            .collect();
        for relay in pending {
            self.transition(bundle.id, &relay, status, detail.clone());
        }

        tracing::info!(
            bundle = %bundle.id,
            status = status.label(),
            age_ms = %unix_millis().saturating_sub(bundle.created_at_ms),
            "bundle settled"
        );
        let included = matches!(status, SubmissionStatus::Included { .. });
        let mut order = bundle.reservations.clone();
        if !included {
            order.reverse();
        }
        for r in order {
            let outcome = if included {
                self.cache.confirm_nonce(r.account, r.nonce)
            } else {
                self.cache.release_nonce(r.account, r.nonce)
            };
            if let Err(e) = outcome {
                tracing::error!(
                    bundle = %bundle.id,
                    account = ?r.account,
                    nonce = r.nonce,
                    error = %e,
                    "nonce settlement failed"
                );
                if let NonceError::InvariantViolation { account, detail } = e {
                    self.observer.emit(CoreEvent::FatalAlert { account, detail });
                }
            }
        }

        if position_open && let Some(lead) = bundle.lead_account() {
            self.risk.close_position(lead);
        }
        true
    }
}

/// Settles its bundle as `expired` if dropped before `finish`.
struct Settlement {
    shared: Arc<Shared>,
    bundle: Arc<Bundle>,
    position_open: bool,
    done: bool,
}

impl Settlement {
    fn finish(mut self, status: SubmissionStatus, detail: Option<String>) {
        self.done = true;
        self.shared.settle(&self.bundle, status, detail, self.position_open);
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if !self.done {
            self.shared.settle(
                &self.bundle,
                SubmissionStatus::Expired,
                Some("submission cancelled".to_string()),
                self.position_open,
            );
        }
    }
}

/// Sends bundles to relays, tracks their fate and feeds it back into the
/// nonce books and the risk guard.
pub struct SubmissionManager {
    shared: Arc<Shared>,
    builder: Arc<BundleBuilder>,
    relays: Vec<Arc<dyn Relay>>,
    node: Arc<dyn NodeClient>,
    settings: SubmissionSettings,
}

impl SubmissionManager {
    pub fn new(
        builder: Arc<BundleBuilder>,
        ledger: Arc<Ledger>,
        relays: Vec<Arc<dyn Relay>>,
        node: Arc<dyn NodeClient>,
        observer: Arc<dyn Observer>,
        settings: SubmissionSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            cache: Arc::clone(builder.cache()),
            risk: Arc::clone(builder.risk()),
            ledger,
            observer,
            records: DashMap::new(),
            settled: DashSet::new(),
        });
        Self { shared, builder, relays, node, settings }
    }

    /// Records of one bundle, ordered by relay id.
    pub fn records(&self, bundle: BundleId) -> Vec<SubmissionRecord> {
        let mut out: Vec<_> = self
            .shared
            .records
            .iter()
            .filter(|r| r.bundle == bundle)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.relay.cmp(&b.relay));
        out
    }

    /// Every record, ordered by bundle then relay.
    pub fn all_records(&self) -> Vec<SubmissionRecord> {
        let mut out: Vec<_> = self.shared.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| (a.bundle, &a.relay).cmp(&(b.bundle, &b.relay)));
        out
    }

    pub fn is_settled(&self, bundle: BundleId) -> bool {
        self.shared.settled.contains(&bundle)
    }

    /// Builds, sends and tracks `result`, rebuilding after transient relay
    /// failures up to `max_retries` times.
    pub async fn submit_result(&self, result: ResultId) -> SubmissionOutcome {
        let mut attempt = 0u32;
        loop {
            let bundle = match self.builder.build(result, attempt).await {
                Ok(b) => b,
                Err(rejection) => return SubmissionOutcome::NotBuilt(rejection),
            };
            match self.submit_bundle(bundle).await {
                BundleFate::Done(outcome) => return outcome,
                BundleFate::Retry { bundle } if attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::info!(%result, %bundle, attempt, "transient relay failure; rebuilding bundle");
                }
                BundleFate::Retry { bundle } => {
                    let attempts = attempt + 1;
                    let candidate = self.shared.ledger.result(result).map(|r| r.candidate);
                    tracing::warn!(%result, %bundle, attempts, "submission permanently failed after retries");
                    if let Ok(candidate) = candidate {
                        self.shared.observer.emit(CoreEvent::PermanentFailure {
                            candidate,
                            attempts,
                            reason: "relays kept failing transiently".to_string(),
                        });
                    }
                    return SubmissionOutcome::Rejected { bundle, attempts };
                }
            }
        }
    }

    async fn submit_bundle(&self, bundle: Arc<Bundle>) -> BundleFate {
        let mut settlement = Settlement {
            shared: Arc::clone(&self.shared),
            bundle: Arc::clone(&bundle),
            position_open: false,
            done: false,
        };

        let Some(lead) = bundle.lead_account() else {
            settlement.finish(SubmissionStatus::Rejected, Some("empty bundle".to_string()));
            return BundleFate::Done(SubmissionOutcome::Rejected { bundle: bundle.id, attempts: bundle.attempt + 1 });
        };
        if let RiskDecision::Deny(reason) = self.shared.risk.try_commit(bundle.gas_cost, lead) {
            let event = CoreEvent::RiskDenied { account: lead, stage: "submit", reason: reason.to_string() };
            self.shared.observer.emit(event);
            settlement.finish(SubmissionStatus::Rejected, Some(reason.to_string()));
            return BundleFate::Done(SubmissionOutcome::Denied(reason));
        }
        settlement.position_open = true;

        for relay in &self.relays {
            let record = SubmissionRecord::pending(bundle.id, relay.id());
            self.shared.records.insert((bundle.id, relay.id().to_string()), record);
        }
        if self.relays.is_empty() {
            tracing::warn!(bundle = %bundle.id, "no relays configured");
        }

        let raw = bundle.raw_txs();
        let (raw, target, deadline) = (&raw, bundle.target_block, self.settings.relay_deadline);
        let responses = join_all(self.relays.iter().map(|relay| async move {
            (relay.id().to_string(), timeout(deadline, relay.submit(raw, target)).await)
        }))
        .await;

        let (mut accepted, mut transient, mut refused) = (0usize, 0usize, 0usize);
        for (relay, response) in responses {
            match response {
                Ok(Ok(ack)) => {
                    accepted += 1;
                    tracing::info!(bundle = %bundle.id, relay, bundle_hash = ?ack.bundle_hash, "relay accepted bundle");
                }
                Ok(Err(e @ RelayError::Transient(_))) => {
                    transient += 1;
                    self.shared.transition(bundle.id, &relay, SubmissionStatus::Rejected, Some(e.to_string()));
                }
                Ok(Err(e @ RelayError::Rejected(_))) => {
                    refused += 1;
                    self.shared.transition(bundle.id, &relay, SubmissionStatus::Rejected, Some(e.to_string()));
                }
                Err(_) => {
                    let detail = Some("relay deadline exceeded".to_string());
                    self.shared.transition(bundle.id, &relay, SubmissionStatus::Expired, detail);
                }
            }
        }

        if accepted == 0 {
            settlement.finish(SubmissionStatus::Rejected, None);
            return if refused == 0 && transient > 0 {
                BundleFate::Retry { bundle: bundle.id }
            } else if refused > 0 {
                BundleFate::Done(SubmissionOutcome::Rejected { bundle: bundle.id, attempts: bundle.attempt + 1 })
            } else {
                BundleFate::Done(SubmissionOutcome::Expired { bundle: bundle.id })
            };
        }

        let (status, receipt) = self.await_inclusion(&bundle).await;
        let mut detail = None;
        match receipt {
            Some(receipt) if receipt.reverted => {
                // charged at the fee cap, the most a mined revert can cost
                let burned = u128::from(receipt.gas_used).saturating_mul(bundle.max_fee_per_gas);
                self.shared.risk.record_outcome(-i128::try_from(burned).unwrap_or(i128::MAX));
                detail = Some(format!("included but reverted after {} gas", receipt.gas_used));
            }
            Some(_) => {
                let realized = self.shared.ledger.result(bundle.result).map(|r| r.net_profit).unwrap_or_default();
                self.shared.risk.record_outcome(realized);
            }
            None if status == SubmissionStatus::Expired => {
                detail = Some("inclusion deadline exceeded".to_string());
            }
            None => {}
        }
        settlement.finish(status, detail);
        BundleFate::Done(match status {
            SubmissionStatus::Included { block } => SubmissionOutcome::Included { bundle: bundle.id, block },
            SubmissionStatus::NotIncluded => SubmissionOutcome::NotIncluded { bundle: bundle.id },
            _ => SubmissionOutcome::Expired { bundle: bundle.id },
        })
    }

    /// Polls for the bundle's first transaction. The receipt comes back only
    /// with `Included`.
    async fn await_inclusion(&self, bundle: &Bundle) -> (SubmissionStatus, Option<ReceiptInfo>) {
        let Some(first) = bundle.txs.first().map(|t| t.hash) else {
            return (SubmissionStatus::NotIncluded, None);
        };
        let give_up = Instant::now() + self.settings.inclusion_deadline;
        loop {
            match self.node.receipt(first).await {
                Ok(Some(receipt)) => return (SubmissionStatus::Included { block: receipt.block }, Some(receipt)),
                Ok(None) => match self.node.head().await {
                    Ok(head) if head > bundle.target_block => return (SubmissionStatus::NotIncluded, None),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(bundle = %bundle.id, error = %e, "head poll failed"),
                },
                Err(e) => tracing::warn!(bundle = %bundle.id, error = %e, "receipt poll failed"),
            }
            if Instant::now() + self.settings.poll_interval > give_up {
                return (SubmissionStatus::Expired, None);
            }
            sleep(self.settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderSettings;
    use crate::config::RiskConfig;
    use crate::executor::RelayAck;
    use crate::mocks::{self, MockNode, MockRelay, MockResponse};
    use crate::observe::RecordingObserver;
    use crate::types::{Action, CandidateDraft, Step, Verdict};
    use async_trait::async_trait;
    use ethers_core::types::Address;
    use parking_lot::Mutex;

    struct Fixture {
        cache: Arc<ChainStateCache>,
        ledger: Arc<Ledger>,
        node: Arc<MockNode>,
        risk: Arc<RiskGuard>,
        observer: Arc<RecordingObserver>,
        builder: Arc<BundleBuilder>,
        executor: Address,
    }

    fn fixture() -> Fixture {
        fixture_with(RiskConfig::default())
    }

    fn fixture_with(limits: RiskConfig) -> Fixture {
        let (keyring, _treasury, executor) = mocks::dev_keyring();
        let cache = Arc::new(ChainStateCache::new(4, 64));
        cache.set_head(10);
        cache.update_account(executor, 0, 10);
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        let risk = Arc::new(RiskGuard::new(limits));
        let observer = Arc::new(RecordingObserver::new());
        let builder = Arc::new(BundleBuilder::new(
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&node) as Arc<dyn NodeClient>,
            keyring,
            Arc::clone(&risk),
            Arc::clone(&observer) as Arc<dyn Observer>,
            BuilderSettings {
                min_profit_margin: 0,
                target_offset: 1,
                chain_id: 1,
                retry_attempts: 1,
                retry_backoff: Duration::from_millis(1),
            },
        ));
        Fixture { cache, ledger, node, risk, observer, builder, executor }
    }

    fn manager(f: &Fixture, relays: Vec<Arc<dyn Relay>>) -> SubmissionManager {
        SubmissionManager::new(
            Arc::clone(&f.builder),
            Arc::clone(&f.ledger),
            relays,
            Arc::clone(&f.node) as Arc<dyn NodeClient>,
            Arc::clone(&f.observer) as Arc<dyn Observer>,
            SubmissionSettings {
                max_retries: 2,
                relay_deadline: Duration::from_millis(100),
                inclusion_deadline: Duration::from_millis(200),
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    fn valid_result(f: &Fixture) -> ResultId {
        let draft = CandidateDraft {
            strategy: "test".into(),
            venues: vec![],
            steps: vec![Step {
                account: f.executor,
                action: Action::Transfer { to: Address::repeat_byte(1), amount: 1 },
                gas_limit: 21_000,
            }],
            assumed: vec![],
            gross_profit: 1_000,
        };
        let c = f.ledger.insert_candidate(draft, 10, 2, 0);
        f.ledger.insert_result(c.id, 1_000, 21_000, 0, 10, Verdict::Valid).id
    }

    /// Wraps a relay and records the executor's outstanding nonces at each send.
    struct NonceWatchRelay {
        inner: MockRelay,
        cache: Arc<ChainStateCache>,
        account: Address,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Relay for NonceWatchRelay {
        fn id(&self) -> &str {
            self.inner.id()
        }

        async fn submit(&self, txs: &[Vec<u8>], target_block: u64) -> Result<RelayAck, RelayError> {
            let outstanding = self.cache.nonce_stats(self.account).map(|s| s.outstanding.len()).unwrap_or(0);
            self.seen.lock().push(outstanding);
            self.inner.submit(txs, target_block).await
        }
    }

    #[tokio::test]
    async fn transient_rejections_rebuild_until_included() {
        let f = fixture();
        let relay = MockRelay::new("fb", MockResponse::AcceptAndInclude)
            .with_script([MockResponse::Transient, MockResponse::Transient])
            .linked_to(Arc::clone(&f.node));
        let watch = Arc::new(NonceWatchRelay {
            inner: relay,
            cache: Arc::clone(&f.cache),
            account: f.executor,
            seen: Mutex::new(vec![]),
        });
        let mgr = manager(&f, vec![Arc::clone(&watch) as Arc<dyn Relay>]);

        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Included { block: 11, .. }), "{outcome:?}");

        let statuses: Vec<_> = mgr.all_records().iter().map(|r| r.status.label()).collect();
        assert_eq!(statuses, vec!["rejected", "rejected", "included"]);
        assert_eq!(*watch.seen.lock(), vec![1, 1, 1]);

        let stats = f.cache.nonce_stats(f.executor).unwrap();
        assert_eq!(stats.reserved, 3);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.confirmed, 1);
        assert!(stats.outstanding.is_empty());
        assert_eq!(f.cache.read_account(f.executor).unwrap().confirmed_nonce, 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let f = fixture();
        let relay = Arc::new(MockRelay::new("fb", MockResponse::Transient));
        let mgr = manager(&f, vec![Arc::clone(&relay) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Rejected { attempts: 3, .. }), "{outcome:?}");
        assert_eq!(relay.submissions().len(), 3);
        assert_eq!(f.observer.count("permanent_failure"), 1);
        assert!(f.cache.nonce_stats(f.executor).unwrap().outstanding.is_empty());
    }

    #[tokio::test]
    async fn semantic_rejection_stops_immediately() {
        let f = fixture();
        let relay = Arc::new(MockRelay::new("fb", MockResponse::Reject));
        let mgr = manager(&f, vec![Arc::clone(&relay) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Rejected { attempts: 1, .. }));
        assert_eq!(relay.submissions().len(), 1);
    }

    #[tokio::test]
    async fn silent_relay_expires_and_releases() {
        let f = fixture();
        let mgr = manager(&f, vec![Arc::new(MockRelay::new("slow", MockResponse::Hang)) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Expired { .. }));
        let records = mgr.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SubmissionStatus::Expired);
        let stats = f.cache.nonce_stats(f.executor).unwrap();
        assert_eq!((stats.reserved, stats.released), (1, 1));
    }

    #[tokio::test]
    async fn head_past_target_is_not_included() {
        let f = fixture();
        f.node.set_head(12);
        let mgr = manager(&f, vec![Arc::new(MockRelay::new("fb", MockResponse::Accept)) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::NotIncluded { .. }));
        assert_eq!(mgr.all_records()[0].status, SubmissionStatus::NotIncluded);
        assert!(f.cache.nonce_stats(f.executor).unwrap().outstanding.is_empty());
        assert_eq!(f.risk.snapshot().open_positions, 0);
    }

    #[tokio::test]
    async fn inclusion_deadline_expires_accepted_bundle() {
        let f = fixture();
        let mgr = manager(&f, vec![Arc::new(MockRelay::new("fb", MockResponse::Accept)) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Expired { .. }));
        assert_eq!(mgr.all_records()[0].status, SubmissionStatus::Expired);
    }

    #[tokio::test]
    async fn every_relay_gets_its_own_record() {
        let f = fixture();
        let good = MockRelay::new("a-good", MockResponse::AcceptAndInclude).linked_to(Arc::clone(&f.node));
        let bad = MockRelay::new("b-bad", MockResponse::Reject);
        let mgr = manager(&f, vec![Arc::new(good) as Arc<dyn Relay>, Arc::new(bad) as Arc<dyn Relay>]);
        let outcome = mgr.submit_result(valid_result(&f)).await;
        assert!(matches!(outcome, SubmissionOutcome::Included { .. }));
        let records = mgr.all_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, SubmissionStatus::Included { block: 11 });
        assert_eq!(records[1].status, SubmissionStatus::Rejected);
        assert_eq!(f.cache.nonce_stats(f.executor).unwrap().confirmed, 1);
    }

    #[tokio::test]
    async fn reverted_inclusion_books_a_loss_at_the_fee_cap() {
        let f = fixture();
        let mgr = manager(&f, vec![Arc::new(MockRelay::new("fb", MockResponse::Accept)) as Arc<dyn Relay>]);
        let bundle = f.builder.build(valid_result(&f), 0).await.unwrap();
        f.node.include(bundle.txs[0].hash, 11, true);
        let max_fee = bundle.max_fee_per_gas;

        let fate = mgr.submit_bundle(Arc::clone(&bundle)).await;
        assert!(matches!(fate, BundleFate::Done(SubmissionOutcome::Included { block: 11, .. })));
        let records = mgr.records(bundle.id);
        let record = &records[0];
        assert_eq!(record.status, SubmissionStatus::Included { block: 11 });
        assert!(record.detail.as_deref().is_some_and(|d| d.contains("reverted")), "{record:?}");
        assert_eq!(f.risk.snapshot().cumulative_loss, 21_000 * max_fee);
        assert_eq!(f.cache.nonce_stats(f.executor).unwrap().confirmed, 1);
    }

    #[tokio::test]
    async fn settlement_happens_once() {
        let f = fixture();
        let mgr = manager(&f, vec![]);
        let bundle = f.builder.build(valid_result(&f), 0).await.unwrap();
        assert!(mgr.shared.settle(&bundle, SubmissionStatus::Expired, None, false));
        assert!(!mgr.shared.settle(&bundle, SubmissionStatus::Rejected, None, false));
        assert!(mgr.is_settled(bundle.id));
        let stats = f.cache.nonce_stats(f.executor).unwrap();
        assert_eq!((stats.reserved, stats.released), (1, 1));
        assert!(!f.cache.is_halted(f.executor));
    }

    #[tokio::test]
    async fn risk_denial_releases_without_records() {
        let f = fixture();
        let mgr = manager(&f, vec![Arc::new(MockRelay::new("fb", MockResponse::Accept)) as Arc<dyn Relay>]);
        let bundle = f.builder.build(valid_result(&f), 0).await.unwrap();
        f.risk.engage_kill_switch("test");
        let fate = mgr.submit_bundle(bundle).await;
        assert!(matches!(fate, BundleFate::Done(SubmissionOutcome::Denied(DenyReason::KillSwitch))));
        assert!(mgr.all_records().is_empty());
        assert!(f.cache.nonce_stats(f.executor).unwrap().outstanding.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_respect_the_position_limit() {
        let f = fixture_with(RiskConfig { max_open_positions: 1, ..RiskConfig::default() });
        let slow = Arc::new(MockRelay::new("slow", MockResponse::Hang)) as Arc<dyn Relay>;
        let mgr = Arc::new(manager(&f, vec![slow]));
        let first = f.builder.build(valid_result(&f), 0).await.unwrap();
        let second = f.builder.build(valid_result(&f), 0).await.unwrap();

        let sends = [first, second].map(|bundle| {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.submit_bundle(bundle).await })
        });
        let mut denied = 0;
        for send in sends {
            let fate = send.await.unwrap();
            if matches!(fate, BundleFate::Done(SubmissionOutcome::Denied(DenyReason::OpenPositions { .. }))) {
                denied += 1;
            }
        }
        assert_eq!(denied, 1);
        assert_eq!(f.risk.snapshot().open_positions, 0);
        assert!(f.cache.nonce_stats(f.executor).unwrap().outstanding.is_empty());
    }

    #[tokio::test]
    async fn cancelled_submission_settles_as_expired() {
        let f = fixture();
        let mut mgr = manager(&f, vec![Arc::new(MockRelay::new("slow", MockResponse::Hang)) as Arc<dyn Relay>]);
        mgr.settings.relay_deadline = Duration::from_secs(60);
        let mgr = Arc::new(mgr);
        let result = valid_result(&f);

        let task = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.submit_result(result).await })
        };
        // wait until the bundle is in flight
        while mgr.all_records().is_empty() {
            sleep(Duration::from_millis(2)).await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let records = mgr.all_records();
        assert_eq!(records[0].status, SubmissionStatus::Expired);
        assert!(mgr.is_settled(records[0].bundle));
        assert!(f.cache.nonce_stats(f.executor).unwrap().outstanding.is_empty());
        assert_eq!(f.risk.snapshot().open_positions, 0);
    }
}
