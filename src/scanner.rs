use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};

use crate::cache::{ChainStateCache, StateChange};
use crate::ledger::Ledger;
use crate::observe::{CoreEvent, DropReason, Observer};
use crate::strategy::Strategy;
use crate::types::{Candidate, VenueId, unix_millis};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTrigger {
    Changed(StateChange),
    /// Re-evaluate these venues even if their height was already seen.
    Rescan { venues: Vec<VenueId> },
}

/// Bounded set of `(venue, height)` pairs already evaluated.
struct SeenSet {
    seen: HashSet<(VenueId, u64)>,
    order: VecDeque<(VenueId, u64)>,
    max_len: usize,
}

impl SeenSet {
    fn new(max_len: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), max_len: max_len.max(1) }
    }

    /// Returns `true` only for first-seen keys.
    fn remember(&mut self, key: (VenueId, u64)) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.max_len
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

/// Turns cache notifications into ranked, conflict-free candidates.
pub struct Scanner {
    cache: Arc<ChainStateCache>,
    ledger: Arc<Ledger>,
    strategies: Vec<Arc<dyn Strategy>>,
    observer: Arc<dyn Observer>,
    validity_window: u64,
    seen: SeenSet,
}

impl Scanner {
    pub fn new(
        cache: Arc<ChainStateCache>,
        ledger: Arc<Ledger>,
        strategies: Vec<Arc<dyn Strategy>>,
        observer: Arc<dyn Observer>,
        validity_window: u64,
        dedup_capacity: usize,
    ) -> Self {
        Self { cache, ledger, strategies, observer, validity_window, seen: SeenSet::new(dedup_capacity) }
    }

    /// One evaluation pass over a batch of drained triggers.
    pub fn evaluate_pass(&mut self, triggers: Vec<ScanTrigger>) -> Vec<Arc<Candidate>> {
        let mut touched: Vec<VenueId> = Vec::new();
        for trigger in triggers {
            match trigger {
                ScanTrigger::Changed(StateChange::Venue { id, height }) => {
                    if self.seen.remember((id, height)) && !touched.contains(&id) {
                        touched.push(id);
                    }
                }
                ScanTrigger::Changed(_) => {}
                ScanTrigger::Rescan { venues } => {
                    for id in venues {
                        if !touched.contains(&id) {
                            touched.push(id);
                        }
                    }
                }
            }
        }
        if touched.is_empty() {
            return Vec::new();
        }

        let view = self.cache.venues();
        let head = self.cache.head();
        let mut pool: Vec<Arc<Candidate>> = Vec::new();
        for strategy in &self.strategies {
            for draft in strategy.evaluate(&view, &touched) {
                if let Err(e) = draft.validate() {
                    tracing::warn!(strategy = strategy.tag(), error = %e, "discarding malformed draft");
                    continue;
                }
                pool.push(self.ledger.insert_candidate(draft, head, self.validity_window, unix_millis()));
            }
        }

        let accepted = self.resolve_conflicts(pool, head);
        for c in &accepted {
            self.observer.emit(CoreEvent::CandidateEmitted {
                candidate: c.id,
                strategy: c.strategy.clone(),
                gross_profit: c.gross_profit,
                height: c.observed_height,
            });
        }
        tracing::debug!(touched = touched.len(), emitted = accepted.len(), head, "scan pass complete");
        accepted
    }

    /// Highest gross profit wins among candidates sharing a venue; equal profit
    /// goes to the earlier emission.
    fn resolve_conflicts(&self, mut pool: Vec<Arc<Candidate>>, head: u64) -> Vec<Arc<Candidate>> {
        pool.sort_by(|a, b| {
            if a.outranks(b) {
                std::cmp::Ordering::Less
            } else if b.outranks(a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        let mut accepted: Vec<Arc<Candidate>> = Vec::new();
        for candidate in pool {
            if candidate.is_expired(head) {
                self.drop_expired(&candidate, head);
                continue;
            }
            if let Some(winner) = accepted.iter().find(|w| w.overlaps(&candidate)) {
                tracing::info!(
                    candidate = %candidate.id,
                    winner = %winner.id,
                    gross_profit = %candidate.gross_profit,
                    winner_profit = %winner.gross_profit,
                    "candidate lost tie-break"
                );
                self.observer.emit(CoreEvent::CandidateDropped {
                    candidate: candidate.id,
                    reason: DropReason::TieBreak { winner: winner.id },
                });
                continue;
            }
            accepted.push(candidate);
        }
        accepted
    }

    fn drop_expired(&self, candidate: &Candidate, head: u64) {
        tracing::info!(
            candidate = %candidate.id,
            observed = candidate.observed_height,
            window = candidate.validity_window,
            head,
            "candidate expired before simulation"
        );
        self.observer.emit(CoreEvent::CandidateDropped {
            candidate: candidate.id,
            reason: DropReason::Expired {
                observed: candidate.observed_height,
                window: candidate.validity_window,
                head,
            },
        });
    }

    /// Scanner task: waits for a notification, drains everything queued behind
    /// it and runs a single pass over the batch.
    pub async fn run(
        mut self,
        mut changes: broadcast::Receiver<StateChange>,
        mut rescans: mpsc::Receiver<Vec<VenueId>>,
        out: mpsc::Sender<Arc<Candidate>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut rescans_open = true;
        loop {
            let first = tokio::select! {
                _ = shutdown.changed() => break,
                change = changes.recv() => match change {
                    Ok(c) => ScanTrigger::Changed(c),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "scanner lagged behind cache notifications; rescanning all venues");
                        self.rescan_all()
                    }
                    Err(RecvError::Closed) => break,
                },
                venues = rescans.recv(), if rescans_open => match venues {
                    Some(venues) => ScanTrigger::Rescan { venues },
                    None => {
                        rescans_open = false;
                        continue;
                    }
                },
            };

            let mut batch = vec![first];
            loop {
                match changes.try_recv() {
                    Ok(c) => batch.push(ScanTrigger::Changed(c)),
                    Err(TryRecvError::Lagged(_)) => batch.push(self.rescan_all()),
                    Err(_) => break,
                }
            }
            while let Ok(venues) = rescans.try_recv() {
                batch.push(ScanTrigger::Rescan { venues });
            }

            for candidate in self.evaluate_pass(batch) {
                if out.send(candidate).await.is_err() {
                    tracing::info!("candidate consumer closed; scanner stopping");
                    return;
                }
            }
        }
        tracing::info!("scanner stopped");
    }

    fn rescan_all(&self) -> ScanTrigger {
        ScanTrigger::Rescan { venues: self.cache.venues().iter().map(|v| v.id).collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::RecordingObserver;
    use crate::types::{Action, CandidateDraft, Step, VenueState};
    use ethers_core::types::Address;
    use parking_lot::Mutex;

    /// Emits whatever drafts it was loaded with.
    struct Scripted {
        drafts: Mutex<Vec<CandidateDraft>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(drafts: Vec<CandidateDraft>) -> Arc<Self> {
            Arc::new(Self { drafts: Mutex::new(drafts), calls: Mutex::new(0) })
        }
    }

    impl Strategy for Scripted {
        fn tag(&self) -> &str {
            "scripted"
        }

        fn evaluate(&self, _view: &[Arc<VenueState>], _touched: &[VenueId]) -> Vec<CandidateDraft> {
            *self.calls.lock() += 1;
            self.drafts.lock().clone()
        }
    }

    fn draft(venues: &[u32], profit: i128, account: u8) -> CandidateDraft {
        CandidateDraft {
            strategy: "scripted".into(),
            venues: venues.iter().map(|v| VenueId(*v)).collect(),
            steps: vec![Step {
                account: Address::repeat_byte(account),
                action: Action::Transfer { to: Address::zero(), amount: 1 },
                gas_limit: 21_000,
            }],
            assumed: vec![],
            gross_profit: profit,
        }
    }

    fn venue(id: u32, height: u64) -> VenueState {
        VenueState {
            id: VenueId(id),
            address: Address::repeat_byte(id as u8),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            reserve0: 1_000,
            reserve1: 1_000,
            fee_bps: 30,
            height,
        }
    }

    fn scanner(strategy: Arc<Scripted>, observer: Arc<RecordingObserver>) -> (Scanner, Arc<ChainStateCache>) {
        let cache = Arc::new(ChainStateCache::new(4, 64));
        let scanner = Scanner::new(Arc::clone(&cache), Arc::new(Ledger::new()), vec![strategy], observer, 2, 16);
        (scanner, cache)
    }

    fn changed(id: u32, height: u64) -> ScanTrigger {
        ScanTrigger::Changed(StateChange::Venue { id: VenueId(id), height })
    }

    #[test]
    fn overlapping_candidates_keep_the_more_profitable() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1, 2], 10, 1), draft(&[2, 3], 12, 2)]);
        let (mut scanner, cache) = scanner(strategy, Arc::clone(&observer));
        cache.update_venue(venue(2, 5));

        let out = scanner.evaluate_pass(vec![changed(2, 5)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].gross_profit, 12);
        let dropped = observer
            .events()
            .into_iter()
            .find_map(|e| match e {
                CoreEvent::CandidateDropped { candidate, reason: DropReason::TieBreak { winner } } => {
                    Some((candidate, winner))
                }
                _ => None,
            })
            .expect("tie-break drop recorded");
        assert_eq!(dropped.1, out[0].id);
        assert_ne!(dropped.0, out[0].id);
    }

    #[test]
    fn equal_profit_goes_to_earlier_emission() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1], 10, 1), draft(&[1], 10, 2)]);
        let (mut scanner, _cache) = scanner(strategy, observer);
        let out = scanner.evaluate_pass(vec![changed(1, 5)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].steps[0].account, Address::repeat_byte(1));
    }

    #[test]
    fn disjoint_candidates_both_proceed() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1], 10, 1), draft(&[2], 3, 2)]);
        let (mut scanner, _cache) = scanner(strategy, observer);
        assert_eq!(scanner.evaluate_pass(vec![changed(1, 5)]).len(), 2);
    }

    #[test]
    fn duplicate_notifications_are_idempotent() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1], 10, 1)]);
        let (mut scanner, _cache) = scanner(Arc::clone(&strategy), Arc::clone(&observer));
        assert_eq!(scanner.evaluate_pass(vec![changed(1, 5), changed(1, 5)]).len(), 1);
        assert!(scanner.evaluate_pass(vec![changed(1, 5)]).is_empty());
        assert_eq!(*strategy.calls.lock(), 1);
        assert_eq!(observer.count("candidate_emitted"), 1);
    }

    #[test]
    fn rescan_bypasses_dedup() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1], 10, 1)]);
        let (mut scanner, _cache) = scanner(Arc::clone(&strategy), observer);
        scanner.evaluate_pass(vec![changed(1, 5)]);
        assert_eq!(scanner.evaluate_pass(vec![ScanTrigger::Rescan { venues: vec![VenueId(1)] }]).len(), 1);
        assert_eq!(*strategy.calls.lock(), 2);
    }

    #[test]
    fn malformed_drafts_are_discarded() {
        let observer = Arc::new(RecordingObserver::new());
        let mut bad = draft(&[1], 50, 1);
        bad.steps.clear();
        let strategy = Scripted::new(vec![bad, draft(&[1], 10, 2)]);
        let (mut scanner, _cache) = scanner(strategy, observer);
        let out = scanner.evaluate_pass(vec![changed(1, 5)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].gross_profit, 10);
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenSet::new(2);
        assert!(seen.remember((VenueId(1), 1)));
        assert!(seen.remember((VenueId(1), 2)));
        assert!(seen.remember((VenueId(1), 3)));
        // oldest entry was evicted
        assert!(seen.remember((VenueId(1), 1)));
        assert!(!seen.remember((VenueId(1), 3)));
    }

    #[tokio::test]
    async fn task_batches_queued_notifications() {
        let observer = Arc::new(RecordingObserver::new());
        let strategy = Scripted::new(vec![draft(&[1], 10, 1)]);
        let (scanner, cache) = scanner(Arc::clone(&strategy), observer);
        let changes = cache.subscribe();
        let (_rescan_tx, rescan_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        cache.update_venue(venue(1, 5));
        cache.update_venue(venue(2, 5));
        let handle = tokio::spawn(scanner.run(changes, rescan_rx, out_tx, stop_rx));

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.gross_profit, 10);
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(*strategy.calls.lock(), 1);
    }
}
