use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::CoreError;
use crate::types::{
    Bundle, BundleId, Candidate, CandidateDraft, CandidateId, ResultId, SimulationResult, Verdict,
};

/// Arena of immutable, id-referenced pipeline records.
///
/// Components exchange ids; each lookup returns an `Arc` to a record that is
/// never mutated after insertion.
#[derive(Default)]
pub struct Ledger {
    next_candidate: AtomicU64,
    next_result: AtomicU64,
    next_bundle: AtomicU64,
    candidates: DashMap<CandidateId, Arc<Candidate>>,
    results: DashMap<ResultId, Arc<SimulationResult>>,
    results_by_candidate: DashMap<CandidateId, Vec<ResultId>>,
    bundles: DashMap<BundleId, Arc<Bundle>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_candidate(
        &self,
        draft: CandidateDraft,
        observed_height: u64,
        validity_window: u64,
        emitted_at_ms: u128,
    ) -> Arc<Candidate> {
        let seq = self.next_candidate.fetch_add(1, Ordering::Relaxed) + 1;
        let candidate = Arc::new(Candidate {
            id: CandidateId(seq),
            strategy: draft.strategy,
            venues: draft.venues,
            steps: draft.steps,
            assumed: draft.assumed,
            gross_profit: draft.gross_profit,
            observed_height,
            validity_window,
            emitted_at_ms,
            emitted_seq: seq,
        });
        self.candidates.insert(candidate.id, Arc::clone(&candidate));
        candidate
    }

    pub fn insert_result(
        &self,
        candidate: CandidateId,
        net_profit: i128,
        gas_used: u64,
        gas_cost: u128,
        fork_height: u64,
        verdict: Verdict,
    ) -> Arc<SimulationResult> {
        let id = ResultId(self.next_result.fetch_add(1, Ordering::Relaxed) + 1);
        let result = Arc::new(SimulationResult { id, candidate, net_profit, gas_used, gas_cost, fork_height, verdict });
        self.results.insert(id, Arc::clone(&result));
        self.results_by_candidate.entry(candidate).or_default().push(id);
        result
    }

    /// Reserves the next bundle id. Ids increase monotonically across the process.
    pub fn next_bundle_id(&self) -> BundleId {
        BundleId(self.next_bundle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert_bundle(&self, bundle: Bundle) -> Arc<Bundle> {
        let bundle = Arc::new(bundle);
        self.bundles.insert(bundle.id, Arc::clone(&bundle));
        bundle
    }

    pub fn candidate(&self, id: CandidateId) -> Result<Arc<Candidate>, CoreError> {
        self.candidates
            .get(&id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CoreError::MissingRecord(id.to_string()))
    }

    pub fn result(&self, id: ResultId) -> Result<Arc<SimulationResult>, CoreError> {
        self.results
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::MissingRecord(id.to_string()))
    }

    pub fn bundle(&self, id: BundleId) -> Result<Arc<Bundle>, CoreError> {
        self.bundles
            .get(&id)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| CoreError::MissingRecord(id.to_string()))
    }

    pub fn results_for(&self, candidate: CandidateId) -> Vec<Arc<SimulationResult>> {
        let ids = self.results_by_candidate.get(&candidate).map(|r| r.value().clone()).unwrap_or_default();
        ids.into_iter().filter_map(|id| self.result(id).ok()).collect()
    }

    /// Drops candidates (and their results and bundles) last valid before `height`.
    pub fn prune_before(&self, height: u64) -> usize {
        let expired: Vec<CandidateId> = self
            .candidates
            .iter()
            .filter(|c| c.last_valid_height() < height)
            .map(|c| c.id)
            .collect();
        for id in &expired {
            self.candidates.remove(id);
            if let Some((_, results)) = self.results_by_candidate.remove(id) {
                for r in results {
                    self.results.remove(&r);
                }
            }
        }
        self.bundles.retain(|_, b| !expired.contains(&b.candidate));
        expired.len()
    }
}
