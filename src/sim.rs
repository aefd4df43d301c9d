use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, NodeError};
use crate::ledger::Ledger;
use crate::node::{FeeQuote, ForkOutcome, NodeClient, StepOutcome};
use crate::observe::{CoreEvent, Observer};
use crate::retry::retry_async;
use crate::types::{
    Action, Candidate, InvalidReason, SimulationResult, StaleReason, Step, Verdict, VenueId, VenueState,
};

const TRANSFER_GAS: u64 = 21_000;
const ROUTE_BASE_GAS: u64 = 60_000;
const HOP_GAS: u64 = 45_000;

/// Point-in-time chain state a candidate is judged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSnapshot {
    pub height: u64,
    pub venues: HashMap<VenueId, VenueState>,
    pub fees: FeeQuote,
    pub execution: ForkOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub net_profit: i128,
    pub gas_used: u64,
    pub gas_cost: u128,
    pub verdict: Verdict,
}

/// Checks the candidate's assumed quotes against fresh venue state.
pub fn check_quotes(
    candidate: &Candidate,
    venues: &HashMap<VenueId, VenueState>,
    tolerance_bps: u64,
) -> Option<Verdict> {
    for id in &candidate.venues {
        if !venues.contains_key(id) {
            return Some(Verdict::Invalid(InvalidReason::UnknownVenue(*id)));
        }
    }
    for assumed in &candidate.assumed {
        let Some(fresh) = venues.get(&assumed.venue) else {
            return Some(Verdict::Invalid(InvalidReason::UnknownVenue(assumed.venue)));
        };
        let bps = assumed.drift_bps(fresh);
        if bps > tolerance_bps {
            return Some(Verdict::Stale(StaleReason::Drift { venue: assumed.venue, bps }));
        }
    }
    None
}

/// Judges `candidate` against a frozen snapshot. Same inputs, same evaluation.
pub fn simulate_on(candidate: &Candidate, snapshot: &ForkSnapshot, tolerance_bps: u64) -> Evaluation {
    if let Some(verdict) = check_quotes(candidate, &snapshot.venues, tolerance_bps) {
        return Evaluation { net_profit: 0, gas_used: 0, gas_cost: 0, verdict };
    }
    let gas_used = snapshot.execution.gas_used();
    let gas_cost = u128::from(gas_used).saturating_mul(snapshot.fees.effective_price());
    let cost = i128::try_from(gas_cost).unwrap_or(i128::MAX);
    if let Some((step, reason)) = snapshot.execution.first_revert() {
        return Evaluation {
            net_profit: -cost,
            gas_used,
            gas_cost,
            verdict: Verdict::Invalid(InvalidReason::Reverts { step, reason: reason.to_string() }),
        };
    }
    if snapshot.execution.steps.len() != candidate.steps.len() {
        return Evaluation {
            net_profit: -cost,
            gas_used,
            gas_cost,
            verdict: Verdict::Invalid(InvalidReason::Reverts {
                step: snapshot.execution.steps.len(),
                reason: "step not executed".to_string(),
            }),
        };
    }
    Evaluation {
        net_profit: snapshot.execution.balance_delta.saturating_sub(cost),
        gas_used,
        gas_cost,
        verdict: Verdict::Valid,
    }
}

/// In-process execution of a step sequence against constant-product venues.
/// Swaps mutate the local venue copies so later steps see earlier ones.
pub fn execute_locally(steps: &[Step], venues: &HashMap<VenueId, VenueState>) -> ForkOutcome {
    let mut venues = venues.clone();
    let mut outcome = ForkOutcome::default();
    for step in steps {
        let (gas, result) = match &step.action {
            Action::Transfer { .. } => (TRANSFER_GAS, Ok(0i128)),
            Action::Route { hops, amount_in, min_out, .. } => {
                let gas = ROUTE_BASE_GAS + HOP_GAS * hops.len() as u64;
                let mut amount = *amount_in;
                let mut result = Ok(());
                for hop in hops {
                    let Some(venue) = venues.get_mut(&hop.venue) else {
                        result = Err(format!("unknown pool {:?}", hop.pool));
                        break;
                    };
                    let (next, out) = venue.after_swap(amount, hop.zero_for_one);
                    *venue = next;
                    amount = out;
                }
                let result = result.and_then(|_| {
                    if amount < *min_out {
                        Err(format!("insufficient output {amount} < {min_out}"))
                    } else {
                        Ok(amount as i128 - *amount_in as i128)
                    }
                });
                (gas, result)
            }
        };
        if gas > step.gas_limit {
            outcome.steps.push(StepOutcome { gas_used: step.gas_limit, revert: Some("out of gas".to_string()) });
            break;
        }
        match result {
            Ok(delta) => {
                outcome.balance_delta += delta;
                outcome.steps.push(StepOutcome { gas_used: gas, revert: None });
            }
            Err(reason) => {
                outcome.steps.push(StepOutcome { gas_used: gas, revert: Some(reason) });
                break;
            }
        }
    }
    outcome
}

/// Re-prices candidates against fresh node state on a fork.
pub struct SimulationEngine {
    node: Arc<dyn NodeClient>,
    ledger: Arc<Ledger>,
    observer: Arc<dyn Observer>,
    tolerance_bps: u64,
    deadline: Duration,
    retry_attempts: usize,
    retry_backoff: Duration,
}

impl SimulationEngine {
    pub fn new(
        node: Arc<dyn NodeClient>,
        ledger: Arc<Ledger>,
        observer: Arc<dyn Observer>,
        tolerance_bps: u64,
        deadline: Duration,
    ) -> Self {
        Self {
            node,
            ledger,
            observer,
            tolerance_bps,
            deadline,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_retry(mut self, attempts: usize, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Pins the node head and fetches everything the candidate touches at it.
    pub async fn snapshot(&self, candidate: &Candidate) -> Result<ForkSnapshot, NodeError> {
        let node = &self.node;
        let (attempts, backoff) = (self.retry_attempts, self.retry_backoff);
        let height = retry_async(|_| node.head(), NodeError::is_retryable, attempts, backoff).await?;
        let mut venues = HashMap::new();
        for id in &candidate.venues {
            let id = *id;
            let state = retry_async(|_| node.venue_at(id, height), NodeError::is_retryable, attempts, backoff).await?;
            venues.insert(id, state);
        }
        let fees = retry_async(|_| node.fee_quote(), NodeError::is_retryable, attempts, backoff).await?;
        let mut snapshot = ForkSnapshot { height, venues, fees, execution: ForkOutcome::default() };
        if check_quotes(candidate, &snapshot.venues, self.tolerance_bps).is_none() {
            snapshot.execution = retry_async(
                |_| node.execute_on_fork(height, &candidate.steps),
                NodeError::is_retryable,
                attempts,
                backoff,
            )
            .await?;
        }
        Ok(snapshot)
    }

    /// Simulates `candidate` under the engine deadline and records the result.
    ///
    /// Deadline overrun is a `stale` verdict; exhausting node retries is a
    /// technical failure reported as `CoreError::Degraded`.
    pub async fn simulate(&self, candidate: &Candidate) -> Result<Arc<SimulationResult>, CoreError> {
        let evaluated = tokio::time::timeout(self.deadline, self.snapshot(candidate)).await;
        let (evaluation, fork_height) = match evaluated {
            Err(_) => (
                Evaluation { net_profit: 0, gas_used: 0, gas_cost: 0, verdict: Verdict::Stale(StaleReason::Deadline) },
                candidate.observed_height,
            ),
            Ok(Err(NodeError::UnknownVenue(venue))) => (
                Evaluation {
                    net_profit: 0,
                    gas_used: 0,
                    gas_cost: 0,
                    verdict: Verdict::Invalid(InvalidReason::UnknownVenue(venue)),
                },
                candidate.observed_height,
            ),
            Ok(Err(e)) => {
                tracing::warn!(candidate = %candidate.id, error = %e, "simulation degraded");
                self.observer.emit(CoreEvent::Degraded { component: "simulation", error: e.to_string() });
                return Err(CoreError::Degraded(e));
            }
            Ok(Ok(snapshot)) => (simulate_on(candidate, &snapshot, self.tolerance_bps), snapshot.height),
        };

        let result = self.ledger.insert_result(
            candidate.id,
            evaluation.net_profit,
            evaluation.gas_used,
            evaluation.gas_cost,
            fork_height,
            evaluation.verdict,
        );
        tracing::info!(
            candidate = %candidate.id,
            result = %result.id,
            verdict = %result.verdict,
            net_profit = %result.net_profit,
            gas_used = result.gas_used,
            fork_height,
            "simulation finished"
        );
        self.observer.emit(CoreEvent::SimulationCompleted {
            candidate: candidate.id,
            result: result.id,
            verdict: result.verdict.to_string(),
            net_profit: result.net_profit,
            gas_used: result.gas_used,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockNode;
    use crate::observe::RecordingObserver;
    use crate::types::{CandidateDraft, Hop};
    use ethers_core::types::Address;

    fn venue(id: u32, r0: u128, r1: u128) -> VenueState {
        VenueState {
            id: VenueId(id),
            address: Address::repeat_byte(id as u8),
            token0: Address::repeat_byte(0xaa),
            token1: Address::repeat_byte(0xbb),
            reserve0: r0,
            reserve1: r1,
            fee_bps: 30,
            height: 10,
        }
    }

    fn engine(node: Arc<MockNode>, ledger: &Arc<Ledger>, deadline: Duration) -> SimulationEngine {
        SimulationEngine::new(node, Arc::clone(ledger), Arc::new(RecordingObserver::new()), 50, deadline)
    }

    fn candidate(ledger: &Ledger, min_out: u128) -> Arc<Candidate> {
        let (a, b) = (venue(1, 1_000_000, 2_000_000), venue(2, 1_000_000, 1_000_000));
        let draft = CandidateDraft {
            strategy: "test".into(),
            venues: vec![a.id, b.id],
            steps: vec![
                Step {
                    account: Address::repeat_byte(0x11),
                    action: Action::Transfer { to: Address::repeat_byte(0x22), amount: 1_000 },
                    gas_limit: 21_000,
                },
                Step {
                    account: Address::repeat_byte(0x22),
                    action: Action::Route {
                        router: Address::repeat_byte(0x33),
                        hops: vec![
                            Hop { venue: a.id, pool: a.address, zero_for_one: true },
                            Hop { venue: b.id, pool: b.address, zero_for_one: false },
                        ],
                        amount_in: 1_000,
                        min_out,
                    },
                    gas_limit: 250_000,
                },
            ],
            assumed: vec![a.quote(), b.quote()],
            gross_profit: 900,
        };
        ledger.insert_candidate(draft, 10, 2, 0)
    }

    fn snapshot(c: &Candidate) -> ForkSnapshot {
        let venues: HashMap<_, _> = [venue(1, 1_000_000, 2_000_000), venue(2, 1_000_000, 1_000_000)]
            .into_iter()
            .map(|v| (v.id, v))
            .collect();
        let execution = execute_locally(&c.steps, &venues);
        ForkSnapshot { height: 10, venues, fees: FeeQuote { base_fee: 0, priority_fee: 0 }, execution }
    }

    #[test]
    fn frozen_snapshot_is_deterministic() {
        let ledger = Ledger::new();
        let c = candidate(&ledger, 0);
        let snap = snapshot(&c);
        let first = simulate_on(&c, &snap, 50);
        for _ in 0..10 {
            assert_eq!(simulate_on(&c, &snap, 50), first);
        }
        assert!(first.verdict.is_valid());
        assert!(first.net_profit > 0);
        assert_eq!(first.gas_used, TRANSFER_GAS + ROUTE_BASE_GAS + 2 * HOP_GAS);
    }

    #[test]
    fn drift_beyond_tolerance_is_stale() {
        let ledger = Ledger::new();
        let c = candidate(&ledger, 0);
        let mut snap = snapshot(&c);
        snap.venues.get_mut(&VenueId(2)).unwrap().reserve0 = 1_100_000;
        assert_eq!(
            simulate_on(&c, &snap, 50).verdict,
            Verdict::Stale(StaleReason::Drift { venue: VenueId(2), bps: 1_000 })
        );
    }

    #[test]
    fn min_out_violation_reverts() {
        let ledger = Ledger::new();
        let c = candidate(&ledger, u128::MAX);
        let eval = simulate_on(&c, &snapshot(&c), 50);
        assert!(matches!(eval.verdict, Verdict::Invalid(InvalidReason::Reverts { step: 1, .. })));
    }

    #[test]
    fn gas_cost_is_subtracted() {
        let ledger = Ledger::new();
        let c = candidate(&ledger, 0);
        let mut snap = snapshot(&c);
        let free = simulate_on(&c, &snap, 50);
        snap.fees = FeeQuote { base_fee: 1, priority_fee: 0 };
        let paid = simulate_on(&c, &snap, 50);
        assert_eq!(paid.net_profit, free.net_profit - paid.gas_used as i128);
    }

    #[tokio::test]
    async fn engine_records_results_in_ledger() {
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        node.set_venue(venue(1, 1_000_000, 2_000_000));
        node.set_venue(venue(2, 1_000_000, 1_000_000));
        let engine = SimulationEngine::new(
            node,
            Arc::clone(&ledger),
            Arc::new(RecordingObserver::new()),
            50,
            Duration::from_secs(1),
        );
        let c = candidate(&ledger, 0);
        let result = engine.simulate(&c).await.unwrap();
        assert!(result.verdict.is_valid());
        assert_eq!(ledger.results_for(c.id).len(), 1);
    }

    #[tokio::test]
    async fn missing_venue_is_invalid() {
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        node.set_venue(venue(1, 1_000_000, 2_000_000));
        let engine = engine(node, &ledger, Duration::from_secs(1));
        let result = engine.simulate(&candidate(&ledger, 0)).await.unwrap();
        assert_eq!(result.verdict, Verdict::Invalid(InvalidReason::UnknownVenue(VenueId(2))));
    }

    #[tokio::test]
    async fn slow_node_yields_stale_deadline() {
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        node.set_venue(venue(1, 1_000_000, 2_000_000));
        node.set_venue(venue(2, 1_000_000, 1_000_000));
        node.set_latency(Duration::from_millis(200));
        let engine = engine(node, &ledger, Duration::from_millis(20));
        let result = engine.simulate(&candidate(&ledger, 0)).await.unwrap();
        assert_eq!(result.verdict, Verdict::Stale(StaleReason::Deadline));
    }

    #[tokio::test]
    async fn exhausted_retries_are_degraded() {
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        node.fail_next(10);
        let observer = Arc::new(RecordingObserver::new());
        let observed = Arc::clone(&observer) as Arc<dyn Observer>;
        let engine = SimulationEngine::new(node, Arc::clone(&ledger), observed, 50, Duration::from_secs(1))
            .with_retry(2, Duration::from_millis(1));
        let err = engine.simulate(&candidate(&ledger, 0)).await.unwrap_err();
        assert!(matches!(err, CoreError::Degraded(NodeError::Connectivity(_))));
        assert_eq!(observer.count("degraded"), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let ledger = Arc::new(Ledger::new());
        let node = Arc::new(MockNode::new(10));
        node.set_venue(venue(1, 1_000_000, 2_000_000));
        node.set_venue(venue(2, 1_000_000, 1_000_000));
        node.fail_next(1);
        let engine = engine(node, &ledger, Duration::from_secs(1)).with_retry(3, Duration::from_millis(1));
        assert!(engine.simulate(&candidate(&ledger, 0)).await.unwrap().verdict.is_valid());
    }
}
