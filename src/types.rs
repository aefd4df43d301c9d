use std::collections::HashSet;
use std::fmt;

use ethers_core::abi::{self, Token};
use ethers_core::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(pub u32);

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "venue-{}", self.0)
    }
}

macro_rules! record_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

record_id!(CandidateId, "cand");
record_id!(ResultId, "sim");
record_id!(BundleId, "bundle");

/// Last observed reserves of a constant-product venue. Replaced wholesale on
/// every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueState {
    pub id: VenueId,
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub reserve0: u128,
    pub reserve1: u128,
    pub fee_bps: u32,
    pub height: u64,
}

impl VenueState {
    /// Output amount for `amount_in` using x*y=k with the venue fee applied to the input.
    pub fn amount_out(&self, amount_in: u128, zero_for_one: bool) -> u128 {
        let (reserve_in, reserve_out) = if zero_for_one {
            (self.reserve0, self.reserve1)
        } else {
            (self.reserve1, self.reserve0)
        };
        if amount_in == 0 || reserve_in == 0 || reserve_out == 0 || self.fee_bps >= 10_000 {
            return 0;
        }
        let in_with_fee = U256::from(amount_in) * U256::from(10_000 - self.fee_bps);
        let numerator = in_with_fee * U256::from(reserve_out);
        let denominator = U256::from(reserve_in) * U256::from(10_000u32) + in_with_fee;
        (numerator / denominator).as_u128()
    }

    /// Applies a swap to a copy of this state.
    pub fn after_swap(&self, amount_in: u128, zero_for_one: bool) -> (VenueState, u128) {
        let out = self.amount_out(amount_in, zero_for_one);
        let mut next = self.clone();
        if zero_for_one {
            next.reserve0 = next.reserve0.saturating_add(amount_in);
            next.reserve1 = next.reserve1.saturating_sub(out);
        } else {
            next.reserve1 = next.reserve1.saturating_add(amount_in);
            next.reserve0 = next.reserve0.saturating_sub(out);
        }
        (next, out)
    }

    pub fn quote(&self) -> VenueQuote {
        VenueQuote { venue: self.id, reserve0: self.reserve0, reserve1: self.reserve1, height: self.height }
    }

    pub fn same_pair(&self, other: &VenueState) -> bool {
        self.token0 == other.token0 && self.token1 == other.token1
    }
}

/// The reserves a candidate was priced against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueQuote {
    pub venue: VenueId,
    pub reserve0: u128,
    pub reserve1: u128,
    pub height: u64,
}

impl VenueQuote {
    /// Largest relative reserve change against `fresh`, in basis points.
    pub fn drift_bps(&self, fresh: &VenueState) -> u64 {
        fn rel(old: u128, new: u128) -> u64 {
            if old == 0 {
                return if new == 0 { 0 } else { u64::MAX };
            }
            let diff = U256::from(old.abs_diff(new)) * U256::from(10_000u32) / U256::from(old);
            if diff > U256::from(u64::MAX) { u64::MAX } else { diff.as_u64() }
        }
        rel(self.reserve0, fresh.reserve0).max(rel(self.reserve1, fresh.reserve1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    pub address: Address,
    pub confirmed_nonce: u64,
    /// Next nonce the cache would hand out.
    pub pending_watermark: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub venue: VenueId,
    pub pool: Address,
    pub zero_for_one: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Plain value transfer, used to finance a later step.
    Transfer { to: Address, amount: u128 },
    /// Routed swap through `router`; reverts when output falls below `min_out`.
    Route { router: Address, hops: Vec<Hop>, amount_in: u128, min_out: u128 },
}

impl Action {
    pub fn target(&self) -> Address {
        match self {
            Action::Transfer { to, .. } => *to,
            Action::Route { router, .. } => *router,
        }
    }

    pub fn value(&self) -> u128 {
        match self {
            Action::Transfer { amount, .. } => *amount,
            Action::Route { .. } => 0,
        }
    }

    pub fn calldata(&self) -> Bytes {
        match self {
            Action::Transfer { .. } => Bytes::default(),
            Action::Route { hops, amount_in, min_out, .. } => {
                let hops = hops
                    .iter()
                    .map(|h| Token::Tuple(vec![Token::Address(h.pool), Token::Bool(h.zero_for_one)]))
                    .collect();
                Bytes::from(abi::encode(&[
                    Token::Uint(U256::from(*amount_in)),
                    Token::Uint(U256::from(*min_out)),
                    Token::Array(hops),
                ]))
            }
        }
    }
}

/// One transaction of a candidate, sent from `account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub account: Address,
    pub action: Action,
    pub gas_limit: u64,
}

/// What a strategy emits before the scanner stamps ids and heights on it.
#[derive(Debug, Clone)]
pub struct CandidateDraft {
    pub strategy: String,
    pub venues: Vec<VenueId>,
    /// Dependency order; financing steps come first.
    pub steps: Vec<Step>,
    pub assumed: Vec<VenueQuote>,
    pub gross_profit: i128,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DraftError {
    #[error("candidate has no steps")]
    NoSteps,
    #[error("account {0:?} appears in more than one step")]
    DuplicateAccount(Address),
}

impl CandidateDraft {
    pub fn validate(&self) -> Result<(), DraftError> {
        if self.steps.is_empty() {
            return Err(DraftError::NoSteps);
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.account) {
                return Err(DraftError::DuplicateAccount(step.account));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: CandidateId,
    pub strategy: String,
    pub venues: Vec<VenueId>,
    pub steps: Vec<Step>,
    pub assumed: Vec<VenueQuote>,
    pub gross_profit: i128,
    pub observed_height: u64,
    pub validity_window: u64,
    pub emitted_at_ms: u128,
    /// Global emission order, breaks ties between equal timestamps.
    pub emitted_seq: u64,
}

impl Candidate {
    pub fn last_valid_height(&self) -> u64 {
        self.observed_height.saturating_add(self.validity_window)
    }

    pub fn is_expired(&self, head: u64) -> bool {
        head > self.last_valid_height()
    }

    pub fn overlaps(&self, other: &Candidate) -> bool {
        self.venues.iter().any(|v| other.venues.contains(v))
    }

    /// True when `self` should win a conflict against `other`.
    pub fn outranks(&self, other: &Candidate) -> bool {
        if self.gross_profit != other.gross_profit {
            return self.gross_profit > other.gross_profit;
        }
        (self.emitted_at_ms, self.emitted_seq) < (other.emitted_at_ms, other.emitted_seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    Reverts { step: usize, reason: String },
    UnknownVenue(VenueId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    Drift { venue: VenueId, bps: u64 },
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(InvalidReason),
    Stale(StaleReason),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => write!(f, "valid"),
            Verdict::Invalid(InvalidReason::Reverts { step, reason }) => {
                write!(f, "invalid: reverts (step {step}: {reason})")
            }
            Verdict::Invalid(InvalidReason::UnknownVenue(v)) => write!(f, "invalid: unknown venue {v}"),
            Verdict::Stale(StaleReason::Drift { venue, bps }) => write!(f, "stale: {venue} drifted {bps} bps"),
            Verdict::Stale(StaleReason::Deadline) => write!(f, "stale: deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    pub id: ResultId,
    pub candidate: CandidateId,
    /// Balance delta minus gas cost; negative for a losing sequence.
    pub net_profit: i128,
    pub gas_used: u64,
    pub gas_cost: u128,
    pub fork_height: u64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation {
    pub account: Address,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub account: Address,
    pub nonce: u64,
    pub hash: H256,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub result: ResultId,
    pub candidate: CandidateId,
    /// 0 for the first build, incremented on every transient-rejection rebuild.
    pub attempt: u32,
    pub txs: Vec<SignedTx>,
    pub target_block: u64,
    pub reservations: Vec<Reservation>,
    pub gas_cost: u128,
    pub max_fee_per_gas: u128,
    pub created_at_ms: u128,
}

impl Bundle {
    pub fn raw_txs(&self) -> Vec<Vec<u8>> {
        self.txs.iter().map(|t| t.raw.clone()).collect()
    }

    /// Account that funds gas for the risk checks: the first signer.
    pub fn lead_account(&self) -> Option<Address> {
        self.txs.first().map(|t| t.account)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Included { block: u64 },
    NotIncluded,
    Rejected,
    Expired,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Included { .. } => "included",
            SubmissionStatus::NotIncluded => "not_included",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Expired => "expired",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal submission transition {from} -> {to} for {bundle}")]
pub struct TransitionError {
    pub bundle: BundleId,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub bundle: BundleId,
    pub relay: String,
    pub submitted_at_ms: u128,
    pub status: SubmissionStatus,
    pub detail: Option<String>,
}

impl SubmissionRecord {
    pub fn pending(bundle: BundleId, relay: impl Into<String>) -> Self {
        Self {
            bundle,
            relay: relay.into(),
            submitted_at_ms: unix_millis(),
            status: SubmissionStatus::Pending,
            detail: None,
        }
    }

    /// Moves a pending record to a terminal status. Leaving `Pending` happens once.
    pub fn transition(&mut self, to: SubmissionStatus, detail: Option<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(TransitionError { bundle: self.bundle, from: self.status.label(), to: to.label() });
        }
        self.status = to;
        self.detail = detail;
        Ok(())
    }
}
