//! In-process collaborators for tests and the `simulate` dry run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::{Address, H256};
use parking_lot::Mutex;

use crate::error::{NodeError, RelayError};
use crate::executor::{Relay, RelayAck};
use crate::node::{FeeQuote, ForkOutcome, NodeClient, ReceiptInfo};
use crate::signer::{Keyring, LocalKeySigner, Signer};
use crate::sim::execute_locally;
use crate::tx::tx_hash;
use crate::types::{Step, VenueId, VenueState};

/// Well-known Anvil development keys (accounts 0 and 1). Never fund them on a real chain.
pub const DEV_KEYS: [&str; 2] = [
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
];

/// Keyring over [`DEV_KEYS`]; returns it with the (treasury, executor) addresses.
pub fn dev_keyring() -> (Keyring, Address, Address) {
    let mut ring = Keyring::new();
    let mut addrs = Vec::with_capacity(DEV_KEYS.len());
    for key in DEV_KEYS {
        match LocalKeySigner::from_secret(key) {
            Ok(signer) => {
                addrs.push(signer.address());
                ring.insert(Arc::new(signer));
            }
            Err(e) => tracing::error!(error = %e, "dev key rejected"),
        }
    }
    let treasury = addrs.first().copied().unwrap_or_default();
    let executor = addrs.get(1).copied().unwrap_or_default();
    (ring, treasury, executor)
}

/// Two same-pair venues priced about 2% apart, enough for a round trip of
/// 1 token0 to clear fees and gas.
pub fn demo_venues() -> Vec<VenueState> {
    let venue = |id: u32, reserve1: u128| VenueState {
        id: VenueId(id),
        address: Address::from_low_u64_be(0x1000 + u64::from(id)),
        token0: Address::from_low_u64_be(0xaa),
        token1: Address::from_low_u64_be(0xbb),
        reserve0: 1_000 * 10u128.pow(18),
        reserve1,
        fee_bps: 30,
        height: 0,
    };
    vec![venue(1, 1_000 * 10u128.pow(18)), venue(2, 1_020 * 10u128.pow(18))]
}

/// Node backed by in-memory constant-product venues.
pub struct MockNode {
    head: AtomicU64,
    venues: Mutex<HashMap<VenueId, VenueState>>,
    nonces: Mutex<HashMap<Address, u64>>,
    receipts: Mutex<HashMap<H256, ReceiptInfo>>,
    fees: FeeQuote,
    latency: Mutex<Duration>,
    failures: AtomicUsize,
}

impl MockNode {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            venues: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            fees: FeeQuote { base_fee: 1_000_000_000, priority_fee: 1_000_000_000 },
            latency: Mutex::new(Duration::ZERO),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, height: u64) {
        self.head.fetch_max(height, Ordering::AcqRel);
    }

    pub fn advance_head(&self) -> u64 {
        self.head.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_venue(&self, venue: VenueState) {
        self.venues.lock().insert(venue.id, venue);
    }

    pub fn venues(&self) -> Vec<VenueState> {
        let mut all: Vec<_> = self.venues.lock().values().cloned().collect();
        all.sort_by_key(|v| v.id);
        all
    }

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.nonces.lock().insert(account, nonce);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next `n` calls fail with a connectivity error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::Release);
    }

    /// Marks `tx` as mined in `block` and moves the head there.
    pub fn include(&self, tx: H256, block: u64, reverted: bool) {
        self.receipts.lock().insert(tx, ReceiptInfo { block, reverted, gas_used: 21_000 });
        self.set_head(block);
    }

    async fn gate(&self) -> Result<(), NodeError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(NodeError::Connectivity("mock node unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn head(&self) -> Result<u64, NodeError> {
        self.gate().await?;
        Ok(self.head.load(Ordering::Acquire))
    }

    async fn fee_quote(&self) -> Result<FeeQuote, NodeError> {
        self.gate().await?;
        Ok(self.fees)
    }

    async fn venue_at(&self, venue: VenueId, height: u64) -> Result<VenueState, NodeError> {
        self.gate().await?;
        let mut state = self.venues.lock().get(&venue).cloned().ok_or(NodeError::UnknownVenue(venue))?;
        state.height = height;
        Ok(state)
    }

    async fn execute_on_fork(&self, _height: u64, steps: &[Step]) -> Result<ForkOutcome, NodeError> {
        self.gate().await?;
        let venues = self.venues.lock().clone();
        Ok(execute_locally(steps, &venues))
    }

    async fn receipt(&self, tx: H256) -> Result<Option<ReceiptInfo>, NodeError> {
        self.gate().await?;
        Ok(self.receipts.lock().get(&tx).copied())
    }

    async fn nonce_at(&self, account: Address, _height: u64) -> Result<u64, NodeError> {
        self.gate().await?;
        Ok(self.nonces.lock().get(&account).copied().unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Accept,
    /// Accept and have the linked node mine the bundle in its target block.
    AcceptAndInclude,
    Transient,
    Reject,
    /// Never answers.
    Hang,
}

/// Relay that replays a script of responses, then falls back to a default.
pub struct MockRelay {
    id: String,
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    node: Option<Arc<MockNode>>,
    submissions: Mutex<Vec<(Vec<Vec<u8>>, u64)>>,
}

impl MockRelay {
    pub fn new(id: impl Into<String>, fallback: MockResponse) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            node: None,
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, script: impl IntoIterator<Item = MockResponse>) -> Self {
        self.script.lock().extend(script);
        self
    }

    pub fn linked_to(mut self, node: Arc<MockNode>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn submissions(&self) -> Vec<(Vec<Vec<u8>>, u64)> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl Relay for MockRelay {
    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(&self, txs: &[Vec<u8>], target_block: u64) -> Result<RelayAck, RelayError> {
        self.submissions.lock().push((txs.to_vec(), target_block));
        let response = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        let ack = RelayAck { bundle_hash: txs.first().map(|raw| format!("{:?}", tx_hash(raw))) };
        match response {
            MockResponse::Accept => Ok(ack),
            MockResponse::AcceptAndInclude => {
                if let (Some(node), Some(first)) = (&self.node, txs.first()) {
                    node.include(tx_hash(first), target_block, false);
                }
                Ok(ack)
            }
            MockResponse::Transient => Err(RelayError::Transient("mock relay overloaded".to_string())),
            MockResponse::Reject => Err(RelayError::Rejected("mock relay refused bundle".to_string())),
            MockResponse::Hang => {
                std::future::pending::<()>().await;
                Err(RelayError::Transient("unreachable".to_string()))
            }
        }
    }
}
