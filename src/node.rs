use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{
    Address, BlockId, BlockNumber, Bytes, H256, TransactionRequest, U256,
    transaction::eip2718::TypedTransaction,
};
use ethers_providers::{Http, HttpClientError, Middleware, Provider, ProviderError};

use crate::config::VenueConfig;
use crate::error::NodeError;
use crate::types::{Step, VenueId, VenueState};

/// `getReserves()` selector of a constant-product pair.
const GET_RESERVES: [u8; 4] = [0x09, 0x02, 0xf1, 0xac];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub base_fee: u128,
    pub priority_fee: u128,
}

impl FeeQuote {
    /// EIP-1559 fee cap that survives one full base-fee doubling.
    pub fn max_fee(&self) -> u128 {
        self.base_fee.saturating_mul(2).saturating_add(self.priority_fee)
    }

    pub fn effective_price(&self) -> u128 {
        self.base_fee.saturating_add(self.priority_fee)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub gas_used: u64,
    pub revert: Option<String>,
}

/// Result of executing a step sequence on a throwaway fork.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkOutcome {
    pub steps: Vec<StepOutcome>,
    /// Change of the searcher's combined balance, gas excluded.
    pub balance_delta: i128,
}

impl ForkOutcome {
    pub fn gas_used(&self) -> u64 {
        self.steps.iter().map(|s| s.gas_used).sum()
    }

    pub fn first_revert(&self) -> Option<(usize, &str)> {
        self.steps
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.revert.as_deref().map(|r| (i, r)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block: u64,
    pub reverted: bool,
    pub gas_used: u64,
}

/// Everything the core needs from a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn head(&self) -> Result<u64, NodeError>;

    async fn fee_quote(&self) -> Result<FeeQuote, NodeError>;

    /// Venue reserves as of `height`.
    async fn venue_at(&self, venue: VenueId, height: u64) -> Result<VenueState, NodeError>;

    /// Executes `steps` in order on a fork pinned at `height`; the fork is discarded afterwards.
    async fn execute_on_fork(&self, height: u64, steps: &[Step]) -> Result<ForkOutcome, NodeError>;

    async fn receipt(&self, tx: H256) -> Result<Option<ReceiptInfo>, NodeError>;

    /// Confirmed transaction count of `account` at `height`.
    async fn nonce_at(&self, account: Address, height: u64) -> Result<u64, NodeError>;
}

fn classify(err: ProviderError) -> NodeError {
    match &err {
        ProviderError::JsonRpcClientError(inner) => match inner.downcast_ref::<HttpClientError>() {
            Some(HttpClientError::JsonRpcError(rpc)) => NodeError::Rpc(rpc.to_string()),
            _ => NodeError::Connectivity(err.to_string()),
        },
        ProviderError::HTTPError(_) => NodeError::Connectivity(err.to_string()),
        _ => NodeError::Rpc(err.to_string()),
    }
}

/// Node adapter over `ethers-providers` HTTP.
///
/// Reads go to `rpc_url`; fork execution needs an Anvil-style node at
/// `fork_url` (`evm_snapshot`, `anvil_impersonateAccount`, `evm_revert`).
pub struct EthersNode {
    provider: Provider<Http>,
    fork: Arc<ForkRunner>,
    venues: HashMap<VenueId, VenueConfig>,
    priority_fee: u128,
}

impl EthersNode {
    pub fn new(rpc_url: &str, fork_url: &str, venues: &[VenueConfig], priority_fee: u128) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .context("invalid rpc url")?
            .interval(Duration::from_millis(200));
        let fork = Provider::<Http>::try_from(fork_url)
            .context("invalid fork rpc url")?
            .interval(Duration::from_millis(50));
        Ok(Self {
            provider,
            fork: Arc::new(ForkRunner {
                provider: fork,
                lock: tokio::sync::Mutex::new(()),
                receipt_timeout: Duration::from_secs(10),
            }),
            venues: venues.iter().map(|v| (VenueId(v.id), v.clone())).collect(),
            priority_fee,
        })
    }
}

/// Owns the shared fork. One execution at a time: snapshot, run, revert.
struct ForkRunner {
    provider: Provider<Http>,
    lock: tokio::sync::Mutex<()>,
    receipt_timeout: Duration,
}

impl ForkRunner {
    async fn execute(&self, height: u64, steps: &[Step]) -> Result<ForkOutcome, NodeError> {
        let _exclusive = self.lock.lock().await;
        let fork_head = self.provider.get_block_number().await.map_err(classify)?.as_u64();
        if fork_head != height {
            tracing::debug!(fork_head, pinned = height, "fork node head differs from pinned height");
        }
        let snap_id: serde_json::Value = self.provider.request("evm_snapshot", ()).await.map_err(classify)?;
        let outcome = self.run_steps(steps).await;
        // always restore the fork, even when execution failed midway
        let reverted: Result<bool, _> = self.provider.request("evm_revert", [snap_id]).await;
        if let Err(e) = reverted {
            tracing::warn!(error = %e, "failed to revert fork snapshot");
        }
        outcome
    }

    async fn balances(&self, accounts: &[Address]) -> Result<i128, NodeError> {
        let mut total: i128 = 0;
        for account in accounts {
            let balance = self.provider.get_balance(*account, None).await.map_err(classify)?;
            total = total.saturating_add(i128::try_from(balance.as_u128()).unwrap_or(i128::MAX));
        }
        Ok(total)
    }

    async fn run_steps(&self, steps: &[Step]) -> Result<ForkOutcome, NodeError> {
        let mut accounts: Vec<Address> = steps.iter().map(|s| s.account).collect();
        accounts.sort_unstable();
        accounts.dedup();
        let before = self.balances(&accounts).await?;

        let mut outcome = ForkOutcome::default();
        let mut gas_paid: i128 = 0;
        for (i, step) in steps.iter().enumerate() {
            let _: () = self
                .provider
                .request("anvil_impersonateAccount", [step.account])
                .await
                .map_err(classify)?;
            let req = TransactionRequest::new()
                .from(step.account)
                .to(step.action.target())
                .value(U256::from(step.action.value()))
                .data(step.action.calldata())
                .gas(step.gas_limit);
            let pending = match self.provider.send_transaction(TypedTransaction::Legacy(req), None).await {
                Ok(p) => p,
                Err(e) => {
                    // eth_sendTransaction fails up front when the call reverts during estimation
                    let mapped = classify(e);
                    if mapped.is_retryable() {
                        return Err(mapped);
                    }
                    outcome.steps.push(StepOutcome { gas_used: 0, revert: Some(mapped.to_string()) });
                    tracing::debug!(step = i, "fork step rejected by node");
                    break;
                }
            };
            let receipt = tokio::time::timeout(self.receipt_timeout, pending)
                .await
                .map_err(|_| NodeError::Connectivity("timed out waiting for fork receipt".to_string()))?
                .map_err(classify)?
                .ok_or_else(|| NodeError::Rpc("fork dropped transaction".to_string()))?;
            let gas_used = receipt.gas_used.unwrap_or_default().as_u64();
            let price = receipt.effective_gas_price.unwrap_or_default().as_u128();
            gas_paid = gas_paid.saturating_add((gas_used as u128 * price) as i128);
            let reverted = receipt.status.map(|s| s.as_u64() == 0).unwrap_or(false);
            outcome.steps.push(StepOutcome {
                gas_used,
                revert: reverted.then(|| "execution reverted".to_string()),
            });
            if reverted {
                break;
            }
        }

        let after = self.balances(&accounts).await?;
        outcome.balance_delta = after - before + gas_paid;
        Ok(outcome)
    }
}

#[async_trait]
impl NodeClient for EthersNode {
    async fn head(&self) -> Result<u64, NodeError> {
        self.provider.get_block_number().await.map(|bn| bn.as_u64()).map_err(classify)
    }

    async fn fee_quote(&self) -> Result<FeeQuote, NodeError> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(classify)?
            .ok_or_else(|| NodeError::Rpc("latest block missing".to_string()))?;
        let base_fee = block.base_fee_per_gas.unwrap_or_default().as_u128();
        Ok(FeeQuote { base_fee, priority_fee: self.priority_fee })
    }

    async fn venue_at(&self, venue: VenueId, height: u64) -> Result<VenueState, NodeError> {
        let cfg = self.venues.get(&venue).ok_or(NodeError::UnknownVenue(venue))?;
        let call = TransactionRequest::new().to(cfg.address).data(Bytes::from(GET_RESERVES.to_vec()));
        let at = BlockId::Number(BlockNumber::Number(height.into()));
        let raw = self
            .provider
            .call(&TypedTransaction::Legacy(call), Some(at))
            .await
            .map_err(classify)?;
        let decoded = abi::decode(&[ParamType::Uint(112), ParamType::Uint(112), ParamType::Uint(32)], &raw)
            .map_err(|e| NodeError::Rpc(format!("getReserves decode failed for {venue}: {e}")))?;
        let reserve = |t: &Token| match t {
            Token::Uint(v) => Ok(v.as_u128()),
            _ => Err(NodeError::Rpc(format!("unexpected getReserves output for {venue}"))),
        };
        Ok(VenueState {
            id: venue,
            address: cfg.address,
            token0: cfg.token0,
            token1: cfg.token1,
            reserve0: reserve(&decoded[0])?,
            reserve1: reserve(&decoded[1])?,
            fee_bps: cfg.fee_bps,
            height,
        })
    }

    async fn execute_on_fork(&self, height: u64, steps: &[Step]) -> Result<ForkOutcome, NodeError> {
        // detached: a caller's deadline must not strand the fork between snapshot and revert
        let runner = Arc::clone(&self.fork);
        let steps = steps.to_vec();
        tokio::spawn(async move { runner.execute(height, &steps).await })
            .await
            .map_err(|e| NodeError::Rpc(format!("fork execution task failed: {e}")))?
    }

    async fn receipt(&self, tx: H256) -> Result<Option<ReceiptInfo>, NodeError> {
        let receipt = self.provider.get_transaction_receipt(tx).await.map_err(classify)?;
        Ok(receipt.and_then(|r| {
            Some(ReceiptInfo {
                block: r.block_number?.as_u64(),
                reverted: r.status.map(|s| s.as_u64() == 0).unwrap_or(false),
                gas_used: r.gas_used.unwrap_or_default().as_u64(),
            })
        }))
    }

    async fn nonce_at(&self, account: Address, height: u64) -> Result<u64, NodeError> {
        let at = BlockId::Number(BlockNumber::Number(height.into()));
        self.provider
            .get_transaction_count(account, Some(at))
            .await
            .map(|n| n.as_u64())
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    #[test]
    fn fee_cap_doubles_base_fee() {
        let q = FeeQuote { base_fee: 10, priority_fee: 2 };
        assert_eq!(q.max_fee(), 22);
        assert_eq!(q.effective_price(), 12);
    }

    #[test]
    fn first_revert_reports_step_index() {
        let outcome = ForkOutcome {
            steps: vec![
                StepOutcome { gas_used: 21_000, revert: None },
                StepOutcome { gas_used: 40_000, revert: Some("insufficient output".into()) },
            ],
            balance_delta: 0,
        };
        assert_eq!(outcome.first_revert(), Some((1, "insufficient output")));
        assert_eq!(outcome.gas_used(), 61_000);
    }

    #[tokio::test]
    async fn unknown_venue_is_reported_without_rpc() {
        let node = EthersNode::new("http://127.0.0.1:1", "http://127.0.0.1:1", &[], 1).unwrap();
        assert_eq!(node.venue_at(VenueId(4), 1).await.unwrap_err(), NodeError::UnknownVenue(VenueId(4)));
    }

    #[tokio::test]
    async fn reserves_are_read_through_eth_call() {
        let server = httpmock::MockServer::start();
        let word = |v: u64| format!("{:064x}", v);
        let result = format!("0x{}{}{}", word(1_000), word(2_000), word(7));
        let m = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/").body_contains("eth_call");
            then.status(200)
                .header("content-type", "application/json")
                .body(format!(r#"{{"jsonrpc":"2.0","id":1,"result":"{result}"}}"#));
        });
        let cfg = VenueConfig {
            id: 1,
            address: Address::repeat_byte(1),
            token0: Address::repeat_byte(2),
            token1: Address::repeat_byte(3),
            fee_bps: 30,
        };
        let node = EthersNode::new(&server.url("/"), &server.url("/"), &[cfg], 1).unwrap();
        let v = node.venue_at(VenueId(1), 12).await.unwrap();
        assert_eq!((v.reserve0, v.reserve1, v.height), (1_000, 2_000, 12));
        m.assert();
    }

    #[tokio::test]
    async fn transport_failures_are_retryable() {
        let node = EthersNode::new("http://127.0.0.1:1", "http://127.0.0.1:1", &[], 1).unwrap();
        let err = node.head().await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    fn rpc_result<'a>(
        server: &'a httpmock::MockServer,
        method: &str,
        result: &str,
        delay: Duration,
    ) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/").body_contains(method);
            then.status(200)
                .header("content-type", "application/json")
                .delay(delay)
                .body(format!(r#"{{"jsonrpc":"2.0","id":1,"result":{result}}}"#));
        })
    }

    fn transfer_step() -> Step {
        Step {
            account: Address::repeat_byte(1),
            action: Action::Transfer { to: Address::repeat_byte(2), amount: 1 },
            gas_limit: 21_000,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_fork_run_still_reverts() {
        let server = httpmock::MockServer::start();
        rpc_result(&server, "eth_blockNumber", r#""0x5""#, Duration::ZERO);
        let snapshot = rpc_result(&server, "evm_snapshot", r#""0x1""#, Duration::ZERO);
        rpc_result(&server, "eth_getBalance", r#""0x0""#, Duration::from_millis(300));
        let revert = rpc_result(&server, "evm_revert", "true", Duration::ZERO);

        let node = EthersNode::new(&server.url("/"), &server.url("/"), &[], 1).unwrap();
        let steps = [transfer_step()];
        let abandoned = tokio::time::timeout(Duration::from_millis(50), node.execute_on_fork(5, &steps)).await;
        assert!(abandoned.is_err());
        assert_eq!(revert.hits_async().await, 0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while revert.hits_async().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "fork snapshot never reverted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(snapshot.hits_async().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fork_runs_do_not_overlap() {
        let server = httpmock::MockServer::start();
        rpc_result(&server, "eth_blockNumber", r#""0x5""#, Duration::ZERO);
        let snapshot = rpc_result(&server, "evm_snapshot", r#""0x1""#, Duration::ZERO);
        rpc_result(&server, "eth_getBalance", r#""0x0""#, Duration::from_millis(100));
        let revert = rpc_result(&server, "evm_revert", "true", Duration::ZERO);

        let node = EthersNode::new(&server.url("/"), &server.url("/"), &[], 1).unwrap();
        let steps = [transfer_step()];
        let started = std::time::Instant::now();
        // impersonation is not mocked, so each run fails after one balance read and reverts
        let (a, b) = tokio::join!(node.execute_on_fork(5, &steps), node.execute_on_fork(5, &steps));
        assert!(a.is_err() && b.is_err());
        assert!(started.elapsed() >= Duration::from_millis(200), "{:?}", started.elapsed());
        assert_eq!(snapshot.hits_async().await, 2);
        assert_eq!(revert.hits_async().await, 2);
    }
}
