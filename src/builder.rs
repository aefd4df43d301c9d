use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::Address;
use thiserror::Error;

use crate::cache::ChainStateCache;
use crate::error::{CoreError, NodeError, NonceError, SignerError};
use crate::ledger::Ledger;
use crate::node::NodeClient;
use crate::observe::{CoreEvent, Observer};
use crate::retry::retry_async;
use crate::risk::{DenyReason, RiskDecision, RiskGuard};
use crate::signer::Keyring;
use crate::tx::{step_tx, tx_hash};
use crate::types::{Bundle, Reservation, ResultId, SignedTx, Verdict, unix_millis};

/// Why a simulation result did not become a bundle.
#[derive(Error, Debug)]
pub enum BuildRejection {
    #[error("result {result} is not buildable ({verdict})")]
    NotValid { result: ResultId, verdict: Verdict },

    #[error("net profit {net_profit} does not clear margin {margin}")]
    BelowMargin { net_profit: i128, margin: u128 },

    #[error("candidate expired (last valid {last_valid}, head {head})")]
    Expired { last_valid: u64, head: u64 },

    #[error("risk guard denied: {0}")]
    RiskDenied(DenyReason),

    #[error("nonce reservation failed: {0}")]
    Reservation(#[from] NonceError),

    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl BuildRejection {
    /// Expected outcomes, as opposed to technical failures.
    pub fn is_governance(&self) -> bool {
        matches!(
            self,
            BuildRejection::NotValid { .. }
                | BuildRejection::BelowMargin { .. }
                | BuildRejection::Expired { .. }
                | BuildRejection::RiskDenied(_)
        )
    }
}

/// Nonces taken for one bundle. Dropping the set without `commit` releases
/// every reservation, most recent first.
pub struct ReservationSet {
    cache: Arc<ChainStateCache>,
    held: Vec<Reservation>,
}

impl ReservationSet {
    pub fn new(cache: Arc<ChainStateCache>) -> Self {
        Self { cache, held: Vec::new() }
    }

    pub fn reserve(&mut self, account: Address) -> Result<u64, NonceError> {
        let nonce = self.cache.reserve_nonce(account)?;
        self.held.push(Reservation { account, nonce });
        Ok(nonce)
    }

    pub fn held(&self) -> &[Reservation] {
        &self.held
    }

    /// Hands the reservations over to the bundle; they are no longer released on drop.
    pub fn commit(mut self) -> Vec<Reservation> {
        std::mem::take(&mut self.held)
    }
}

impl Drop for ReservationSet {
    fn drop(&mut self) {
        while let Some(r) = self.held.pop() {
            if let Err(e) = self.cache.release_nonce(r.account, r.nonce) {
                tracing::error!(account = ?r.account, nonce = r.nonce, error = %e, "failed to release reservation");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub min_profit_margin: u128,
    pub target_offset: u64,
    pub chain_id: u64,
    pub retry_attempts: usize,
    pub retry_backoff: Duration,
}

/// Turns valid simulation results into signed bundles.
pub struct BundleBuilder {
    cache: Arc<ChainStateCache>,
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    keyring: Keyring,
    risk: Arc<RiskGuard>,
    observer: Arc<dyn Observer>,
    settings: BuilderSettings,
}

impl BundleBuilder {
    pub fn new(
        cache: Arc<ChainStateCache>,
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        keyring: Keyring,
        risk: Arc<RiskGuard>,
        observer: Arc<dyn Observer>,
        settings: BuilderSettings,
    ) -> Self {
        Self { cache, ledger, node, keyring, risk, observer, settings }
    }

    pub fn cache(&self) -> &Arc<ChainStateCache> {
        &self.cache
    }

    pub fn risk(&self) -> &Arc<RiskGuard> {
        &self.risk
    }

    /// Builds attempt `attempt` for `result`. Every call reserves fresh nonces and
    /// re-quotes fees, so a rebuild never reuses an earlier signed artifact.
    pub async fn build(&self, result: ResultId, attempt: u32) -> Result<Arc<Bundle>, BuildRejection> {
        match self.try_build(result, attempt).await {
            Ok(bundle) => {
                tracing::info!(
                    bundle = %bundle.id,
                    %result,
                    attempt,
                    txs = bundle.txs.len(),
                    target_block = bundle.target_block,
                    gas_cost = %bundle.gas_cost,
                    "bundle built"
                );
                self.observer.emit(CoreEvent::BundleBuilt {
                    bundle: bundle.id,
                    result,
                    attempt,
                    txs: bundle.txs.len(),
                    target_block: bundle.target_block,
                });
                Ok(bundle)
            }
            Err(rejection) => {
                if rejection.is_governance() {
                    tracing::info!(%result, attempt, reason = %rejection, "bundle not built");
                } else {
                    tracing::warn!(%result, attempt, error = %rejection, "bundle build failed");
                }
                if let BuildRejection::Reservation(NonceError::InvariantViolation { account, detail }) = &rejection {
                    self.observer.emit(CoreEvent::FatalAlert { account: *account, detail: detail.clone() });
                }
                self.observer.emit(CoreEvent::BundleRejected { result, reason: rejection.to_string() });
                Err(rejection)
            }
        }
    }

    async fn try_build(&self, result_id: ResultId, attempt: u32) -> Result<Arc<Bundle>, BuildRejection> {
        let result = self.ledger.result(result_id)?;
        if result.verdict != Verdict::Valid {
            return Err(BuildRejection::NotValid { result: result_id, verdict: result.verdict.clone() });
        }
        let margin = self.settings.min_profit_margin;
        if result.net_profit <= i128::try_from(margin).unwrap_or(i128::MAX) {
            return Err(BuildRejection::BelowMargin { net_profit: result.net_profit, margin });
        }
        let candidate = self.ledger.candidate(result.candidate)?;
        let head = self.cache.head();
        if candidate.is_expired(head) {
            return Err(BuildRejection::Expired { last_valid: candidate.last_valid_height(), head });
        }

        let node = &self.node;
        let fees = retry_async(
            |_| node.fee_quote(),
            NodeError::is_retryable,
            self.settings.retry_attempts,
            self.settings.retry_backoff,
        )
        .await
        .map_err(CoreError::Degraded)?;
        let gas_cost = u128::from(result.gas_used).saturating_mul(fees.effective_price());
        let lead = candidate.steps[0].account;
        if let RiskDecision::Deny(reason) = self.risk.check(gas_cost, lead) {
            self.observer.emit(CoreEvent::RiskDenied { account: lead, stage: "build", reason: reason.to_string() });
            return Err(BuildRejection::RiskDenied(reason));
        }

        let mut reservations = ReservationSet::new(Arc::clone(&self.cache));
        for step in &candidate.steps {
            reservations.reserve(step.account)?;
        }

        // nonce section is closed; signing may await
        let mut txs = Vec::with_capacity(candidate.steps.len());
        for (step, r) in candidate.steps.iter().zip(reservations.held().to_vec()) {
            let unsigned = step_tx(step, r.nonce, &fees, self.settings.chain_id);
            let raw = self.keyring.sign(step.account, &unsigned).await?;
            txs.push(SignedTx { account: step.account, nonce: r.nonce, hash: tx_hash(&raw), raw });
        }

        let bundle = Bundle {
            id: self.ledger.next_bundle_id(),
            result: result_id,
            candidate: candidate.id,
            attempt,
            txs,
            target_block: head + self.settings.target_offset,
            reservations: reservations.commit(),
            gas_cost,
            max_fee_per_gas: fees.max_fee(),
            created_at_ms: unix_millis(),
        };
        Ok(self.ledger.insert_bundle(bundle))
    }
}
