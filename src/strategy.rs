use std::sync::Arc;

use crate::config::{AccountsConfig, StrategyConfig};
use crate::types::{Action, CandidateDraft, Hop, Step, VenueId, VenueState};

/// A pluggable opportunity rule evaluated by the scanner.
pub trait Strategy: Send + Sync {
    fn tag(&self) -> &str;

    /// Drafts for the current view. `touched` are the venues that changed since
    /// the last pass; strategies may ignore opportunities not involving them.
    fn evaluate(&self, view: &[Arc<VenueState>], touched: &[VenueId]) -> Vec<CandidateDraft>;
}

/// Two-venue round trip on the same pair: token0 -> token1 on the cheaper
/// venue, token1 -> token0 on the dearer one.
pub struct CrossVenueArb {
    params: StrategyConfig,
    treasury: ethers_core::types::Address,
    executor: ethers_core::types::Address,
    router: ethers_core::types::Address,
}

impl CrossVenueArb {
    pub const TAG: &'static str = "cross-venue-arb";

    pub fn new(params: StrategyConfig, accounts: &AccountsConfig) -> Self {
        Self { params, treasury: accounts.treasury, executor: accounts.executor, router: accounts.router }
    }

    /// Round-trip output of `size` token0 through `buy` then `sell`.
    fn round_trip(&self, buy: &VenueState, sell: &VenueState) -> u128 {
        let mid = buy.amount_out(self.params.trade_size_wei, true);
        sell.amount_out(mid, false)
    }

    fn draft(&self, buy: &VenueState, sell: &VenueState, out: u128) -> CandidateDraft {
        let size = self.params.trade_size_wei;
        let min_out = out - out / 10_000 * u128::from(self.params.slippage_bps);
        let hops = vec![
            Hop { venue: buy.id, pool: buy.address, zero_for_one: true },
            Hop { venue: sell.id, pool: sell.address, zero_for_one: false },
        ];
        CandidateDraft {
            strategy: Self::TAG.to_string(),
            venues: vec![buy.id, sell.id],
            steps: vec![
                Step {
                    account: self.treasury,
                    action: Action::Transfer { to: self.executor, amount: size },
                    gas_limit: self.params.funding_gas_limit,
                },
                Step {
                    account: self.executor,
                    action: Action::Route { router: self.router, hops, amount_in: size, min_out },
                    gas_limit: self.params.route_gas_limit,
                },
            ],
            assumed: vec![buy.quote(), sell.quote()],
            gross_profit: out as i128 - size as i128,
        }
    }
}

impl Strategy for CrossVenueArb {
    fn tag(&self) -> &str {
        Self::TAG
    }

    fn evaluate(&self, view: &[Arc<VenueState>], touched: &[VenueId]) -> Vec<CandidateDraft> {
        let size = self.params.trade_size_wei;
        let mut drafts = Vec::new();
        for (i, a) in view.iter().enumerate() {
            for b in &view[i + 1..] {
                if !a.same_pair(b) || !(touched.contains(&a.id) || touched.contains(&b.id)) {
                    continue;
                }
                let forward = self.round_trip(a, b);
                let backward = self.round_trip(b, a);
                let (buy, sell, out) = if forward >= backward { (a, b, forward) } else { (b, a, backward) };
                if out <= size || out - size < self.params.min_gross_profit_wei {
                    continue;
                }
                drafts.push(self.draft(buy, sell, out));
            }
        }
        drafts
    }
}
