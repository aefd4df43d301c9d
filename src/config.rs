use std::path::Path;
use std::time::Duration;

use ethers_core::types::Address;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub relays: Vec<RelayConfig>,
    pub scanner: ScannerConfig,
    pub simulation: SimulationConfig,
    pub builder: BuilderConfig,
    pub submission: SubmissionConfig,
    pub risk: RiskConfig,
    pub accounts: AccountsConfig,
    pub venues: Vec<VenueConfig>,
    pub strategy: StrategyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            relays: vec![],
            scanner: ScannerConfig::default(),
            simulation: SimulationConfig::default(),
            builder: BuilderConfig::default(),
            submission: SubmissionConfig::default(),
            risk: RiskConfig::default(),
            accounts: AccountsConfig::default(),
            venues: vec![],
            strategy: StrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_urls: Vec<String>,
    pub ws_urls: Vec<String>,
    /// Anvil-style node used for fork execution; falls back to the first rpc url.
    pub fork_rpc_url: Option<String>,
    pub chain_id: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_urls: vec!["http://localhost:8545".to_string()],
            ws_urls: vec![],
            fork_rpc_url: None,
            chain_id: 1,
            poll_interval_ms: 300,
            request_timeout_ms: 2_000,
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub validity_window_blocks: u64,
    pub dedup_capacity: usize,
    pub channel_capacity: usize,
    pub max_concurrent_candidates: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            validity_window_blocks: 2,
            dedup_capacity: 4_096,
            channel_capacity: 2_048,
            max_concurrent_candidates: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub stale_tolerance_bps: u64,
    pub deadline_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { stale_tolerance_bps: 50, deadline_ms: 1_500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Minimum net profit a simulation must clear before a bundle is built.
    pub profit_threshold_wei: u128,
    pub priority_fee_wei: u128,
    /// Blocks ahead of the current head the bundle targets.
    pub target_offset: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            profit_threshold_wei: 1_000_000_000_000_000, // example: 0.001 ETH
            priority_fee_wei: 1_000_000_000,
            target_offset: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_retries: u32,
    pub relay_deadline_ms: u64,
    pub inclusion_deadline_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self { max_retries: 2, relay_deadline_ms: 2_000, inclusion_deadline_ms: 30_000, poll_interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub gas_spend_ceiling_wei: u128,
    pub spend_window_secs: u64,
    pub max_cumulative_loss_wei: u128,
    pub max_open_positions: usize,
    pub loss_streak_kill: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            gas_spend_ceiling_wei: 500_000_000_000_000_000,
            spend_window_secs: 3_600,
            max_cumulative_loss_wei: 200_000_000_000_000_000,
            max_open_positions: 4,
            loss_streak_kill: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Finances the executor ahead of the trade.
    pub treasury: Address,
    /// Sends the routed swap.
    pub executor: Address,
    pub router: Address,
    pub max_in_flight: usize,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            treasury: Address::repeat_byte(0x11),
            executor: Address::repeat_byte(0x22),
            router: Address::repeat_byte(0x33),
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub id: u32,
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u32,
}

fn default_fee_bps() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub trade_size_wei: u128,
    pub min_gross_profit_wei: u128,
    pub slippage_bps: u32,
    pub funding_gas_limit: u64,
    pub route_gas_limit: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trade_size_wei: 1_000_000_000_000_000_000,
            min_gross_profit_wei: 1_000_000_000_000_000,
            slippage_bps: 30,
            funding_gas_limit: 21_000,
            route_gas_limit: 250_000,
        }
    }
}

impl Config {
    /// Loads an optional TOML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|source| ConfigError::Read { path: p.display().to_string(), source })?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RPC_URL") {
            self.node.rpc_urls = vec![url];
        }
        if let Ok(url) = std::env::var("WS_URL") {
            self.node.ws_urls = vec![url];
        }
        if let Ok(url) = std::env::var("ANVIL_RPC_URL") {
            self.node.fork_rpc_url = Some(url);
        }
        if let Ok(url) = std::env::var("FLASHBOTS_RELAY_URL")
            && !self.relays.iter().any(|r| r.url == url)
        {
            self.relays.push(RelayConfig { id: "flashbots".to_string(), url });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, message: &str) -> ConfigError {
            ConfigError::Invalid { field: field.to_string(), message: message.to_string() }
        }
        if self.scanner.validity_window_blocks == 0 {
            return Err(invalid("scanner.validity_window_blocks", "must be at least 1"));
        }
        if self.scanner.max_concurrent_candidates == 0 {
            return Err(invalid("scanner.max_concurrent_candidates", "must be at least 1"));
        }
        if self.simulation.stale_tolerance_bps >= 10_000 {
            return Err(invalid("simulation.stale_tolerance_bps", "must be below 10000"));
        }
        if self.builder.target_offset == 0 {
            return Err(invalid("builder.target_offset", "must target a future block"));
        }
        if self.accounts.treasury == self.accounts.executor {
            return Err(invalid("accounts", "treasury and executor must differ"));
        }
        if self.accounts.max_in_flight == 0 {
            return Err(invalid("accounts.max_in_flight", "must be at least 1"));
        }
        if self.strategy.slippage_bps >= 10_000 {
            return Err(invalid("strategy.slippage_bps", "must be below 10000"));
        }
        let mut ids: Vec<u32> = self.venues.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.venues.len() {
            return Err(invalid("venues", "venue ids must be unique"));
        }
        if self.venues.iter().any(|v| v.fee_bps >= 10_000) {
            return Err(invalid("venues.fee_bps", "must be below 10000"));
        }
        let mut relay_ids: Vec<&str> = self.relays.iter().map(|r| r.id.as_str()).collect();
        relay_ids.sort_unstable();
        relay_ids.dedup();
        if relay_ids.len() != self.relays.len() {
            return Err(invalid("relays", "relay ids must be unique"));
        }
        Ok(())
    }

    pub fn simulation_deadline(&self) -> Duration {
        Duration::from_millis(self.simulation.deadline_ms)
    }

    pub fn relay_deadline(&self) -> Duration {
        Duration::from_millis(self.submission.relay_deadline_ms)
    }

    pub fn fork_rpc_url(&self) -> Option<&str> {
        self.node.fork_rpc_url.as_deref().or_else(|| self.node.rpc_urls.first().map(String::as_str))
    }
}
