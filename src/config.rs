use crate::gateway::Address;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::Path,
    time::Duration,
};

/// Monad testnet, where the ticket token lives.
pub const DEFAULT_CHAIN_ID: u64 = 10_143;
/// A winner is drawn every six hours; the static countdown estimate
/// assumes a full round from now.
pub const DEFAULT_ROUND_SECS: u64 = 6 * 60 * 60;

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

fn default_ticket_price() -> u64 {
    1
}

fn default_required_confirmations() -> u32 {
    1
}

fn default_status_poll_secs() -> u64 {
    15
}

fn default_fast_poll_secs() -> u64 {
    2
}

fn default_fast_poll_window_secs() -> u64 {
    10
}

fn default_chain_poll_secs() -> u64 {
    30
}

fn default_rollover_retry_limit() -> u32 {
    5
}

fn default_rollover_retry_millis() -> u64 {
    2000
}

fn default_settle_millis() -> u64 {
    750
}

fn default_fallback_round_secs() -> u64 {
    DEFAULT_ROUND_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the lottery backend (status, server time, purchase
    /// reports).
    pub backend_url: String,
    #[serde(default = "default_chain_id")]
    pub expected_chain_id: u64,
    /// ERC20 ticket token.
    #[serde(default)]
    pub token_address: Option<Address>,
    /// Lottery contract; also the allowance spender.
    #[serde(default)]
    pub lottery_address: Option<Address>,
    /// Connected wallet, if any.
    #[serde(default)]
    pub wallet_address: Option<Address>,
    /// Whole tokens per ticket (1 token = 1 ticket).
    #[serde(default = "default_ticket_price")]
    pub ticket_price_tokens: u64,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,
    /// Backend status poll cadence under normal conditions.
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    /// Tightened poll cadence in the final stretch before rollover.
    #[serde(default = "default_fast_poll_secs")]
    pub fast_poll_secs: u64,
    /// How close to the expected rollover the fast cadence kicks in.
    #[serde(default = "default_fast_poll_window_secs")]
    pub fast_poll_window_secs: u64,
    /// Contract round/end-time poll cadence.
    #[serde(default = "default_chain_poll_secs")]
    pub chain_poll_secs: u64,
    /// Rollover re-check attempts while the round id has not advanced.
    #[serde(default = "default_rollover_retry_limit")]
    pub rollover_retry_limit: u32,
    /// Delay between those attempts.
    #[serde(default = "default_rollover_retry_millis")]
    pub rollover_retry_millis: u64,
    /// How long the refresh flag is held after a cycle, absorbing
    /// backend eventual-consistency lag.
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    /// Round length assumed by the static countdown fallback.
    #[serde(default = "default_fallback_round_secs")]
    pub fallback_round_secs: u64,
}

impl AppConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            expected_chain_id: default_chain_id(),
            token_address: None,
            lottery_address: None,
            wallet_address: None,
            ticket_price_tokens: default_ticket_price(),
            required_confirmations: default_required_confirmations(),
            status_poll_secs: default_status_poll_secs(),
            fast_poll_secs: default_fast_poll_secs(),
            fast_poll_window_secs: default_fast_poll_window_secs(),
            chain_poll_secs: default_chain_poll_secs(),
            rollover_retry_limit: default_rollover_retry_limit(),
            rollover_retry_millis: default_rollover_retry_millis(),
            settle_millis: default_settle_millis(),
            fallback_round_secs: default_fallback_round_secs(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config at {}", path.display()))?;
        serde_json::from_str(&raw)
            .wrap_err_with(|| format!("invalid config at {}", path.display()))
    }

    pub fn with_contracts(mut self, token: Address, lottery: Address) -> Self {
        self.token_address = Some(token);
        self.lottery_address = Some(lottery);
        self
    }

    pub fn with_wallet(mut self, wallet: Address) -> Self {
        self.wallet_address = Some(wallet);
        self
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs.max(1))
    }

    pub fn fast_poll_interval(&self) -> Duration {
        Duration::from_secs(self.fast_poll_secs.max(1))
    }

    pub fn chain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.chain_poll_secs.max(1))
    }

    pub fn rollover_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rollover_retry_millis)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}
