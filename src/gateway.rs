use async_trait::async_trait;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use std::{
    fmt,
    str::FromStr,
};

/// A 20-byte account or contract address, parsed from and displayed as
/// `0x`-prefixed hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn zeroed() -> Self {
        Self([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| ParseAddressError)?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| ParseAddressError)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseAddressError;

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a 20-byte 0x-prefixed hex address")
    }
}

impl std::error::Error for ParseAddressError {}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transaction hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A purchase call that simulated cleanly and is ready to broadcast.
///
/// The round id and quantity it was simulated under travel with the call
/// data so a submission can be checked against the intent that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableRequest {
    pub round_id: u64,
    pub quantity: u32,
    pub total_cost: u128,
    pub calldata: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayError {
    /// A read-only call failed or returned something unparseable.
    Read(String),
    /// The node rejected a simulation; carries the contract revert reason.
    Revert(String),
    /// The wallet or RPC refused to broadcast.
    Rejected(String),
    /// Broadcast succeeded but no receipt arrived within the wait bound.
    ConfirmationTimeout { tx_hash: TxHash },
    /// The transaction landed but the receipt reports failure.
    ConfirmationFailed { tx_hash: TxHash, reason: String },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Read(msg) => write!(f, "chain read failed: {msg}"),
            GatewayError::Revert(reason) => write!(f, "execution reverted: {reason}"),
            GatewayError::Rejected(msg) => write!(f, "broadcast rejected: {msg}"),
            GatewayError::ConfirmationTimeout { tx_hash } => {
                write!(f, "no confirmation for {tx_hash} within the wait bound")
            }
            GatewayError::ConfirmationFailed { tx_hash, reason } => {
                write!(f, "transaction {tx_hash} failed on-chain: {reason}")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// Read/simulate/submit/wait surface of the lottery chain.
///
/// The chain itself is an external collaborator; everything the client
/// needs from it goes through this trait so the purchase flow and the
/// round clock can be exercised against a fake in tests.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Chain id the gateway is connected to, fixed at construction.
    fn chain_id(&self) -> u64;

    /// Token amount `spender` may transfer on behalf of `owner`.
    async fn read_allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> Result<u128, GatewayError>;

    /// Token balance of `owner` in base units.
    async fn read_balance(&self, owner: Address) -> Result<u128, GatewayError>;

    /// Decimal precision of the ticket token.
    async fn read_decimals(&self) -> Result<u8, GatewayError>;

    /// Id of the round currently accepting tickets.
    async fn read_active_round_id(&self) -> Result<u64, GatewayError>;

    /// Unix end timestamp (seconds) of the given round.
    async fn read_round_end_time(&self, round_id: u64) -> Result<u64, GatewayError>;

    /// Tickets `owner` holds in the given round.
    async fn read_owned_tickets(
        &self,
        owner: Address,
        round_id: u64,
    ) -> Result<u64, GatewayError>;

    /// Dry-run a purchase against current chain state. A revert surfaces
    /// as [`GatewayError::Revert`] with the contract-provided reason.
    async fn simulate_purchase(
        &self,
        round_id: u64,
        quantity: u32,
    ) -> Result<ExecutableRequest, GatewayError>;

    /// Broadcast an approval for `spender` to move up to `amount`.
    async fn submit_approval(
        &self,
        spender: Address,
        amount: u128,
    ) -> Result<TxHash, GatewayError>;

    /// Broadcast a simulated purchase.
    async fn submit(&self, request: ExecutableRequest) -> Result<TxHash, GatewayError>;

    /// Wait until the transaction has the requested number of
    /// confirmations, bounded by the gateway's own wait limit.
    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        confirmations: u32,
    ) -> Result<Receipt, GatewayError>;
}
