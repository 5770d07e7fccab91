//! Programmable fakes for the chain gateway and the backend, so the
//! purchase flow and round clock can be exercised without a node or a
//! server.

use crate::{
    backend_client::{
        BackendUnavailable,
        PurchaseReport,
        RoundStatus,
        ServerTime,
        StatusSource,
    },
    config::AppConfig,
    gateway::{
        Address,
        ChainGateway,
        ExecutableRequest,
        GatewayError,
        Receipt,
        TxHash,
    },
    orchestrator::TransactionOrchestrator,
};
use async_trait::async_trait;
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};
use tokio::sync::Notify;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmBehavior {
    Confirm,
    Timeout,
    FailWith(String),
}

enum PendingTx {
    Approval { amount: u128 },
    Purchase { request: ExecutableRequest },
}

struct GatewayState {
    chain_id: u64,
    decimals: u8,
    allowance: u128,
    balances: HashMap<Address, u128>,
    active_round: u64,
    round_ends: HashMap<u64, u64>,
    owned_tickets: HashMap<(Address, u64), u64>,
    simulate_revert: Option<String>,
    simulated_round_override: Option<u64>,
    read_failure: Option<String>,
    allowance_read_failure: Option<String>,
    confirmation: ConfirmBehavior,
    confirm_gate: Option<Arc<Notify>>,
    allowance_reads: u32,
    approvals: Vec<(Address, u128)>,
    submissions: Vec<ExecutableRequest>,
    next_nonce: u64,
    pending: HashMap<TxHash, PendingTx>,
    wallet: Address,
}

/// In-memory chain with scriptable failure modes. Clones share state,
/// mirroring how a real gateway handle would be cloned into workers.
#[derive(Clone)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    pub fn new(wallet: Address) -> Self {
        Self {
            state: Arc::new(Mutex::new(GatewayState {
                chain_id: crate::config::DEFAULT_CHAIN_ID,
                decimals: 18,
                allowance: 0,
                balances: HashMap::new(),
                active_round: 1,
                round_ends: HashMap::new(),
                owned_tickets: HashMap::new(),
                simulate_revert: None,
                simulated_round_override: None,
                read_failure: None,
                allowance_read_failure: None,
                confirmation: ConfirmBehavior::Confirm,
                confirm_gate: None,
                allowance_reads: 0,
                approvals: Vec::new(),
                submissions: Vec::new(),
                next_nonce: 0,
                pending: HashMap::new(),
                wallet,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap()
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
    }

    pub fn set_decimals(&self, decimals: u8) {
        self.state().decimals = decimals;
    }

    pub fn set_allowance(&self, amount: u128) {
        self.state().allowance = amount;
    }

    pub fn set_balance(&self, owner: Address, amount: u128) {
        self.state().balances.insert(owner, amount);
    }

    pub fn set_active_round(&self, round_id: u64, end_timestamp: u64) {
        let mut state = self.state();
        state.active_round = round_id;
        state.round_ends.insert(round_id, end_timestamp);
    }

    pub fn set_owned_tickets(&self, owner: Address, round_id: u64, count: u64) {
        self.state().owned_tickets.insert((owner, round_id), count);
    }

    /// Make every simulation revert with the given contract reason.
    pub fn script_simulation_revert(&self, reason: impl Into<String>) {
        self.state().simulate_revert = Some(reason.into());
    }

    pub fn clear_simulation_revert(&self) {
        self.state().simulate_revert = None;
    }

    /// Make simulations claim they ran under a different round, as a
    /// node lagging behind a rollover would.
    pub fn script_simulated_round(&self, round_id: u64) {
        self.state().simulated_round_override = Some(round_id);
    }

    /// Make every read-only call fail with the given message.
    pub fn script_read_failure(&self, message: impl Into<String>) {
        self.state().read_failure = Some(message.into());
    }

    pub fn clear_read_failure(&self) {
        self.state().read_failure = None;
    }

    /// Fail only the allowance read, leaving other reads intact.
    pub fn script_allowance_read_failure(&self, message: impl Into<String>) {
        self.state().allowance_read_failure = Some(message.into());
    }

    pub fn script_confirmation(&self, behavior: ConfirmBehavior) {
        self.state().confirmation = behavior;
    }

    /// Park every confirmation wait until [`Self::release_confirmation`].
    pub fn hold_confirmations(&self) {
        self.state().confirm_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_confirmation(&self) {
        if let Some(gate) = &self.state().confirm_gate {
            gate.notify_one();
        }
    }

    pub fn allowance_read_count(&self) -> u32 {
        self.state().allowance_reads
    }

    pub fn approvals(&self) -> Vec<(Address, u128)> {
        self.state().approvals.clone()
    }

    pub fn submissions(&self) -> Vec<ExecutableRequest> {
        self.state().submissions.clone()
    }

    pub fn owned_tickets(&self, owner: Address, round_id: u64) -> u64 {
        self.state()
            .owned_tickets
            .get(&(owner, round_id))
            .copied()
            .unwrap_or(0)
    }

    fn fail_reads(state: &GatewayState) -> Result<(), GatewayError> {
        match &state.read_failure {
            Some(message) => Err(GatewayError::Read(message.clone())),
            None => Ok(()),
        }
    }

    fn next_tx_hash(state: &mut GatewayState) -> TxHash {
        state.next_nonce += 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&state.next_nonce.to_le_bytes());
        TxHash::new(bytes)
    }
}

#[async_trait]
impl ChainGateway for FakeGateway {
    fn chain_id(&self) -> u64 {
        self.state().chain_id
    }

    async fn read_allowance(
        &self,
        _owner: Address,
        _spender: Address,
    ) -> Result<u128, GatewayError> {
        let mut state = self.state();
        state.allowance_reads += 1;
        Self::fail_reads(&state)?;
        if let Some(message) = &state.allowance_read_failure {
            return Err(GatewayError::Read(message.clone()));
        }
        Ok(state.allowance)
    }

    async fn read_balance(&self, owner: Address) -> Result<u128, GatewayError> {
        let state = self.state();
        Self::fail_reads(&state)?;
        Ok(state.balances.get(&owner).copied().unwrap_or(0))
    }

    async fn read_decimals(&self) -> Result<u8, GatewayError> {
        let state = self.state();
        Self::fail_reads(&state)?;
        Ok(state.decimals)
    }

    async fn read_active_round_id(&self) -> Result<u64, GatewayError> {
        let state = self.state();
        Self::fail_reads(&state)?;
        Ok(state.active_round)
    }

    async fn read_round_end_time(&self, round_id: u64) -> Result<u64, GatewayError> {
        let state = self.state();
        Self::fail_reads(&state)?;
        state
            .round_ends
            .get(&round_id)
            .copied()
            .ok_or_else(|| GatewayError::Read(format!("unknown round {round_id}")))
    }

    async fn read_owned_tickets(
        &self,
        owner: Address,
        round_id: u64,
    ) -> Result<u64, GatewayError> {
        let state = self.state();
        Self::fail_reads(&state)?;
        Ok(state
            .owned_tickets
            .get(&(owner, round_id))
            .copied()
            .unwrap_or(0))
    }

    async fn simulate_purchase(
        &self,
        round_id: u64,
        quantity: u32,
    ) -> Result<ExecutableRequest, GatewayError> {
        let state = self.state();
        if let Some(reason) = &state.simulate_revert {
            return Err(GatewayError::Revert(reason.clone()));
        }
        let simulated_round = state.simulated_round_override.unwrap_or(round_id);
        let total_cost = u128::from(quantity) * 10u128.pow(u32::from(state.decimals));
        let mut calldata = simulated_round.to_le_bytes().to_vec();
        calldata.extend_from_slice(&quantity.to_le_bytes());
        Ok(ExecutableRequest {
            round_id: simulated_round,
            quantity,
            total_cost,
            calldata,
        })
    }

    async fn submit_approval(
        &self,
        spender: Address,
        amount: u128,
    ) -> Result<TxHash, GatewayError> {
        let mut state = self.state();
        state.approvals.push((spender, amount));
        let tx_hash = Self::next_tx_hash(&mut state);
        state.pending.insert(tx_hash, PendingTx::Approval { amount });
        Ok(tx_hash)
    }

    async fn submit(&self, request: ExecutableRequest) -> Result<TxHash, GatewayError> {
        let mut state = self.state();
        state.submissions.push(request.clone());
        let tx_hash = Self::next_tx_hash(&mut state);
        state.pending.insert(tx_hash, PendingTx::Purchase { request });
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        _confirmations: u32,
    ) -> Result<Receipt, GatewayError> {
        let gate = self.state().confirm_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        match state.confirmation.clone() {
            ConfirmBehavior::Timeout => {
                return Err(GatewayError::ConfirmationTimeout { tx_hash });
            }
            ConfirmBehavior::FailWith(reason) => {
                return Err(GatewayError::ConfirmationFailed { tx_hash, reason });
            }
            ConfirmBehavior::Confirm => {}
        }
        match state.pending.remove(&tx_hash) {
            Some(PendingTx::Approval { amount }) => {
                state.allowance = amount;
            }
            Some(PendingTx::Purchase { request }) => {
                let wallet = state.wallet;
                let entry = state
                    .owned_tickets
                    .entry((wallet, request.round_id))
                    .or_insert(0);
                *entry += u64::from(request.quantity);
                if let Some(balance) = state.balances.get_mut(&wallet) {
                    *balance = balance.saturating_sub(request.total_cost);
                }
            }
            None => {
                return Err(GatewayError::Read(format!(
                    "unknown transaction {tx_hash}"
                )));
            }
        }
        Ok(Receipt {
            tx_hash,
            block_number: state.next_nonce,
        })
    }
}

struct BackendState {
    queued: VecDeque<Result<RoundStatus, BackendUnavailable>>,
    default: Option<RoundStatus>,
    server_time: Option<ServerTime>,
    reports: Vec<PurchaseReport>,
}

/// Scriptable stand-in for the lottery backend.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                queued: VecDeque::new(),
                default: None,
                server_time: None,
                reports: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    /// One-shot response, consumed before the default kicks back in.
    pub fn push_status(&self, response: Result<RoundStatus, BackendUnavailable>) {
        self.state().queued.push_back(response);
    }

    pub fn set_default_status(&self, status: RoundStatus) {
        self.state().default = Some(status);
    }

    pub fn set_server_time(&self, server_time: ServerTime) {
        self.state().server_time = Some(server_time);
    }

    pub fn reports(&self) -> Vec<PurchaseReport> {
        self.state().reports.clone()
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusSource for FakeBackend {
    async fn fetch_status(&self) -> Result<RoundStatus, BackendUnavailable> {
        let mut state = self.state();
        if let Some(response) = state.queued.pop_front() {
            return response;
        }
        state.default.ok_or_else(|| BackendUnavailable {
            reason: "no scripted status".to_string(),
        })
    }

    async fn fetch_server_time(&self) -> Result<ServerTime, BackendUnavailable> {
        self.state().server_time.ok_or_else(|| BackendUnavailable {
            reason: "no scripted server time".to_string(),
        })
    }

    async fn report_purchase(
        &self,
        report: &PurchaseReport,
    ) -> Result<(), BackendUnavailable> {
        self.state().reports.push(report.clone());
        Ok(())
    }
}

/// Ready-made wallet/contract addresses, fakes, and a config tuned for
/// fast test turnaround.
pub struct TestContext {
    pub gateway: FakeGateway,
    pub backend: FakeBackend,
    pub config: AppConfig,
}

impl TestContext {
    pub fn new() -> Self {
        let config = AppConfig {
            status_poll_secs: 1,
            fast_poll_secs: 1,
            chain_poll_secs: 1,
            rollover_retry_millis: 10,
            settle_millis: 10,
            ..AppConfig::new("http://localhost:3001")
        }
        .with_contracts(Self::token(), Self::lottery())
        .with_wallet(Self::wallet());
        let gateway = FakeGateway::new(Self::wallet());
        Self {
            gateway,
            backend: FakeBackend::new(),
            config,
        }
    }

    pub fn wallet() -> Address {
        Address::new([0x11; 20])
    }

    pub fn token() -> Address {
        Address::new([0x22; 20])
    }

    pub fn lottery() -> Address {
        Address::new([0x33; 20])
    }

    /// Orchestrator over the fake gateway with token precision primed,
    /// as the app's startup refresh would leave it.
    pub fn orchestrator(&self) -> TransactionOrchestrator<FakeGateway> {
        let orchestrator =
            TransactionOrchestrator::new(self.gateway.clone(), &self.config);
        orchestrator.set_decimals(18);
        orchestrator
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
