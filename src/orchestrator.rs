use crate::{
    allowance::{
        self,
        AllowanceState,
        MAX_ALLOWANCE,
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
    quantity::normalize_quantity,
};
use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    error,
    info,
};

/// Where a purchase currently is in the approve/simulate/buy/confirm
/// sequence. Exactly one intent is in flight at a time; a new one may
/// only start from `Idle`, `Completed`, or `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStep {
    Idle,
    Preparing,
    CheckingAllowance,
    Approving,
    ConfirmingApproval,
    SimulatingPurchase,
    Buying,
    ConfirmingPurchase,
    Completed,
    Error,
}

impl TransactionStep {
    pub fn accepts_new_intent(&self) -> bool {
        matches!(
            self,
            TransactionStep::Idle | TransactionStep::Completed | TransactionStep::Error
        )
    }
}

impl fmt::Display for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStep::Idle => "idle",
            TransactionStep::Preparing => "preparing",
            TransactionStep::CheckingAllowance => "checkingAllowance",
            TransactionStep::Approving => "approving",
            TransactionStep::ConfirmingApproval => "confirmingApproval",
            TransactionStep::SimulatingPurchase => "simulatingPurchase",
            TransactionStep::Buying => "buying",
            TransactionStep::ConfirmingPurchase => "confirmingPurchase",
            TransactionStep::Completed => "completed",
            TransactionStep::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// A user's request to buy tickets, pinned to the round that was active
/// when it was created. Immutable for its whole life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurchaseIntent {
    pub quantity: u32,
    pub round_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurchaseError {
    /// Rejected before any chain call was made.
    Validation(String),
    /// A read-only chain call failed; retryable.
    Read(String),
    /// The simulation reverted; carries the contract reason verbatim.
    Simulation(String),
    /// The wallet or RPC refused the broadcast; retryable.
    Submission(String),
    /// Broadcast but unconfirmed within the wait bound; the transaction
    /// may still land.
    ConfirmationTimeout { tx_hash: TxHash },
    /// Confirmed but failed on-chain.
    ConfirmationFailed(String),
}

impl fmt::Display for PurchaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseError::Validation(msg) => write!(f, "{msg}"),
            PurchaseError::Read(msg) => write!(f, "chain read failed: {msg}"),
            PurchaseError::Simulation(reason) => {
                write!(f, "purchase simulation reverted: {reason}")
            }
            PurchaseError::Submission(msg) => {
                write!(f, "transaction submission failed: {msg}")
            }
            PurchaseError::ConfirmationTimeout { tx_hash } => write!(
                f,
                "transaction {tx_hash} was broadcast but not confirmed in time; it may still land"
            ),
            PurchaseError::ConfirmationFailed(reason) => {
                write!(f, "transaction failed on-chain: {reason}")
            }
        }
    }
}

impl std::error::Error for PurchaseError {}

/// A failed purchase with the step it failed at, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepFailure {
    pub step: TransactionStep,
    pub error: PurchaseError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (step: {})", self.error, self.step)
    }
}

impl std::error::Error for StepFailure {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub intent: PurchaseIntent,
    pub receipt: Receipt,
    pub total_cost: u128,
}

struct MachineState {
    step: TransactionStep,
    last_error: Option<StepFailure>,
    decimals: Option<u8>,
    inflight_submission: Option<TxHash>,
    bound_simulation: Option<ExecutableRequest>,
}

struct ValidatedIntent {
    quantity: u32,
    wallet: Address,
    lottery: Address,
    decimals: u8,
}

/// Drives one purchase intent at a time through the
/// approve → simulate → buy → confirm sequence.
///
/// Cloning shares the underlying machine state, so a clone can observe
/// `current_step` while another clone runs `submit_purchase`; the shared
/// state is also what makes the re-entrancy rejection real.
pub struct TransactionOrchestrator<G> {
    gateway: G,
    wallet: Option<Address>,
    token: Option<Address>,
    lottery: Option<Address>,
    expected_chain_id: u64,
    ticket_price_tokens: u64,
    required_confirmations: u32,
    state: Arc<Mutex<MachineState>>,
    step_events: Option<mpsc::UnboundedSender<TransactionStep>>,
}

impl<G: Clone> Clone for TransactionOrchestrator<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            wallet: self.wallet,
            token: self.token,
            lottery: self.lottery,
            expected_chain_id: self.expected_chain_id,
            ticket_price_tokens: self.ticket_price_tokens,
            required_confirmations: self.required_confirmations,
            state: self.state.clone(),
            step_events: self.step_events.clone(),
        }
    }
}

impl<G: ChainGateway> TransactionOrchestrator<G> {
    pub fn new(gateway: G, config: &AppConfig) -> Self {
        Self {
            gateway,
            wallet: config.wallet_address,
            token: config.token_address,
            lottery: config.lottery_address,
            expected_chain_id: config.expected_chain_id,
            ticket_price_tokens: config.ticket_price_tokens,
            required_confirmations: config.required_confirmations,
            state: Arc::new(Mutex::new(MachineState {
                step: TransactionStep::Idle,
                last_error: None,
                decimals: None,
                inflight_submission: None,
                bound_simulation: None,
            })),
            step_events: None,
        }
    }

    /// Subscribe a channel to every step transition.
    pub fn with_step_events(
        mut self,
        step_events: mpsc::UnboundedSender<TransactionStep>,
    ) -> Self {
        self.step_events = Some(step_events);
        self
    }

    pub fn current_step(&self) -> TransactionStep {
        self.state().step
    }

    pub fn last_error(&self) -> Option<StepFailure> {
        self.state().last_error.clone()
    }

    pub fn decimals(&self) -> Option<u8> {
        self.state().decimals
    }

    /// Prime the cached token precision; purchases are rejected until it
    /// is known.
    pub fn set_decimals(&self, decimals: u8) {
        self.state().decimals = Some(decimals);
    }

    fn state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().expect("purchase state poisoned")
    }

    fn set_step(&self, step: TransactionStep) {
        self.state().step = step;
        if let Some(events) = &self.step_events {
            let _ = events.send(step);
        }
        debug!(step = %step, "transaction step");
    }

    fn fail(&self, at: TransactionStep, cause: PurchaseError) -> StepFailure {
        let failure = StepFailure {
            step: at,
            error: cause,
        };
        {
            let mut state = self.state();
            state.step = TransactionStep::Error;
            state.last_error = Some(failure.clone());
        }
        if let Some(events) = &self.step_events {
            let _ = events.send(TransactionStep::Error);
        }
        error!(step = %failure.step, error = %failure.error, "purchase failed");
        failure
    }

    /// Validate the intent and atomically claim the state machine.
    ///
    /// Any precondition failure is reported without a step transition
    /// and without touching the chain.
    fn begin(&self, quantity_input: &str) -> Result<ValidatedIntent, StepFailure> {
        let mut state = self.state();
        if !state.step.accepts_new_intent() {
            // Leave the in-flight intent's diagnostics alone.
            return Err(StepFailure {
                step: state.step,
                error: PurchaseError::Validation(
                    "a transaction is already in progress".to_string(),
                ),
            });
        }

        let validated = self.validate(quantity_input, &state);
        match validated {
            Ok(intent) => {
                state.step = TransactionStep::Preparing;
                state.last_error = None;
                state.inflight_submission = None;
                state.bound_simulation = None;
                drop(state);
                if let Some(events) = &self.step_events {
                    let _ = events.send(TransactionStep::Preparing);
                }
                Ok(intent)
            }
            Err(message) => {
                let failure = StepFailure {
                    step: state.step,
                    error: PurchaseError::Validation(message),
                };
                state.last_error = Some(failure.clone());
                Err(failure)
            }
        }
    }

    fn validate(
        &self,
        quantity_input: &str,
        state: &MachineState,
    ) -> Result<ValidatedIntent, String> {
        let quantity = normalize_quantity(quantity_input)
            .ok_or_else(|| "enter a whole number of tickets".to_string())?;
        let wallet = self
            .wallet
            .ok_or_else(|| "wallet not connected".to_string())?;
        if self.token.is_none() {
            return Err("ticket token address not configured".to_string());
        }
        let lottery = self
            .lottery
            .ok_or_else(|| "lottery contract address not configured".to_string())?;
        let actual_chain = self.gateway.chain_id();
        if actual_chain != self.expected_chain_id {
            return Err(format!(
                "connected to the wrong network (expected chain {}, got {})",
                self.expected_chain_id, actual_chain
            ));
        }
        let decimals = state
            .decimals
            .ok_or_else(|| "token decimals not known yet".to_string())?;
        Ok(ValidatedIntent {
            quantity,
            wallet,
            lottery,
            decimals,
        })
    }

    /// Execute a purchase to completion.
    ///
    /// The returned error is also recorded in `last_error`; the step it
    /// failed at is carried alongside the cause.
    pub async fn submit_purchase(
        &self,
        quantity_input: &str,
    ) -> Result<PurchaseOutcome, StepFailure> {
        let valid = self.begin(quantity_input)?;
        info!(quantity = valid.quantity, "starting ticket purchase");

        // Pin the intent to the round that is active right now and price
        // the attempt at the token's precision.
        let round_id = match self.gateway.read_active_round_id().await {
            Ok(id) => id,
            Err(e) => {
                return Err(self.fail(
                    TransactionStep::Preparing,
                    PurchaseError::Read(e.to_string()),
                ));
            }
        };
        let intent = PurchaseIntent {
            quantity: valid.quantity,
            round_id,
        };
        let amount_needed = match allowance::ticket_cost(
            valid.quantity,
            self.ticket_price_tokens,
            valid.decimals,
        ) {
            Some(amount) => amount,
            None => {
                return Err(self.fail(
                    TransactionStep::Preparing,
                    PurchaseError::Validation(
                        "ticket quantity overflows the token amount range".to_string(),
                    ),
                ));
            }
        };

        // Forced fresh read; an allowance cached from an earlier attempt
        // may have been spent or revoked in the meantime.
        self.set_step(TransactionStep::CheckingAllowance);
        let current_allowance = match self
            .gateway
            .read_allowance(valid.wallet, valid.lottery)
            .await
        {
            Ok(amount) => amount,
            Err(e) => {
                return Err(self.fail(
                    TransactionStep::CheckingAllowance,
                    PurchaseError::Read(e.to_string()),
                ));
            }
        };
        let allowance_state = AllowanceState {
            current_allowance,
            amount_needed,
        };

        if allowance_state.needs_approval() {
            self.set_step(TransactionStep::Approving);
            let approval_tx = match self
                .gateway
                .submit_approval(valid.lottery, MAX_ALLOWANCE)
                .await
            {
                Ok(tx_hash) => tx_hash,
                Err(e) => {
                    return Err(self.fail(
                        TransactionStep::Approving,
                        PurchaseError::Submission(e.to_string()),
                    ));
                }
            };
            self.set_step(TransactionStep::ConfirmingApproval);
            if let Err(e) = self
                .gateway
                .wait_for_confirmation(approval_tx, self.required_confirmations)
                .await
            {
                return Err(
                    self.fail(TransactionStep::ConfirmingApproval, confirmation_error(e))
                );
            }
            info!(%approval_tx, "allowance approval confirmed");
        }

        // Arguments come from the pinned intent, not from any input that
        // may have changed during the approval wait.
        self.set_step(TransactionStep::SimulatingPurchase);
        let request = match self
            .gateway
            .simulate_purchase(intent.round_id, intent.quantity)
            .await
        {
            Ok(request) => request,
            Err(GatewayError::Revert(reason)) => {
                return Err(self.fail(
                    TransactionStep::SimulatingPurchase,
                    PurchaseError::Simulation(reason),
                ));
            }
            Err(e) => {
                return Err(self.fail(
                    TransactionStep::SimulatingPurchase,
                    PurchaseError::Read(e.to_string()),
                ));
            }
        };
        if request.round_id != intent.round_id || request.quantity != intent.quantity {
            // A result computed under a different round or quantity must
            // never be broadcast.
            return Err(self.fail(
                TransactionStep::SimulatingPurchase,
                PurchaseError::Simulation(format!(
                    "stale simulation: intent is round {} x{}, simulated round {} x{}",
                    intent.round_id, intent.quantity, request.round_id, request.quantity
                )),
            ));
        }
        self.state().bound_simulation = Some(request.clone());

        self.set_step(TransactionStep::Buying);
        let pending = self.state().inflight_submission;
        let tx_hash = match pending {
            Some(tx_hash) => {
                // A submission for this intent is already pending;
                // re-entering the step must not broadcast again.
                debug!(%tx_hash, "submission already pending, not re-submitting");
                tx_hash
            }
            None => match self.gateway.submit(request).await {
                Ok(tx_hash) => {
                    self.state().inflight_submission = Some(tx_hash);
                    tx_hash
                }
                Err(e) => {
                    return Err(self.fail(
                        TransactionStep::Buying,
                        PurchaseError::Submission(e.to_string()),
                    ));
                }
            },
        };

        self.set_step(TransactionStep::ConfirmingPurchase);
        let receipt = match self
            .gateway
            .wait_for_confirmation(tx_hash, self.required_confirmations)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                return Err(
                    self.fail(TransactionStep::ConfirmingPurchase, confirmation_error(e))
                );
            }
        };

        {
            let mut state = self.state();
            state.step = TransactionStep::Completed;
            state.last_error = None;
            state.inflight_submission = None;
            state.bound_simulation = None;
        }
        if let Some(events) = &self.step_events {
            let _ = events.send(TransactionStep::Completed);
        }
        info!(
            tx_hash = %receipt.tx_hash,
            round_id = intent.round_id,
            quantity = intent.quantity,
            "ticket purchase confirmed"
        );

        Ok(PurchaseOutcome {
            intent,
            receipt,
            total_cost: amount_needed,
        })
    }
}

fn confirmation_error(cause: GatewayError) -> PurchaseError {
    match cause {
        GatewayError::ConfirmationTimeout { tx_hash } => {
            PurchaseError::ConfirmationTimeout { tx_hash }
        }
        GatewayError::ConfirmationFailed { reason, .. } => {
            PurchaseError::ConfirmationFailed(reason)
        }
        other => PurchaseError::Read(other.to_string()),
    }
}
