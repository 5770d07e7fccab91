use crate::{
    backend_client::{
        BackendUnavailable,
        PurchaseReport,
        RoundStatus,
        StatusSource,
    },
    clock::{
        CountdownState,
        RoundClockSynchronizer,
    },
    config::AppConfig,
    gateway::{
        Address,
        ChainGateway,
        GatewayError,
        TxHash,
    },
    orchestrator::{
        PurchaseOutcome,
        StepFailure,
        TransactionOrchestrator,
        TransactionStep,
    },
    refresh::{
        RefreshCoordinator,
        RefreshGuard,
    },
};
use chrono::Utc;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug)]
pub enum AppCommand {
    SubmitPurchase { quantity: String },
    Shutdown,
}

/// Everything the embedding layer can observe: countdown ticks, step
/// transitions of the purchase machine, terminal purchase results, the
/// one-shot new-round notification, refreshed per-round reads, and
/// non-blocking notices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppEvent {
    CountdownTick(Option<CountdownState>),
    StepChanged(TransactionStep),
    PurchaseCompleted {
        round_id: u64,
        quantity: u32,
        tx_hash: TxHash,
    },
    PurchaseFailed(StepFailure),
    NewRoundStarted {
        round_id: u64,
        end_timestamp: u64,
    },
    RoundDataRefreshed(RoundSnapshot),
    Notice(String),
}

/// Per-round cache of the dependent chain reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round_id: u64,
    pub token_balance: u128,
    pub owned_tickets: u64,
    pub pool_balance: u128,
    pub allowance: u128,
    pub decimals: u8,
}

/// What a rollover check found, and which source produced it.
#[derive(Clone, Copy, Debug)]
struct RolloverReading {
    round_id: u64,
    end_timestamp: u64,
    from_contract: bool,
}

enum Internal {
    Status(Result<RoundStatus, BackendUnavailable>),
    ChainRound { round_id: u64, end_timestamp: u64 },
    PurchaseDone(Result<PurchaseOutcome, StepFailure>),
    RolloverResolved { next: Option<RolloverReading> },
    Refreshed(RoundSnapshot),
}

enum BackendCommand {
    SetCadence(Duration),
    Report(PurchaseReport),
    Shutdown,
}

fn local_now() -> i64 {
    Utc::now().timestamp()
}

/// Wires the purchase orchestrator, the round clock, and the refresh
/// coordinator onto one event loop.
pub struct LotteryApp<G, B> {
    gateway: G,
    backend: B,
    config: AppConfig,
    clock: RoundClockSynchronizer,
    coordinator: RefreshCoordinator,
}

impl<G, B> LotteryApp<G, B>
where
    G: ChainGateway + Clone + 'static,
    B: StatusSource + Clone + 'static,
{
    pub fn new(gateway: G, backend: B, config: AppConfig) -> Self {
        let clock = RoundClockSynchronizer::new(config.fallback_round_secs);
        let coordinator = RefreshCoordinator::new(config.settle_delay());
        Self {
            gateway,
            backend,
            config,
            clock,
            coordinator,
        }
    }

    /// Run until the command channel closes or `Shutdown` arrives.
    ///
    /// Purchases and refresh cycles run on spawned tasks so the 1-second
    /// countdown tick never waits on a chain call.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<AppCommand>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) {
        let LotteryApp {
            gateway,
            backend,
            config,
            mut clock,
            coordinator,
        } = self;
        let wallet = config.wallet_address;
        let lottery = config.lottery_address;

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
        let (step_tx, mut step_rx) = mpsc::unbounded_channel::<TransactionStep>();
        let orchestrator =
            TransactionOrchestrator::new(gateway.clone(), &config).with_step_events(step_tx);

        let (backend_tx, backend_rx) = mpsc::unbounded_channel::<BackendCommand>();
        tokio::spawn(backend_worker(
            backend.clone(),
            config.status_poll_interval(),
            backend_rx,
            internal_tx.clone(),
        ));
        tokio::spawn(chain_poll_worker(
            gateway.clone(),
            config.chain_poll_interval(),
            internal_tx.clone(),
        ));

        // One cheap offset correction before the first status poll lands.
        match backend.fetch_server_time().await {
            Ok(server_time) => {
                clock.observe_server_time(server_time.timestamp, local_now());
            }
            Err(e) => debug!(error = %e, "initial server-time probe failed"),
        }

        let mut ticker = time::interval(Duration::from_secs(1));
        let mut fast_cadence = false;
        let mut backend_degraded = false;
        let mut rollover_cooldown_until: Option<time::Instant> = None;
        let mut latest_backend_round: Option<(u64, u64)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = local_now();
                    clock.ensure_end_time(now);
                    let _ = events.send(AppEvent::CountdownTick(clock.countdown(now)));

                    let want_fast =
                        clock.near_rollover(now, config.fast_poll_window_secs);
                    if want_fast != fast_cadence {
                        fast_cadence = want_fast;
                        let cadence = if want_fast {
                            config.fast_poll_interval()
                        } else {
                            config.status_poll_interval()
                        };
                        let _ = backend_tx.send(BackendCommand::SetCadence(cadence));
                    }

                    if clock.is_expired(now) {
                        let cooled = rollover_cooldown_until
                            .map(|until| time::Instant::now() >= until)
                            .unwrap_or(true);
                        if cooled && let Some(guard) = coordinator.try_begin() {
                            tokio::spawn(rollover_cycle(
                                gateway.clone(),
                                guard,
                                clock.round_identity(),
                                latest_backend_round,
                                wallet,
                                lottery,
                                config.rollover_retry_limit,
                                config.rollover_retry_delay(),
                                internal_tx.clone(),
                            ));
                        }
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(AppCommand::SubmitPurchase { quantity }) => {
                            let orchestrator = orchestrator.clone();
                            let internal = internal_tx.clone();
                            tokio::spawn(async move {
                                let result =
                                    orchestrator.submit_purchase(&quantity).await;
                                let _ = internal.send(Internal::PurchaseDone(result));
                            });
                        }
                        Some(AppCommand::Shutdown) | None => {
                            let _ = backend_tx.send(BackendCommand::Shutdown);
                            break;
                        }
                    }
                }
                Some(step) = step_rx.recv() => {
                    let _ = events.send(AppEvent::StepChanged(step));
                }
                Some(internal_event) = internal_rx.recv() => {
                    match internal_event {
                        Internal::Status(Ok(status)) => {
                            latest_backend_round =
                                Some((status.round_id, status.end_timestamp));
                            clock.observe_backend_status(&status, local_now());
                            if backend_degraded {
                                backend_degraded = false;
                                info!("backend reachable again");
                            }
                        }
                        Internal::Status(Err(e)) => {
                            warn!(error = %e, "status fetch failed; staying on fallback time sources");
                            if !backend_degraded {
                                backend_degraded = true;
                                let _ = events.send(AppEvent::Notice(
                                    "backend unreachable; countdown running on fallback time"
                                        .to_string(),
                                ));
                            }
                        }
                        Internal::ChainRound { round_id, end_timestamp } => {
                            let identity = clock.round_identity();
                            if identity.is_none() {
                                // First arming, not a rollover.
                                clock.commit_rollover(round_id, end_timestamp);
                                spawn_refresh(
                                    gateway.clone(),
                                    coordinator.clone(),
                                    wallet,
                                    lottery,
                                    round_id,
                                    internal_tx.clone(),
                                );
                            } else if identity != Some(round_id) {
                                // The chain advanced while the countdown
                                // still had time on it.
                                if clock.commit_rollover(round_id, end_timestamp) {
                                    info!(round_id, "new round started");
                                    let _ = events.send(AppEvent::NewRoundStarted {
                                        round_id,
                                        end_timestamp,
                                    });
                                    rollover_cooldown_until = None;
                                    spawn_refresh(
                                        gateway.clone(),
                                        coordinator.clone(),
                                        wallet,
                                        lottery,
                                        round_id,
                                        internal_tx.clone(),
                                    );
                                }
                            } else {
                                clock.observe_contract_round(round_id, end_timestamp);
                            }
                        }
                        Internal::PurchaseDone(Ok(outcome)) => {
                            let _ = events.send(AppEvent::PurchaseCompleted {
                                round_id: outcome.intent.round_id,
                                quantity: outcome.intent.quantity,
                                tx_hash: outcome.receipt.tx_hash,
                            });
                            if let Some(address) = wallet {
                                let _ = backend_tx.send(BackendCommand::Report(
                                    PurchaseReport {
                                        address,
                                        round_id: outcome.intent.round_id,
                                        quantity: outcome.intent.quantity,
                                        total_value: outcome.total_cost,
                                    },
                                ));
                            }
                            // Completion does not wait on this; a failed
                            // refresh is a notice, never a demotion.
                            spawn_refresh(
                                gateway.clone(),
                                coordinator.clone(),
                                wallet,
                                lottery,
                                outcome.intent.round_id,
                                internal_tx.clone(),
                            );
                        }
                        Internal::PurchaseDone(Err(failure)) => {
                            let _ = events.send(AppEvent::PurchaseFailed(failure));
                        }
                        Internal::RolloverResolved { next: Some(reading) } => {
                            let RolloverReading {
                                round_id,
                                end_timestamp,
                                from_contract,
                            } = reading;
                            let changed = if from_contract {
                                clock.commit_rollover(round_id, end_timestamp)
                            } else {
                                clock.commit_rollover_from_backend(round_id, end_timestamp)
                            };
                            if changed {
                                info!(round_id, "new round started");
                                let _ = events.send(AppEvent::NewRoundStarted {
                                    round_id,
                                    end_timestamp,
                                });
                            }
                            rollover_cooldown_until = None;
                        }
                        Internal::RolloverResolved { next: None } => {
                            // Budget exhausted; fall back to the slow
                            // cadence before probing again.
                            rollover_cooldown_until = Some(
                                time::Instant::now() + config.status_poll_interval(),
                            );
                            let now = local_now();
                            let authoritative = clock
                                .selected_source()
                                .map(|source| source.is_authoritative())
                                .unwrap_or(false);
                            if !authoritative {
                                clock.rearm_static(now);
                            }
                        }
                        Internal::Refreshed(snapshot) => {
                            orchestrator.set_decimals(snapshot.decimals);
                            let _ = events.send(AppEvent::RoundDataRefreshed(snapshot));
                        }
                    }
                }
            }
        }
    }
}

async fn backend_worker<B: StatusSource>(
    backend: B,
    initial_cadence: Duration,
    mut commands: mpsc::UnboundedReceiver<BackendCommand>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let mut ticker = time::interval(initial_cadence);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = backend.fetch_status().await;
                if internal.send(Internal::Status(result)).is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(BackendCommand::SetCadence(period)) => {
                        // A fresh interval fires immediately, which doubles
                        // as the fetch-now on every cadence switch.
                        ticker = time::interval(period);
                    }
                    Some(BackendCommand::Report(report)) => {
                        if let Err(e) = backend.report_purchase(&report).await {
                            warn!(error = %e, "purchase report not accepted");
                        }
                    }
                    Some(BackendCommand::Shutdown) | None => break,
                }
            }
        }
    }
}

async fn chain_poll_worker<G: ChainGateway>(
    gateway: G,
    cadence: Duration,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let mut ticker = time::interval(cadence);
    loop {
        ticker.tick().await;
        if internal.is_closed() {
            break;
        }
        match gateway.read_active_round_id().await {
            Ok(round_id) => match gateway.read_round_end_time(round_id).await {
                Ok(end_timestamp) => {
                    if internal
                        .send(Internal::ChainRound {
                            round_id,
                            end_timestamp,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "round end read failed"),
            },
            Err(e) => debug!(error = %e, "active round read failed"),
        }
    }
}

/// Re-check the active round until it advances past `current_identity`,
/// bounded by the retry budget. Runs under the refresh flag; the
/// dependent-data refresh happens inside the same exclusion window.
///
/// The contract is the highest-priority identity source; the last
/// backend reading stands in only when the contract cannot be read.
#[allow(clippy::too_many_arguments)]
async fn rollover_cycle<G: ChainGateway>(
    gateway: G,
    guard: RefreshGuard,
    current_identity: Option<u64>,
    backend_reading: Option<(u64, u64)>,
    wallet: Option<Address>,
    lottery: Option<Address>,
    retry_limit: u32,
    retry_delay: Duration,
    internal: mpsc::UnboundedSender<Internal>,
) {
    for attempt in 1..=retry_limit.max(1) {
        let observed = match gateway.read_active_round_id().await {
            Ok(round_id) => match gateway.read_round_end_time(round_id).await {
                Ok(end_timestamp) => Some(RolloverReading {
                    round_id,
                    end_timestamp,
                    from_contract: true,
                }),
                Err(e) => {
                    warn!(error = %e, "round end read failed during rollover check");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "active round read failed; trying the backend reading");
                backend_reading.map(|(round_id, end_timestamp)| RolloverReading {
                    round_id,
                    end_timestamp,
                    from_contract: false,
                })
            }
        };
        if let Some(reading) = observed
            && Some(reading.round_id) != current_identity
        {
            match read_round_snapshot(&gateway, wallet, lottery, reading.round_id).await
            {
                Ok(snapshot) => {
                    let _ = internal.send(Internal::Refreshed(snapshot));
                }
                Err(e) => warn!(error = %e, "post-rollover refresh failed"),
            }
            let _ = internal.send(Internal::RolloverResolved {
                next: Some(reading),
            });
            guard.settle().await;
            return;
        }
        debug!(attempt, "round has not advanced yet");
        time::sleep(retry_delay).await;
    }
    let _ = internal.send(Internal::RolloverResolved { next: None });
    guard.settle().await;
}

fn spawn_refresh<G: ChainGateway + Clone + 'static>(
    gateway: G,
    coordinator: RefreshCoordinator,
    wallet: Option<Address>,
    lottery: Option<Address>,
    round_id: u64,
    internal: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        let Some(guard) = coordinator.try_begin() else {
            debug!("refresh skipped; another cycle holds the flag");
            return;
        };
        match read_round_snapshot(&gateway, wallet, lottery, round_id).await {
            Ok(snapshot) => {
                let _ = internal.send(Internal::Refreshed(snapshot));
            }
            Err(e) => warn!(error = %e, "round data refresh failed"),
        }
        guard.settle().await;
    });
}

async fn read_round_snapshot<G: ChainGateway>(
    gateway: &G,
    wallet: Option<Address>,
    lottery: Option<Address>,
    round_id: u64,
) -> Result<RoundSnapshot, GatewayError> {
    let decimals = gateway.read_decimals().await?;
    let (token_balance, owned_tickets, allowance) = match wallet {
        Some(owner) => {
            let balance = gateway.read_balance(owner).await?;
            let tickets = gateway.read_owned_tickets(owner, round_id).await?;
            let allowance = match lottery {
                Some(spender) => gateway.read_allowance(owner, spender).await?,
                None => 0,
            };
            (balance, tickets, allowance)
        }
        None => (0, 0, 0),
    };
    let pool_balance = match lottery {
        Some(pool) => gateway.read_balance(pool).await?,
        None => 0,
    };
    Ok(RoundSnapshot {
        round_id,
        token_balance,
        owned_tickets,
        pool_balance,
        allowance,
        decimals,
    })
}
