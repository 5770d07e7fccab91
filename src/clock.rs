use crate::backend_client::RoundStatus;
use std::fmt;
use tracing::debug;

/// Where the currently displayed round-end time came from.
///
/// Priority is Contract > Backend > StaticFallback; the fallback exists
/// only so the display never freezes, and is marked non-authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundTimeSource {
    Contract {
        end_timestamp: u64,
    },
    Backend {
        end_timestamp: u64,
        server_offset_seconds: i64,
    },
    StaticFallback {
        end_timestamp: u64,
    },
}

impl RoundTimeSource {
    pub fn end_timestamp(&self) -> u64 {
        match self {
            RoundTimeSource::Contract { end_timestamp }
            | RoundTimeSource::Backend { end_timestamp, .. }
            | RoundTimeSource::StaticFallback { end_timestamp } => *end_timestamp,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        !matches!(self, RoundTimeSource::StaticFallback { .. })
    }
}

/// Derived display state. Never stored; recomputed from the selected
/// end time and corrected local time on every tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountdownState {
    pub hours: u64,
    pub minutes: u8,
    pub seconds: u8,
}

impl CountdownState {
    pub fn from_remaining_seconds(remaining: i64) -> Self {
        let clamped = remaining.max(0) as u64;
        Self {
            hours: clamped / 3600,
            minutes: ((clamped % 3600) / 60) as u8,
            seconds: (clamped % 60) as u8,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hours == 0 && self.minutes == 0 && self.seconds == 0
    }
}

impl fmt::Display for CountdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ContractReading {
    round_id: u64,
    end_timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BackendReading {
    round_id: u64,
    end_timestamp: u64,
    server_offset_seconds: i64,
}

/// Reconciles local wall-clock time against the contract, the backend,
/// and a static estimate to drive one countdown, and tracks which round
/// a rollover has already been processed for.
///
/// All methods take `local_now` (unix seconds) as an argument so the
/// math is deterministic under test; the caller samples the wall clock.
pub struct RoundClockSynchronizer {
    offset_seconds: i64,
    contract: Option<ContractReading>,
    backend: Option<BackendReading>,
    static_end: Option<u64>,
    round_identity: Option<u64>,
    fallback_round_secs: u64,
}

impl RoundClockSynchronizer {
    pub fn new(fallback_round_secs: u64) -> Self {
        Self {
            offset_seconds: 0,
            contract: None,
            backend: None,
            static_end: None,
            round_identity: None,
            fallback_round_secs,
        }
    }

    /// `server time − local time` from the most recent successful
    /// backend read; zero until one succeeds.
    pub fn offset_seconds(&self) -> i64 {
        self.offset_seconds
    }

    /// Last round id a rollover was processed for.
    pub fn round_identity(&self) -> Option<u64> {
        self.round_identity
    }

    /// Record a bare server-time probe. Corrects the offset without
    /// touching any end-time reading.
    pub fn observe_server_time(&mut self, server_timestamp: u64, local_now: i64) {
        self.offset_seconds = server_timestamp as i64 - local_now;
    }

    /// Record a fresh backend status read. Updates the clock offset and
    /// replaces the backend end-time reading wholesale.
    pub fn observe_backend_status(&mut self, status: &RoundStatus, local_now: i64) {
        self.offset_seconds = status.server_timestamp as i64 - local_now;
        self.backend = Some(BackendReading {
            round_id: status.round_id,
            end_timestamp: status.end_timestamp,
            server_offset_seconds: self.offset_seconds,
        });
    }

    /// Record a fresh contract end-time reading for the current round.
    /// A reading for a different round is ignored here; round changes go
    /// through [`Self::commit_rollover`].
    pub fn observe_contract_round(&mut self, round_id: u64, end_timestamp: u64) {
        match self.round_identity {
            Some(identity) if identity != round_id => {
                debug!(
                    round_id,
                    identity, "ignoring contract end time for a different round"
                );
            }
            _ => {
                self.contract = Some(ContractReading {
                    round_id,
                    end_timestamp,
                });
            }
        }
    }

    /// Arm the static estimate if no source at all is available, so the
    /// display never goes blank.
    pub fn ensure_end_time(&mut self, local_now: i64) {
        if self.contract.is_none() && self.backend.is_none() && self.static_end.is_none()
        {
            self.static_end = Some(local_now.max(0) as u64 + self.fallback_round_secs);
        }
    }

    /// Re-arm the static estimate from now. Used when a round expired
    /// but no authoritative source has produced the next round yet.
    pub fn rearm_static(&mut self, local_now: i64) {
        self.static_end = Some(local_now.max(0) as u64 + self.fallback_round_secs);
    }

    /// The authoritative end time, chosen strictly by source priority.
    pub fn selected_source(&self) -> Option<RoundTimeSource> {
        if let Some(contract) = &self.contract {
            return Some(RoundTimeSource::Contract {
                end_timestamp: contract.end_timestamp,
            });
        }
        if let Some(backend) = &self.backend {
            return Some(RoundTimeSource::Backend {
                end_timestamp: backend.end_timestamp,
                server_offset_seconds: backend.server_offset_seconds,
            });
        }
        self.static_end
            .map(|end_timestamp| RoundTimeSource::StaticFallback { end_timestamp })
    }

    /// Seconds until the selected end time, measured on the corrected
    /// local clock. Negative once the round has ended.
    pub fn remaining_seconds(&self, local_now: i64) -> Option<i64> {
        let source = self.selected_source()?;
        Some(source.end_timestamp() as i64 - (local_now + self.offset_seconds))
    }

    pub fn countdown(&self, local_now: i64) -> Option<CountdownState> {
        self.remaining_seconds(local_now)
            .map(CountdownState::from_remaining_seconds)
    }

    pub fn is_expired(&self, local_now: i64) -> bool {
        matches!(self.remaining_seconds(local_now), Some(remaining) if remaining <= 0)
    }

    /// Whether the countdown is inside the window where polling should
    /// tighten up ahead of the expected rollover.
    pub fn near_rollover(&self, local_now: i64, window_secs: u64) -> bool {
        matches!(
            self.remaining_seconds(local_now),
            Some(remaining) if remaining <= window_secs as i64
        )
    }

    /// Adopt a round whose end time came from the backend, when the
    /// contract could not be read. Same exactly-once semantics as
    /// [`Self::commit_rollover`]; the next contract poll upgrades the
    /// source.
    pub fn commit_rollover_from_backend(
        &mut self,
        round_id: u64,
        end_timestamp: u64,
    ) -> bool {
        let changed = self.round_identity != Some(round_id);
        self.round_identity = Some(round_id);
        if changed {
            self.contract = None;
            self.static_end = None;
        }
        self.backend = Some(BackendReading {
            round_id,
            end_timestamp,
            server_offset_seconds: self.offset_seconds,
        });
        changed
    }

    /// Adopt a round as the processed one. Returns `true` only when the
    /// identity actually changed, so callers can emit the "new round"
    /// notification exactly once no matter how many checks raced here.
    pub fn commit_rollover(&mut self, round_id: u64, end_timestamp: u64) -> bool {
        let changed = self.round_identity != Some(round_id);
        self.round_identity = Some(round_id);
        self.contract = Some(ContractReading {
            round_id,
            end_timestamp,
        });
        if changed {
            // Readings bound to the previous round are stale now.
            if let Some(backend) = &self.backend
                && backend.round_id != round_id
            {
                self.backend = None;
            }
            self.static_end = None;
        }
        changed
    }
}
