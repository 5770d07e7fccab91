use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{
        Mutex,
        OwnedMutexGuard,
    },
    time,
};

/// Mutual exclusion over the rollover-handling routine and any
/// transaction-triggered refresh, so the two never overlap.
///
/// Single-flag semantics: `try_begin` either hands out the one guard or
/// reports that a cycle is already running. The guard releases on drop;
/// callers that finished a cycle call [`RefreshGuard::settle`] instead,
/// which holds the flag through a short delay to absorb backend
/// eventual-consistency lag before releasing.
#[derive(Clone)]
pub struct RefreshCoordinator {
    flag: Arc<Mutex<()>>,
    settle_delay: Duration,
}

impl RefreshCoordinator {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            flag: Arc::new(Mutex::new(())),
            settle_delay,
        }
    }

    /// Non-blocking acquire. `None` means a cycle is already in flight.
    pub fn try_begin(&self) -> Option<RefreshGuard> {
        let permit = self.flag.clone().try_lock_owned().ok()?;
        Some(RefreshGuard {
            _permit: permit,
            settle_delay: self.settle_delay,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.flag.try_lock().is_err()
    }
}

pub struct RefreshGuard {
    _permit: OwnedMutexGuard<()>,
    settle_delay: Duration,
}

impl RefreshGuard {
    /// Hold the flag through the settling delay, then release.
    pub async fn settle(self) {
        time::sleep(self.settle_delay).await;
    }
}
