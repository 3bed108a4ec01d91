use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{GridTxError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreloadState {
    Pending,
    Started,
    Failed(String),
}

/// One-shot signal raised by the rebalancer once it has started.
///
/// The gateway waits on it before admitting an operation, so nothing runs
/// against a cache whose initial partition ownership is not established.
pub struct PreloadSignal {
    state: Mutex<PreloadState>,
    cond: Condvar,
}

impl PreloadSignal {
    /// Creates a signal that still has to be completed.
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(PreloadState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Creates an already completed signal.
    pub fn completed() -> Self {
        Self {
            state: Mutex::new(PreloadState::Started),
            cond: Condvar::new(),
        }
    }

    /// Marks the preloader as started and wakes every waiter.
    ///
    /// Has no effect once the signal completed or failed.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if *state == PreloadState::Pending {
            *state = PreloadState::Started;
            info!("Cache preloader started");
            self.cond.notify_all();
        }
    }

    /// Marks the preloader as failed; every current and future waiter gets
    /// `GridTxError::PreloadFailed`.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if *state == PreloadState::Pending {
            let reason = reason.into();
            warn!("Cache preloader failed to start: {}", reason);
            *state = PreloadState::Failed(reason);
            self.cond.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.lock() != PreloadState::Pending
    }

    /// Blocks until the signal completes, fails, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match &*state {
                PreloadState::Started => return Ok(()),
                PreloadState::Failed(reason) => {
                    return Err(GridTxError::PreloadFailed(reason.clone()));
                }
                PreloadState::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && *state == PreloadState::Pending
                    {
                        return Err(GridTxError::PreloadFailed(
                            "timed out waiting for preloader start".to_string(),
                        ));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}
