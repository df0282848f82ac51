// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout budget shared by the phases of one request.
//!
//! A [`TimeoutBudget`] is created from the caller's timeout and passed by
//! `&mut` through each phase. A phase charges the wall-clock time it used when
//! it ends, so the next phase only waits for what is left.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Cadence of every readiness poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Remaining time for a multi-phase operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    remaining: Duration,
}

impl TimeoutBudget {
    /// Budget of `total`.
    pub fn new(total: Duration) -> Self {
        Self { remaining: total }
    }

    /// Budget of `secs` whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Time left.
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// True once nothing is left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_zero()
    }

    /// Subtract the time elapsed since `started`.
    pub fn charge(&mut self, started: Instant) {
        self.remaining = self.remaining.saturating_sub(started.elapsed());
    }

    /// Poll `probe` every [`POLL_INTERVAL`] until it yields a value.
    ///
    /// The probe runs at least once. `Ok(None)` means "not yet"; an error
    /// aborts the loop. When the budget runs out the loop fails with
    /// [`Error::Timeout`] carrying `timeout_message`. Time spent is charged in
    /// every case.
    pub async fn poll<T, F, Fut>(&mut self, timeout_message: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let outcome = loop {
            match probe().await {
                Ok(Some(value)) => break Ok(value),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            if started.elapsed() >= self.remaining {
                break Err(Error::Timeout(timeout_message.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        self.charge(started);
        outcome
    }
}
