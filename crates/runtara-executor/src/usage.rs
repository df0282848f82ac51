// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Smoothed resource usage for the host and each runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;

/// First-order exponential smoothing with factor 0.5.
pub fn smooth(previous: Option<f64>, reading: f64) -> f64 {
    match previous {
        Some(old) => (old + reading) / 2.0,
        None => reading,
    }
}

/// Concurrent store of smoothed usage samples.
#[derive(Default)]
pub struct UsageStore {
    host: Mutex<Option<f64>>,
    runtimes: DashMap<String, f64>,
}

impl UsageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a host reading into the host sample.
    pub fn record_host(&self, reading: f64) {
        if let Ok(mut host) = self.host.lock() {
            *host = Some(smooth(*host, reading));
        }
    }

    /// Fold a reading into the sample for one runtime.
    pub fn record_runtime(&self, name: &str, reading: f64) {
        self.runtimes
            .entry(name.to_string())
            .and_modify(|sample| *sample = smooth(Some(*sample), reading))
            .or_insert(reading);
    }

    /// Drop samples for runtimes not contained in `live`.
    pub fn retain_runtimes(&self, live: &HashMap<String, f64>) {
        self.runtimes.retain(|name, _| live.contains_key(name));
    }

    /// Current host sample.
    pub fn host(&self) -> Option<f64> {
        self.host.lock().ok().and_then(|host| *host)
    }

    /// Current sample for one runtime.
    pub fn runtime(&self, name: &str) -> Option<f64> {
        self.runtimes.get(name).map(|sample| *sample)
    }

    /// Copy of all runtime samples.
    pub fn runtimes(&self) -> HashMap<String, f64> {
        self.runtimes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
