// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime Registry
//!
//! In-memory table of the runtimes this process believes exist. Every handler,
//! the maintenance worker, and orphan reconciliation share one registry.
//! Nothing is persisted: after a restart the table starts empty and leftover
//! containers are removed by reconciliation.
//!
//! Mutations are atomic per key. [`RuntimeRegistry::try_claim`] is the only
//! check-and-set; it is what keeps two concurrent builds of the same runtime
//! from both proceeding.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Current wall-clock time as fractional unix seconds.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Lifecycle status of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Container requested but not yet confirmed runnable.
    Pending,
    /// Runnable. Carries a human-readable label with the build duration.
    Ready(String),
}

impl RuntimeStatus {
    const PENDING: &'static str = "pending";

    /// Ready status labelled with the elapsed build duration, e.g. `Up 1.25s`.
    pub fn ready_after(duration: Duration) -> Self {
        RuntimeStatus::Ready(format!("Up {:.2}s", duration.as_secs_f64()))
    }

    /// Whether the runtime is still being created.
    pub fn is_pending(&self) -> bool {
        matches!(self, RuntimeStatus::Pending)
    }

    /// Status string as reported over the API.
    pub fn as_str(&self) -> &str {
        match self {
            RuntimeStatus::Pending => Self::PENDING,
            RuntimeStatus::Ready(label) => label,
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RuntimeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuntimeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(if s == Self::PENDING {
            RuntimeStatus::Pending
        } else {
            RuntimeStatus::Ready(s)
        })
    }
}

/// One live or being-created runtime container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    /// Registry identifier and container name: `{executor hostname}-{runtime id}`
    pub name: String,
    /// Internal DNS name of the container
    pub hostname: String,
    /// Hex secret required by the runtime's HTTP listener
    #[serde(rename = "key")]
    pub secret: String,
    /// Lifecycle status
    pub status: RuntimeStatus,
    /// Whether the runtime's HTTP port has accepted a connection
    pub listening: bool,
    /// Creation time (unix seconds)
    pub created: f64,
    /// Last activity time (unix seconds)
    pub updated: f64,
}

impl RuntimeDescriptor {
    /// A fresh `Pending` descriptor.
    pub fn pending(
        name: impl Into<String>,
        hostname: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let now = now();
        Self {
            name: name.into(),
            hostname: hostname.into(),
            secret: secret.into(),
            status: RuntimeStatus::Pending,
            listening: false,
            created: now,
            updated: now,
        }
    }

    /// Refresh `updated`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated = self.updated.max(now());
    }
}

/// Concurrent registry of runtime descriptors.
pub struct RuntimeRegistry {
    entries: DashMap<String, RuntimeDescriptor>,
    count: AtomicUsize,
    capacity: usize,
}

impl RuntimeRegistry {
    /// Create a registry holding at most `capacity` runtimes.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a descriptor exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// A copy of the descriptor for `name`.
    pub fn get(&self, name: &str) -> Option<RuntimeDescriptor> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Insert or replace a descriptor.
    pub fn set(&self, descriptor: RuntimeDescriptor) -> Result<()> {
        match self.entries.entry(descriptor.name.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(descriptor);
            }
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                entry.insert(descriptor);
            }
        }
        Ok(())
    }

    /// Atomically insert `descriptor` unless its name is already taken.
    ///
    /// Fails with [`Error::Conflict`] when a descriptor exists, whether it is
    /// still pending or already running.
    pub fn try_claim(&self, descriptor: RuntimeDescriptor) -> Result<()> {
        match self.entries.entry(descriptor.name.clone()) {
            Entry::Occupied(entry) => {
                if entry.get().status.is_pending() {
                    Err(Error::Conflict(
                        "A runtime with the same ID is already being created. Attempt a execution soon."
                            .to_string(),
                    ))
                } else {
                    Err(Error::Conflict("Runtime already exists.".to_string()))
                }
            }
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                entry.insert(descriptor);
                Ok(())
            }
        }
    }

    /// Apply `f` to the descriptor for `name` while holding its entry lock.
    ///
    /// Returns `false` if no descriptor exists.
    pub fn update<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut RuntimeDescriptor),
    {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Refresh `updated` for `name`.
    pub fn touch(&self, name: &str) -> bool {
        self.update(name, RuntimeDescriptor::touch)
    }

    /// Remove the descriptor for `name`. Removing an absent name is a no-op.
    pub fn delete(&self, name: &str) -> Option<RuntimeDescriptor> {
        let removed = self.entries.remove(name).map(|(_, descriptor)| descriptor);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Copy of every descriptor. Not atomic across entries.
    pub fn snapshot(&self) -> Vec<RuntimeDescriptor> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn reserve_slot(&self) -> Result<()> {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                tracing::error!(
                    capacity = self.capacity,
                    "Runtime registry capacity exhausted; OPR_EXECUTOR_MAX_RUNTIMES is set too low for this host"
                );
                Error::RegistryFull(self.capacity)
            })
    }
}
