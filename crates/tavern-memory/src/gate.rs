//! [`RunGate`] – the per-tenant "is-running" consolidation gate.
//!
//! The gate is mutual exclusion over the *right to consolidate*, not a lock
//! over any data: appends to the short-term log never touch it.  A run holds
//! a [`RunPermit`] for its whole duration; the state machine is
//!
//! ```text
//! Idle ──try_acquire──▶ Running ──complete──▶ Idle
//!   ▲                      │
//!   │                      └──fail / drop──▶ Failed
//!   └──────────try_acquire (retry)─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tavern_memory::gate::RunGate;
//! use tavern_types::RunState;
//!
//! let gate = Arc::new(RunGate::new());
//! let permit = gate.try_acquire().expect("idle gate");
//! assert!(gate.try_acquire().is_none()); // single flight
//! permit.complete();
//! assert_eq!(gate.state(), RunState::Idle);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tavern_types::RunState;
use tracing::warn;

/// Per-tenant consolidation state guarded by a mutex.
#[derive(Debug)]
pub struct RunGate {
    state: Mutex<RunState>,
}

impl RunGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Current state (a copy; may be stale immediately).
    pub fn state(&self) -> RunState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.lock() == RunState::Running
    }

    /// Transition to `Running` unless a run is already active.
    ///
    /// Returns `None` when another run holds the gate; the caller's trigger
    /// is thereby coalesced into the active run.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        let mut state = self.lock();
        if *state == RunState::Running {
            return None;
        }
        *state = RunState::Running;
        Some(RunPermit {
            gate: Arc::clone(self),
            released: false,
        })
    }

    fn set(&self, next: RunState) {
        *self.lock() = next;
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RunGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the holder is the one active consolidation run for a tenant.
///
/// Dropping a permit without calling [`complete`][RunPermit::complete] or
/// [`fail`][RunPermit::fail] (e.g. because the run future was cancelled)
/// leaves the gate in `Failed`, so the next trigger can retry.
#[derive(Debug)]
pub struct RunPermit {
    gate: Arc<RunGate>,
    released: bool,
}

impl RunPermit {
    /// Finish the run successfully: `Running → Idle`.
    pub fn complete(mut self) {
        self.released = true;
        self.gate.set(RunState::Idle);
    }

    /// Abort the run: `Running → Failed`.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.released = true;
        self.gate.set(RunState::Failed {
            reason: reason.into(),
        });
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if !self.released {
            warn!("consolidation permit dropped mid-run; marking gate failed");
            self.gate.set(RunState::Failed {
                reason: "run cancelled before completion".to_string(),
            });
        }
    }
}
