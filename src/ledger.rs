//! Host capacity accounting.
//!
//! The [`ResourceLedger`] tracks how much memory and how many vCPUs the host
//! offers and how much of that is currently claimed by VMs. A claim is
//! represented by a [`ReservationToken`] that must be released exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Memory and vCPU amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Virtual CPUs.
    pub vcpus: u32,
}

impl Capacity {
    /// Create a capacity value.
    pub fn new(memory_mb: u64, vcpus: u32) -> Self {
        Self { memory_mb, vcpus }
    }
}

/// A committed claim on host capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    id: u64,
    memory_mb: u32,
    vcpus: u32,
}

impl ReservationToken {
    /// Memory held by this reservation, in MiB.
    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    /// vCPUs held by this reservation.
    pub fn vcpus(&self) -> u32 {
        self.vcpus
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denied {
    /// Not enough free memory.
    #[error("insufficient memory (requested {requested} MiB, available {available} MiB)")]
    InsufficientMemory {
        /// Requested MiB.
        requested: u32,
        /// Free MiB at the time of the request.
        available: u64,
    },
    /// Not enough free vCPUs.
    #[error("insufficient vCPUs (requested {requested}, available {available})")]
    InsufficientVcpu {
        /// Requested vCPUs.
        requested: u32,
        /// Free vCPUs at the time of the request.
        available: u32,
    },
}

/// Misuse of the ledger by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LedgerFault {
    /// The token is not outstanding (already released or never issued).
    #[error("reservation {0} released twice or never issued")]
    DoubleRelease(u64),
    /// A restored token is already outstanding.
    #[error("reservation {0} restored twice")]
    DuplicateToken(u64),
}

/// Why a persisted reservation could not be re-committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RestoreError {
    /// The reservation no longer fits the host.
    #[error(transparent)]
    Denied(#[from] Denied),
    /// The token was already restored.
    #[error(transparent)]
    Fault(#[from] LedgerFault),
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerUsage {
    /// Total host capacity.
    pub capacity: Capacity,
    /// Sum of outstanding reservations.
    pub reserved: Capacity,
    /// `capacity - reserved`.
    pub available: Capacity,
    /// Number of outstanding reservations.
    pub reservations: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    reserved: Capacity,
    outstanding: HashMap<u64, ReservationToken>,
    next_id: u64,
}

/// Tracks host capacity and outstanding reservations.
///
/// Every operation takes one short critical section; nothing here suspends.
#[derive(Debug)]
pub struct ResourceLedger {
    capacity: Capacity,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    /// Create a ledger for a host with the given capacity.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            state: Mutex::new(LedgerState {
                next_id: 1,
                ..LedgerState::default()
            }),
        }
    }

    /// Total host capacity.
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Reserve memory and vCPUs atomically.
    ///
    /// Either both budgets admit the request and a token is returned, or
    /// nothing is committed. Memory is checked before vCPUs.
    pub fn try_reserve(&self, memory_mb: u32, vcpus: u32) -> Result<ReservationToken, Denied> {
        let mut state = self.state.lock();
        let id = state.next_id;
        let token = ReservationToken {
            id,
            memory_mb,
            vcpus,
        };
        Self::admit(self.capacity, &mut state, token)?;
        state.next_id += 1;
        Ok(token)
    }

    /// Re-commit a reservation that was issued by an earlier process.
    ///
    /// Used when loading persisted records. Fails if the token no longer
    /// fits (for example after capacity was lowered) or is already held.
    pub fn restore(&self, token: ReservationToken) -> Result<(), RestoreError> {
        let mut state = self.state.lock();
        if state.outstanding.contains_key(&token.id) {
            return Err(LedgerFault::DuplicateToken(token.id).into());
        }
        Self::admit(self.capacity, &mut state, token)?;
        state.next_id = state.next_id.max(token.id + 1);
        Ok(())
    }

    /// Return a reservation's capacity to the pool.
    pub fn release(&self, token: ReservationToken) -> Result<(), LedgerFault> {
        let mut state = self.state.lock();
        let held = state
            .outstanding
            .remove(&token.id)
            .ok_or(LedgerFault::DoubleRelease(token.id))?;
        state.reserved.memory_mb -= u64::from(held.memory_mb);
        state.reserved.vcpus -= held.vcpus;
        Ok(())
    }

    /// Current usage.
    pub fn usage(&self) -> LedgerUsage {
        let state = self.state.lock();
        LedgerUsage {
            capacity: self.capacity,
            reserved: state.reserved,
            available: Capacity {
                memory_mb: self.capacity.memory_mb - state.reserved.memory_mb,
                vcpus: self.capacity.vcpus - state.reserved.vcpus,
            },
            reservations: state.outstanding.len(),
        }
    }

    fn admit(
        capacity: Capacity,
        state: &mut LedgerState,
        token: ReservationToken,
    ) -> Result<(), Denied> {
        let free_mem = capacity.memory_mb - state.reserved.memory_mb;
        if u64::from(token.memory_mb) > free_mem {
            return Err(Denied::InsufficientMemory {
                requested: token.memory_mb,
                available: free_mem,
            });
        }

        let free_cpus = capacity.vcpus - state.reserved.vcpus;
        if token.vcpus > free_cpus {
            return Err(Denied::InsufficientVcpu {
                requested: token.vcpus,
                available: free_cpus,
            });
        }

        state.reserved.memory_mb += u64::from(token.memory_mb);
        state.reserved.vcpus += token.vcpus;
        state.outstanding.insert(token.id, token);
        Ok(())
    }
}
