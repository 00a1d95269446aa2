//! VM registry.
//!
//! The registry is pure storage: a table of [`VmRecord`]s keyed by id,
//! listed in insertion order, guarded by one lock. It holds no lifecycle
//! rules; the engine passes closures to [`VmRegistry::update`] that decide
//! whether a change is allowed while the lock is held.
//!
//! When a [`StateStore`] is attached, every mutation is written to disk
//! before the in-memory table changes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::db::StateStore;
use crate::error::{Error, Result};
use crate::vm::{VmId, VmRecord, VmState};

/// What happens to records once they reach Destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep every tombstone.
    #[default]
    Unbounded,
    /// Keep the N most recently destroyed tombstones.
    Keep(usize),
    /// Drop records as soon as they are destroyed.
    #[serde(rename = "none")]
    Discard,
}

/// Selects records for [`VmRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only records in this state.
    pub state: Option<VmState>,
    /// Only records with this exact name.
    pub name: Option<String>,
    /// Drop Destroyed tombstones from the result.
    pub exclude_destroyed: bool,
}

impl ListFilter {
    /// Only records in `state`.
    pub fn state(state: VmState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Only live (non-destroyed) records.
    pub fn live() -> Self {
        Self {
            exclude_destroyed: true,
            ..Self::default()
        }
    }

    fn matches(&self, record: &VmRecord) -> bool {
        if self.exclude_destroyed && record.state == VmState::Destroyed {
            return false;
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &record.name != name {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<VmId, (u64, VmRecord)>,
    order: BTreeMap<u64, VmId>,
    next_seq: u64,
}

/// Thread-safe table of VM records.
#[derive(Debug)]
pub struct VmRegistry {
    inner: RwLock<RegistryInner>,
    store: Option<StateStore>,
    retention: RetentionPolicy,
    /// Saves left before every later save fails.
    #[cfg(test)]
    saves_left: parking_lot::Mutex<Option<usize>>,
}

impl VmRegistry {
    /// Create an in-memory registry.
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            store: None,
            retention,
            #[cfg(test)]
            saves_left: parking_lot::Mutex::new(None),
        }
    }

    /// Create a registry backed by `store`, loading the records it holds.
    ///
    /// Records are loaded exactly as persisted; reconciling transient states
    /// is the engine's job.
    pub fn open(store: StateStore, retention: RetentionPolicy) -> Result<Self> {
        let mut inner = RegistryInner::default();
        for (seq, record) in store.load()? {
            tracing::debug!(vm_id = %record.id, state = %record.state, "loaded VM record");
            inner.order.insert(seq, record.id.clone());
            inner.records.insert(record.id.clone(), (seq, record));
            inner.next_seq = inner.next_seq.max(seq + 1);
        }

        Ok(Self {
            inner: RwLock::new(inner),
            store: Some(store),
            retention,
            #[cfg(test)]
            saves_left: parking_lot::Mutex::new(None),
        })
    }

    /// Whether records are persisted.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Add a new record.
    ///
    /// Fails if a record with the same id exists.
    pub(crate) fn insert(&self, record: VmRecord) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.records.contains_key(&record.id) {
            return Err(Error::InternalFault(format!(
                "VM id collision: {}",
                record.id
            )));
        }

        let seq = inner.next_seq;
        self.save(seq, &record)?;

        tracing::debug!(vm_id = %record.id, name = %record.name, "registering VM");
        inner.next_seq += 1;
        inner.order.insert(seq, record.id.clone());
        inner.records.insert(record.id.clone(), (seq, record));
        Ok(())
    }

    /// Get a copy of a record.
    pub fn get(&self, id: &VmId) -> Result<VmRecord> {
        self.inner
            .read()
            .records
            .get(id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Apply `f` to a record under the registry lock.
    ///
    /// `f` works on a copy. If it returns `Ok`, the copy is persisted and
    /// replaces the stored record; if it returns `Err` or the save fails,
    /// nothing changes.
    pub(crate) fn update<T, F>(&self, id: &VmId, f: F) -> Result<T>
    where
        F: FnOnce(&mut VmRecord) -> Result<T>,
    {
        self.apply(id, f, false).map(|(value, _)| value)
    }

    /// Like [`update`](Self::update), but a change that cannot be saved is
    /// still applied in memory. The save error comes back with the value.
    ///
    /// For changes that must not be lost, such as giving up a reservation.
    pub(crate) fn force_update<T, F>(&self, id: &VmId, f: F) -> Result<(T, Option<Error>)>
    where
        F: FnOnce(&mut VmRecord) -> Result<T>,
    {
        self.apply(id, f, true)
    }

    fn apply<T, F>(&self, id: &VmId, f: F, keep_unsaved: bool) -> Result<(T, Option<Error>)>
    where
        F: FnOnce(&mut VmRecord) -> Result<T>,
    {
        let mut inner = self.inner.write();
        let (seq, current) = inner
            .records
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let seq = *seq;

        let mut next = current.clone();
        let value = f(&mut next)?;

        let unsaved = match self.save(seq, &next) {
            Ok(()) => None,
            Err(e) if keep_unsaved => Some(e),
            Err(e) => return Err(e),
        };
        inner.records.insert(id.clone(), (seq, next));
        Ok((value, unsaved))
    }

    fn save(&self, seq: u64, record: &VmRecord) -> Result<()> {
        #[cfg(test)]
        self.take_save()?;

        match &self.store {
            Some(store) => store.save(seq, record),
            None => Ok(()),
        }
    }

    /// Let `n` more saves through, then fail every save after them.
    #[cfg(test)]
    pub(crate) fn fail_saves_after(&self, n: usize) {
        *self.saves_left.lock() = Some(n);
    }

    #[cfg(test)]
    fn take_save(&self) -> Result<()> {
        match self.saves_left.lock().as_mut() {
            Some(0) => Err(Error::Storage("disk full".into())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Records matching `filter`, in insertion order.
    pub fn list(&self, filter: &ListFilter) -> Vec<VmRecord> {
        let inner = self.inner.read();
        inner
            .order
            .values()
            .filter_map(|id| inner.records.get(id))
            .map(|(_, record)| record)
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict tombstones according to the retention policy.
    ///
    /// Returns the ids that were removed.
    pub(crate) fn apply_retention(&self) -> Result<Vec<VmId>> {
        let mut inner = self.inner.write();

        let mut tombstones: Vec<(VmId, chrono::DateTime<chrono::Utc>)> = inner
            .records
            .values()
            .filter(|(_, r)| r.state == VmState::Destroyed)
            .map(|(_, r)| (r.id.clone(), r.last_transition_at))
            .collect();

        let keep = match self.retention {
            RetentionPolicy::Unbounded => return Ok(Vec::new()),
            RetentionPolicy::Keep(n) => n,
            RetentionPolicy::Discard => 0,
        };
        if tombstones.len() <= keep {
            return Ok(Vec::new());
        }

        // Newest first; everything past `keep` goes.
        tombstones.sort_by(|a, b| b.1.cmp(&a.1));
        let evicted: Vec<VmId> = tombstones.into_iter().skip(keep).map(|(id, _)| id).collect();

        for id in &evicted {
            if let Some(store) = &self.store {
                store.remove(id)?;
            }
            if let Some((seq, _)) = inner.records.remove(id) {
                inner.order.remove(&seq);
            }
            tracing::debug!(vm_id = %id, "evicted tombstone");
        }
        Ok(evicted)
    }
}
