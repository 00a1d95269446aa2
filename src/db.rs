//! Persistent registry storage.
//!
//! [`StateStore`] keeps VM records in a single redb file so that a restarted
//! supervisor (or the next CLI invocation) sees the same VMs. Records are
//! stored as JSON under their id, together with the registry's insertion
//! sequence number so listing order survives restarts.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::vm::{VmId, VmRecord};

/// VM records keyed by id.
const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    record: VmRecord,
}

/// redb-backed record store.
pub struct StateStore {
    db: Database,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish()
    }
}

impl StateStore {
    /// Open or create the database at `path`.
    ///
    /// Parent directories are created as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;

        // Make sure the table exists so read transactions can open it.
        let txn = db.begin_write()?;
        txn.open_table(VMS)?;
        txn.commit()?;

        tracing::debug!(path = %path.display(), "state store opened");
        Ok(Self { db })
    }

    /// Insert or replace a record.
    pub fn save(&self, seq: u64, record: &VmRecord) -> Result<()> {
        let value = serde_json::to_vec(&StoredRecord {
            seq,
            record: record.clone(),
        })
        .map_err(|e| Error::Storage(format!("failed to encode {}: {}", record.id, e)))?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VMS)?;
            table.insert(record.id.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete a record. Missing ids are ignored.
    pub fn remove(&self, id: &VmId) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VMS)?;
            table.remove(id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All stored records with their sequence numbers, in insertion order.
    pub fn load(&self) -> Result<Vec<(u64, VmRecord)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VMS)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let stored: StoredRecord = serde_json::from_slice(value.value()).map_err(|e| {
                Error::Storage(format!("corrupt record '{}': {}", key.value(), e))
            })?;
            records.push((stored.seq, stored.record));
        }
        records.sort_by_key(|(seq, _)| *seq);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Capacity, ResourceLedger};
    use crate::vm::VmState;

    fn record(ledger: &ResourceLedger, name: &str) -> VmRecord {
        let token = ledger.try_reserve(64, 1).unwrap();
        VmRecord::pending(VmId::generate(), name.to_string(), token)
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.redb");
        let ledger = ResourceLedger::new(Capacity::new(1024, 8));

        let a = record(&ledger, "a");
        let mut b = record(&ledger, "b");
        {
            let store = StateStore::open(&path).unwrap();
            store.save(2, &b).unwrap();
            store.save(1, &a).unwrap();

            b.state = VmState::Failed;
            b.reservation = None;
            store.save(2, &b).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].1.id, a.id);
        assert_eq!(loaded[1].1.id, b.id);
        assert_eq!(loaded[1].1.state, VmState::Failed);
        assert!(loaded[1].1.reservation.is_none());

        store.remove(&a.id).unwrap();
        store.remove(&VmId::from("vm-missing")).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, 2);
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state.redb")).unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
