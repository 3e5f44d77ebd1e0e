//! Named-index registry.
//!
//! One mutex-guarded map owns every live index. [`Registry::get`] hands
//! out an [`IndexLease`] with the index's shared lock already held; the
//! lease releases on drop, so there is no manual unlock discipline.
//! [`Registry::close`] upgrades to the exclusive lock, draining readers
//! before the index is unlinked and destroyed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::checkpoint::SENTINEL_LOG_FILE;
use crate::index::{self, VectorIndex};

type Slot = Arc<RwLock<Box<dyn VectorIndex>>>;

/// Shared-lock lease over a live index. Holding a lease keeps the index
/// alive and blocks `close`/`drop` until every lease is released.
///
/// Do not call back into the registry for the same index while holding
/// its lease; a pending exclusive lock would deadlock the thread.
pub struct IndexLease {
    guard: ArcRwLockReadGuard<RawRwLock, Box<dyn VectorIndex>>,
}

impl IndexLease {
    fn slot(&self) -> Slot {
        Arc::clone(ArcRwLockReadGuard::rwlock(&self.guard))
    }
}

impl std::ops::Deref for IndexLease {
    type Target = dyn VectorIndex;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

#[derive(Default)]
pub struct Registry {
    indexes: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or return the already-open) index under `name`. An open for
    /// an existing name hands back the existing entry unchanged.
    pub fn open(&self, name: &str, options: &str, action: &str) -> Result<IndexLease> {
        let slot = {
            let mut map = self.indexes.lock();
            if let Some(existing) = map.get(name) {
                Arc::clone(existing)
            } else {
                tracing::debug!(index = name, options, action, "opening new index");
                let index = index::open_index(name, options)?;
                let slot: Slot = Arc::new(RwLock::new(index));
                map.insert(name.to_string(), Arc::clone(&slot));
                slot
            }
        };
        Ok(IndexLease {
            guard: slot.read_arc(),
        })
    }

    /// Look up a live index, acquiring its shared lock.
    pub fn get(&self, name: &str) -> Option<IndexLease> {
        let slot = {
            let map = self.indexes.lock();
            match map.get(name) {
                Some(slot) => Arc::clone(slot),
                None => {
                    tracing::error!(index = name, "index not found");
                    return None;
                }
            }
        };
        Some(IndexLease {
            guard: slot.read_arc(),
        })
    }

    /// Close an index: release the caller's lease, drain remaining
    /// readers under the exclusive lock, unlink, and destroy.
    pub fn close(&self, lease: IndexLease) {
        let slot = lease.slot();
        let name = lease.name().to_string();

        // The map stays locked for the whole teardown so a concurrent
        // `get` cannot lease the index between drain and unlink.
        let mut map = self.indexes.lock();
        drop(lease);
        let exclusive = slot.write();
        exclusive.close();
        map.remove(&name);
        drop(exclusive);
        tracing::debug!(index = %name, "index closed and unlinked");
    }

    /// Survey live online indexes for the lexicographically smallest
    /// binlog file coordinate. Returns `None` when no online index has a
    /// real (non-sentinel) coordinate; the CDC consumer then starts from
    /// the host's current log.
    pub fn earliest_tracked_log_file(&self) -> Option<String> {
        let slots: Vec<Slot> = self.indexes.lock().values().cloned().collect();

        let mut earliest: Option<String> = None;
        for slot in slots {
            let index = slot.read();
            if !index.supports_incr_updates() {
                continue;
            }
            let file = index.last_coords().file;
            match &earliest {
                Some(current) if *current <= file => {}
                _ => earliest = Some(file),
            }
        }

        match earliest {
            Some(file) if file != SENTINEL_LOG_FILE => {
                tracing::debug!(file = %file, "earliest tracked binlog file");
                Some(file)
            }
            _ => None,
        }
    }

    /// Names of all live indexes, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.indexes.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.indexes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.lock().is_empty()
    }
}
