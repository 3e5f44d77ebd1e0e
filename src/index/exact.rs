//! Exact brute-force KNN index.
//!
//! An in-memory list of `(vector, key)` rows scanned with a bounded
//! max-heap. Potentially faster than `ORDER BY myvector_distance(...)`
//! as long as all vectors fit in memory. Nothing is persisted: build and
//! refresh always start from empty.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};

use crate::checkpoint::LogCoord;
use crate::index::{
    IndexDescriptor, IndexState, QueryRef, SaveMode, VectorElems, VectorIndex,
};

/// A scored row in the bounded heap. Max-heap by distance, insertion
/// sequence breaking ties so the earliest insert wins.
#[derive(Clone, Copy)]
struct Scored {
    key: u64,
    distance: f32,
    seq: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.seq == other.seq
    }
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct ExactIndex {
    desc: IndexDescriptor,
    rows: RwLock<Vec<(Vec<f32>, u64)>>,
    state: Mutex<IndexState>,
    update_ts: AtomicU64,
    coords: Mutex<LogCoord>,
    n_searches: AtomicU64,
}

impl ExactIndex {
    pub fn new(desc: IndexDescriptor) -> Self {
        Self {
            desc,
            rows: RwLock::new(Vec::new()),
            state: Mutex::new(IndexState::Created),
            update_ts: AtomicU64::new(0),
            coords: Mutex::new(LogCoord::sentinel()),
            n_searches: AtomicU64::new(0),
        }
    }
}

impl VectorIndex for ExactIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.desc
    }

    fn state(&self) -> IndexState {
        *self.state.lock()
    }

    fn row_count(&self) -> u64 {
        self.rows.read().len() as u64
    }

    fn is_dirty(&self) -> bool {
        false // nothing to persist
    }

    fn supports_persist(&self) -> bool {
        false
    }

    fn init(&self) -> Result<()> {
        let mut rows = self.rows.write();
        rows.clear();
        self.n_searches.store(0, AtomicOrdering::Relaxed);
        self.update_ts.store(0, AtomicOrdering::Relaxed);
        *self.coords.lock() = LogCoord::sentinel();
        *self.state.lock() = IndexState::Initialized;
        Ok(())
    }

    fn close(&self) {
        *self.state.lock() = IndexState::Closed;
    }

    fn insert(&self, elems: VectorElems, key: u64) -> Result<()> {
        let VectorElems::F32(vec) = elems else {
            return Err(anyhow!("KNN index {} only stores float vectors", self.desc.name));
        };
        if vec.len() != self.desc.dim {
            return Err(anyhow!(
                "KNN index {}: vector dimension {} != {}",
                self.desc.name,
                vec.len(),
                self.desc.dim
            ));
        }

        *self.state.lock() = IndexState::Updating;
        self.rows.write().push((vec, key));
        *self.state.lock() = IndexState::Ready;
        Ok(())
    }

    fn search(&self, query: QueryRef<'_>, n: usize) -> Result<Vec<(u64, f32)>> {
        let QueryRef::F32(q) = query else {
            return Err(anyhow!("KNN index {} searches float vectors", self.desc.name));
        };
        if q.len() != self.desc.dim {
            return Err(anyhow!(
                "KNN index {}: query dimension {} != {}",
                self.desc.name,
                q.len(),
                self.desc.dim
            ));
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        let rows = self.rows.read();
        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(n + 1);

        for (seq, (vec, key)) in rows.iter().enumerate() {
            let distance = self.desc.distance.compute(q, vec)?;
            let entry = Scored {
                key: *key,
                distance,
                seq,
            };
            if heap.len() < n {
                heap.push(entry);
            } else if let Some(worst) = heap.peek() {
                if entry.cmp(worst) == Ordering::Less {
                    heap.pop();
                    heap.push(entry);
                }
            }
        }

        let mut out: Vec<Scored> = heap.into_vec();
        out.sort();
        self.n_searches.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(out.into_iter().map(|s| (s.key, s.distance)).collect())
    }

    fn save(&self, _dir: &Path, _mode: SaveMode) -> Result<()> {
        tracing::warn!(index = %self.desc.name, "KNN memory index - save is a no-op");
        Ok(())
    }

    fn load(&self, _dir: &Path) -> Result<()> {
        tracing::warn!(index = %self.desc.name, "KNN memory index - load is a no-op");
        Ok(())
    }

    fn drop_files(&self, _dir: &Path) -> Result<()> {
        tracing::warn!(index = %self.desc.name, "KNN memory index - drop is a no-op");
        Ok(())
    }

    fn start_parallel_build(&self, _threads: usize) -> bool {
        false
    }

    fn set_update_ts(&self, ts: u64) {
        self.update_ts.store(ts, AtomicOrdering::Relaxed);
    }

    fn update_ts(&self) -> u64 {
        self.update_ts.load(AtomicOrdering::Relaxed)
    }

    fn last_coords(&self) -> LogCoord {
        self.coords.lock().clone()
    }

    fn set_last_coords(&self, coord: LogCoord) {
        *self.coords.lock() = coord;
    }
}
