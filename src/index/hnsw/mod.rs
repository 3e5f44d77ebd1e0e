//! HNSW index: graph, staging, and persistence glued behind the
//! [`VectorIndex`] capability surface.
//!
//! Writers serialize on the graph's write lock while searchers share the
//! read side. Bulk builds stage rows into a batch; every
//! [`PARALLEL_BUILD_BATCH`] rows the batch is flushed through a dedicated
//! rayon pool, and the final partial batch is flushed serially by the
//! closing save.

pub mod graph;
mod node;
mod persist;
mod visited;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

pub use graph::{Graph, HnswError};

use crate::checkpoint::{Checkpoint, LogCoord};
use crate::index::{
    IndexDescriptor, IndexState, QueryRef, SaveMode, VectorElems, VectorIndex,
};

/// Rows staged before parallel workers are engaged.
pub const PARALLEL_BUILD_BATCH: usize = 100_000;

struct Staging {
    active: bool,
    batch: Vec<(VectorElems, u64)>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

pub struct HnswIndex {
    desc: IndexDescriptor,
    graph: RwLock<Graph>,
    staging: Mutex<Staging>,
    state: Mutex<IndexState>,
    dirty: AtomicBool,
    update_ts: AtomicU64,
    coords: Mutex<LogCoord>,
    /// Rows already durable on disk (snapshot + completed frames).
    persisted_rows: Mutex<usize>,
}

impl HnswIndex {
    pub fn new(desc: IndexDescriptor) -> Self {
        let graph = Graph::new(
            desc.kind.vector_kind(),
            desc.dim,
            desc.distance,
            desc.capacity,
            desc.m,
            desc.ef_construction,
        );
        Self {
            desc,
            graph: RwLock::new(graph),
            staging: Mutex::new(Staging {
                active: false,
                batch: Vec::new(),
                pool: None,
            }),
            state: Mutex::new(IndexState::Created),
            dirty: AtomicBool::new(false),
            update_ts: AtomicU64::new(0),
            coords: Mutex::new(LogCoord::sentinel()),
            persisted_rows: Mutex::new(0),
        }
    }

    fn paths(&self, dir: &Path) -> persist::PersistPaths {
        persist::PersistPaths::new(dir, &self.desc.name)
    }

    fn current_checkpoint(&self) -> Checkpoint {
        if self.desc.online {
            Checkpoint::LogCoord(self.coords.lock().clone())
        } else {
            Checkpoint::Timestamp(self.update_ts.load(AtomicOrdering::Relaxed))
        }
    }

    fn restore_checkpoint(&self, checkpoint: Checkpoint) {
        match checkpoint {
            Checkpoint::Timestamp(ts) => {
                tracing::debug!(index = %self.desc.name, ts, "restored timestamp checkpoint");
                self.update_ts.store(ts, AtomicOrdering::Relaxed);
            }
            Checkpoint::LogCoord(coord) => {
                tracing::debug!(index = %self.desc.name, %coord, "restored binlog checkpoint");
                *self.coords.lock() = coord;
            }
        }
    }

    /// Drain the final partial batch before a save. Small by
    /// construction: full batches were flushed by the pool already.
    fn flush_staged_serial(&self) -> Result<()> {
        let batch = {
            let mut staging = self.staging.lock();
            if !staging.active || staging.batch.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut staging.batch)
        };
        tracing::debug!(index = %self.desc.name, rows = batch.len(), "flushing final batch serially");
        let mut graph = self.graph.write();
        for (elems, key) in &batch {
            graph.insert(elems, *key)?;
        }
        Ok(())
    }

    /// Flush a full staging batch through the build pool. Workers claim
    /// rows via work stealing and call the single-vector insert; the
    /// first failure aborts the batch and resurfaces after the join.
    fn flush_batch_parallel(
        &self,
        batch: Vec<(VectorElems, u64)>,
        pool: Arc<rayon::ThreadPool>,
    ) -> Result<()> {
        tracing::debug!(index = %self.desc.name, rows = batch.len(), "flushing batch in parallel");
        pool.install(|| {
            batch
                .par_iter()
                .try_for_each(|(elems, key)| -> Result<()> {
                    self.graph.write().insert(elems, *key)?;
                    Ok(())
                })
        })
        .with_context(|| format!("parallel build of index {}", self.desc.name))
    }
}

impl VectorIndex for HnswIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.desc
    }

    fn state(&self) -> IndexState {
        *self.state.lock()
    }

    fn row_count(&self) -> u64 {
        self.graph.read().len() as u64
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(AtomicOrdering::Relaxed)
    }

    fn supports_persist(&self) -> bool {
        true
    }

    fn init(&self) -> Result<()> {
        tracing::debug!(
            index = %self.desc.name,
            dim = self.desc.dim,
            size = self.desc.capacity,
            ef = self.desc.ef_construction,
            m = self.desc.m,
            "hnsw init"
        );
        *self.graph.write() = Graph::new(
            self.desc.kind.vector_kind(),
            self.desc.dim,
            self.desc.distance,
            self.desc.capacity,
            self.desc.m,
            self.desc.ef_construction,
        );
        {
            let mut staging = self.staging.lock();
            staging.active = false;
            staging.batch.clear();
            staging.pool = None;
        }
        *self.coords.lock() = LogCoord::sentinel();
        self.update_ts.store(0, AtomicOrdering::Relaxed);
        self.dirty.store(false, AtomicOrdering::Relaxed);
        *self.persisted_rows.lock() = 0;
        *self.state.lock() = IndexState::Initialized;
        Ok(())
    }

    fn close(&self) {
        *self.state.lock() = IndexState::Closed;
    }

    fn insert(&self, elems: VectorElems, key: u64) -> Result<()> {
        let full_batch = {
            let mut staging = self.staging.lock();
            if staging.active {
                staging.batch.push((elems, key));
                if staging.batch.len() >= PARALLEL_BUILD_BATCH {
                    let batch = std::mem::take(&mut staging.batch);
                    let pool = staging
                        .pool
                        .clone()
                        .ok_or_else(|| anyhow!("parallel build without a pool"))?;
                    Some((batch, pool))
                } else {
                    None
                }
            } else {
                drop(staging);
                *self.state.lock() = IndexState::Updating;
                let result = self.graph.write().insert(&elems, key);
                *self.state.lock() = IndexState::Ready;
                result?;
                None
            }
        };

        if let Some((batch, pool)) = full_batch {
            self.flush_batch_parallel(batch, pool)?;
        }

        self.dirty.store(true, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn search(&self, query: QueryRef<'_>, n: usize) -> Result<Vec<(u64, f32)>> {
        let graph = self.graph.read();
        Ok(graph.search_knn(query, n, self.desc.ef_search)?)
    }

    fn save(&self, dir: &Path, mode: SaveMode) -> Result<()> {
        self.flush_staged_serial()?;

        *self.state.lock() = IndexState::Checkpointing;
        let result = (|| -> Result<()> {
            let graph = self.graph.read();
            let checkpoint = self.current_checkpoint();
            let paths = self.paths(dir);
            let mut persisted = self.persisted_rows.lock();

            match mode {
                SaveMode::Build => {
                    persist::save_full(&graph, &checkpoint, self.desc.distance, &paths)
                        .with_context(|| format!("saving index {}", self.desc.name))?;
                    *persisted = graph.len();
                }
                SaveMode::Checkpoint | SaveMode::Refresh => {
                    if graph.len() == *persisted && paths.index.exists() {
                        tracing::warn!(
                            index = %self.desc.name,
                            "no rows since last checkpoint, save skipped"
                        );
                        return Ok(());
                    }
                    if !paths.index.exists() {
                        // Nothing to append onto: degrade to a full write.
                        persist::save_full(&graph, &checkpoint, self.desc.distance, &paths)
                            .with_context(|| format!("saving index {}", self.desc.name))?;
                    } else {
                        persist::append_checkpoint(&graph, *persisted, &checkpoint, &paths)
                            .with_context(|| format!("checkpointing index {}", self.desc.name))?;
                    }
                    *persisted = graph.len();
                }
            }
            tracing::info!(
                index = %self.desc.name,
                rows = graph.len(),
                checkpoint = %checkpoint,
                ?mode,
                "index saved"
            );
            Ok(())
        })();

        {
            let mut staging = self.staging.lock();
            staging.active = false;
            staging.pool = None;
        }
        if result.is_ok() {
            self.dirty.store(false, AtomicOrdering::Relaxed);
        }
        *self.state.lock() = IndexState::Ready;
        result
    }

    fn load(&self, dir: &Path) -> Result<()> {
        let paths = self.paths(dir);
        match persist::load(&self.desc, &paths) {
            Ok(Some(loaded)) => {
                let rows = loaded.graph.len();
                *self.graph.write() = loaded.graph;
                *self.persisted_rows.lock() = rows;
                self.restore_checkpoint(loaded.checkpoint);
                self.dirty.store(false, AtomicOrdering::Relaxed);
                *self.state.lock() = IndexState::Ready;
                tracing::info!(index = %self.desc.name, rows, "hnsw index loaded");
                Ok(())
            }
            Ok(None) => {
                tracing::info!(index = %self.desc.name, "no disk files, initializing empty");
                self.init()
            }
            Err(e) => {
                // Corrupt files must not take the engine down: start over
                // empty and let the operator rebuild.
                tracing::warn!(index = %self.desc.name, error = %e, "error loading hnsw index, reinitializing");
                self.init()
            }
        }
    }

    fn drop_files(&self, dir: &Path) -> Result<()> {
        self.paths(dir).remove_all();
        *self.graph.write() = Graph::new(
            self.desc.kind.vector_kind(),
            self.desc.dim,
            self.desc.distance,
            self.desc.capacity,
            self.desc.m,
            self.desc.ef_construction,
        );
        *self.persisted_rows.lock() = 0;
        self.dirty.store(false, AtomicOrdering::Relaxed);
        *self.state.lock() = IndexState::Created;
        Ok(())
    }

    fn start_parallel_build(&self, threads: usize) -> bool {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("myvector-build-{i}"))
            .build()
        {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                tracing::error!(index = %self.desc.name, error = %e, "cannot build parallel pool");
                return false;
            }
        };

        let mut staging = self.staging.lock();
        staging.active = true;
        staging.batch.clear();
        staging.pool = Some(pool);
        *self.state.lock() = IndexState::Building;
        true
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
        tracing::debug!(index = %self.desc.name, %coord, "set last update coordinates");
        *self.coords.lock() = coord;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::Distance;
    use crate::index::IndexKind;
    use tempfile::tempdir;

    fn descriptor(name: &str, online: bool) -> IndexDescriptor {
        IndexDescriptor {
            name: name.to_string(),
            kind: IndexKind::Hnsw,
            dim: 8,
            distance: Distance::L2,
            capacity: 10_000,
            m: 8,
            ef_construction: 50,
            ef_search: 50,
            online,
            track: None,
            threads: 0,
        }
    }

    fn unit_vec(i: usize) -> VectorElems {
        let mut v = vec![0.0f32; 8];
        v[i % 8] = 1.0 + (i / 8) as f32;
        VectorElems::F32(v)
    }

    #[test]
    fn save_build_then_load_identical_results() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.v", false));
        idx.init().unwrap();
        for i in 0..64 {
            idx.insert(unit_vec(i), i as u64).unwrap();
        }
        idx.set_update_ts(1_700_000_000);
        idx.save(dir.path(), SaveMode::Build).unwrap();

        let query = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let before = idx.search(QueryRef::F32(&query), 5).unwrap();

        let reloaded = HnswIndex::new(descriptor("test.t.v", false));
        reloaded.load(dir.path()).unwrap();
        assert_eq!(reloaded.row_count(), 64);
        assert_eq!(reloaded.update_ts(), 1_700_000_000);
        let after = reloaded.search(QueryRef::F32(&query), 5).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn checkpoint_appends_replay_on_load() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.chk", true));
        idx.init().unwrap();

        for i in 0..20 {
            idx.insert(unit_vec(i), i as u64).unwrap();
        }
        idx.set_last_coords(LogCoord::new("binlog.000001", 512));
        idx.save(dir.path(), SaveMode::Build).unwrap();

        for i in 20..30 {
            idx.insert(unit_vec(i), i as u64).unwrap();
        }
        idx.set_last_coords(LogCoord::new("binlog.000002", 4));
        idx.save(dir.path(), SaveMode::Checkpoint).unwrap();

        let reloaded = HnswIndex::new(descriptor("test.t.chk", true));
        reloaded.load(dir.path()).unwrap();
        assert_eq!(reloaded.row_count(), 30);
        assert_eq!(reloaded.last_coords(), LogCoord::new("binlog.000002", 4));

        // Every inserted key must be findable after replay.
        for i in 0..30usize {
            let VectorElems::F32(q) = unit_vec(i) else { unreachable!() };
            let hits = reloaded.search(QueryRef::F32(&q), 1).unwrap();
            assert_eq!(hits[0].0, i as u64, "row {i} lost by checkpoint replay");
        }
    }

    #[test]
    fn checkpoint_without_new_rows_is_noop() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.idle", false));
        idx.init().unwrap();
        idx.insert(unit_vec(0), 1).unwrap();
        idx.save(dir.path(), SaveMode::Build).unwrap();
        // Second save with nothing new: must not fail or grow state.
        idx.save(dir.path(), SaveMode::Checkpoint).unwrap();
        assert!(!idx.is_dirty());
    }

    #[test]
    fn load_missing_files_initializes_empty() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.none", false));
        idx.load(dir.path()).unwrap();
        assert_eq!(idx.row_count(), 0);
        assert_eq!(idx.state(), IndexState::Initialized);
    }

    #[test]
    fn load_corrupt_file_reinitializes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("test.t.bad.hnsw.index"), b"not an index").unwrap();
        let idx = HnswIndex::new(descriptor("test.t.bad", false));
        idx.load(dir.path()).unwrap();
        assert_eq!(idx.row_count(), 0);
    }

    #[test]
    fn drop_files_removes_everything() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.drop", false));
        idx.init().unwrap();
        idx.insert(unit_vec(0), 1).unwrap();
        idx.save(dir.path(), SaveMode::Build).unwrap();
        assert!(dir.path().join("test.t.drop.hnsw.index").exists());

        idx.drop_files(dir.path()).unwrap();
        assert!(!dir.path().join("test.t.drop.hnsw.index").exists());
        assert!(!dir.path().join("test.t.drop.hnsw.index.status").exists());
        assert_eq!(idx.row_count(), 0);

        // Drop is idempotent.
        idx.drop_files(dir.path()).unwrap();
    }

    #[test]
    fn parallel_build_flushes_on_save() {
        let dir = tempdir().unwrap();
        let idx = HnswIndex::new(descriptor("test.t.par", false));
        idx.init().unwrap();
        assert!(idx.start_parallel_build(2));
        assert_eq!(idx.state(), IndexState::Building);

        for i in 0..500 {
            idx.insert(unit_vec(i), i as u64).unwrap();
        }
        // Rows are staged, not yet visible.
        assert_eq!(idx.row_count(), 0);

        idx.save(dir.path(), SaveMode::Build).unwrap();
        assert_eq!(idx.row_count(), 500);
        assert_eq!(idx.state(), IndexState::Ready);

        let VectorElems::F32(q) = unit_vec(3) else { unreachable!() };
        let hits = idx.search(QueryRef::F32(&q), 1).unwrap();
        assert_eq!(hits[0].0, 3);
    }
}
