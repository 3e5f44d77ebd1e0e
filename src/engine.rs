//! Long-lived process context.
//!
//! One [`Engine`] value owns everything the plugin shares across
//! threads: configuration, the index registry, the current replication
//! cursor, and the CDC routing table. It is threaded explicitly through
//! the dispatch layer and the CDC consumer; there is no global state.

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::cdc::Router;
use crate::checkpoint::LogCoord;
use crate::index::registry::Registry;

/// Process-wide settings, mirroring the host's plugin system variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Feature bitfield; bit 0 disables the CDC consumer.
    pub feature_level: u64,
    /// Background worker threads for CDC applies and default build
    /// parallelism, clamped to [1, 100].
    pub index_bg_threads: usize,
    /// Directory holding serialized index files.
    pub index_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feature_level: 2,
            index_bg_threads: 2,
            index_dir: PathBuf::from("/var/lib/myvector"),
        }
    }
}

impl EngineConfig {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_bg_threads(mut self, threads: usize) -> Self {
        self.index_bg_threads = threads.clamp(1, 100);
        self
    }

    pub fn with_feature_level(mut self, level: u64) -> Self {
        self.feature_level = level;
        self
    }

    pub fn cdc_enabled(&self) -> bool {
        self.feature_level & 1 == 0
    }
}

/// Current replication-stream position. Rotation and checkpoint writes
/// hold the lock together with their index updates so coordinates never
/// tear.
#[derive(Default)]
pub struct BinlogCursor {
    inner: Mutex<Option<LogCoord>>,
}

impl BinlogCursor {
    /// `None` until the first rotate event names a file.
    pub fn get(&self) -> Option<LogCoord> {
        self.inner.lock().clone()
    }

    pub fn set(&self, coord: LogCoord) {
        *self.inner.lock() = Some(coord);
    }

    /// Advance the offset within the current file.
    pub fn advance(&self, bytes: u64) {
        if let Some(coord) = self.inner.lock().as_mut() {
            coord.offset += bytes;
        }
    }
}

/// The process context value.
pub struct Engine {
    pub config: EngineConfig,
    pub registry: Registry,
    pub binlog_cursor: BinlogCursor,
    pub router: Router,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            binlog_cursor: BinlogCursor::default(),
            router: Router::default(),
        }
    }
}
