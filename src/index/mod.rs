//! Vector index variants and their common capability surface.
//!
//! Two index families implement [`VectorIndex`]: the exact brute-force
//! scan ([`exact`]) and the HNSW graph ([`hnsw`]). The registry owns
//! every live index behind `Box<dyn VectorIndex>`; methods take `&self`
//! and each index carries its own interior locking, so searchers holding
//! the registry's shared lease stay concurrent while writers serialize
//! inside the index.

pub mod exact;
pub mod hnsw;
pub mod registry;

use std::path::Path;

use anyhow::Result;
use thiserror::Error;

use crate::checkpoint::LogCoord;
use crate::distance::Distance;
use crate::options::OptionsMap;
use crate::payload::{self, VectorKind, VectorPayload};

/// HNSW capacity when the `size` option is omitted.
pub const DEFAULT_HNSW_CAPACITY: usize = 100_000;

/// Default HNSW graph parameters.
pub const DEFAULT_HNSW_M: usize = 16;
pub const DEFAULT_HNSW_EF_CONSTRUCTION: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("index options: {0}")]
    Options(#[from] crate::options::OptionsError),

    #[error("index dimension missing")]
    MissingDimension,

    #[error("index dimension {0} outside [{min}, {max}]", min = payload::MIN_DIM, max = payload::MAX_DIM)]
    DimensionOutOfRange(usize),

    #[error("bit-vector index dimension {0} must be a multiple of 64")]
    BitDimensionNotAligned(usize),

    #[error("distance '{0}' is not valid for index type {1}")]
    DistanceMismatch(String, String),
}

/// Index families. `HNSW_BV` is the HNSW graph over packed bit vectors
/// with Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Knn,
    Hnsw,
    HnswBv,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Knn => "KNN",
            IndexKind::Hnsw => "HNSW",
            IndexKind::HnswBv => "HNSW_BV",
        }
    }

    pub fn vector_kind(self) -> VectorKind {
        match self {
            IndexKind::HnswBv => VectorKind::Bit,
            _ => VectorKind::Float32,
        }
    }
}

/// Per-index lifecycle states.
///
/// ```text
/// CREATED → INITIALIZED → (BUILDING →)? READY ⇄ UPDATING → READY → CLOSED
///                                          ↘ CHECKPOINTING → READY
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Created,
    Initialized,
    Building,
    Ready,
    Updating,
    Checkpointing,
    Closed,
}

/// How a save is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Full rewrite of the on-disk index.
    Build,
    /// Incremental append of graph state created since the last frame.
    Checkpoint,
    /// Refresh persists like a checkpoint.
    Refresh,
}

impl SaveMode {
    pub fn parse(action: &str) -> SaveMode {
        match action {
            "build" => SaveMode::Build,
            "refresh" => SaveMode::Refresh,
            _ => SaveMode::Checkpoint,
        }
    }
}

/// Immutable index parameters, parsed from the column option string.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    /// `db.table.column`, doubling as the registry key.
    pub name: String,
    pub kind: IndexKind,
    pub dim: usize,
    pub distance: Distance,
    /// HNSW node capacity.
    pub capacity: usize,
    /// HNSW out-degree.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Consumes the replication stream when true.
    pub online: bool,
    /// Tracking timestamp column enabling incremental refresh.
    pub track: Option<String>,
    /// Build parallelism override (0 = engine default).
    pub threads: usize,
}

impl IndexDescriptor {
    pub fn from_options(name: &str, options: &str) -> Result<Self, DescriptorError> {
        let opts = OptionsMap::parse(options)?;

        let kind = match opts.get("type") {
            Some("HNSW") => IndexKind::Hnsw,
            Some("HNSW_BV") => IndexKind::HnswBv,
            Some("KNN") | None => IndexKind::Knn,
            Some(other) => {
                // Match the engine's open behavior: unknown types degrade
                // to the exact index rather than failing the descriptor.
                tracing::warn!(index = name, index_type = other, "unknown index type, using KNN");
                IndexKind::Knn
            }
        };

        let dim = opts
            .get_usize("dim")
            .ok_or(DescriptorError::MissingDimension)?;
        if !(payload::MIN_DIM..=payload::MAX_DIM).contains(&dim) {
            return Err(DescriptorError::DimensionOutOfRange(dim));
        }
        if kind == IndexKind::HnswBv && dim % 64 != 0 {
            return Err(DescriptorError::BitDimensionNotAligned(dim));
        }

        let distance = match (kind, opts.get("dist")) {
            (IndexKind::HnswBv, None) => Distance::Hamming,
            (IndexKind::HnswBv, Some(d)) if d.eq_ignore_ascii_case("Hamming") => Distance::Hamming,
            (IndexKind::HnswBv, Some(d)) => {
                return Err(DescriptorError::DistanceMismatch(
                    d.to_string(),
                    kind.as_str().to_string(),
                ))
            }
            (_, None) => Distance::L2,
            (_, Some(d)) => Distance::parse(d).map_err(|_| {
                DescriptorError::DistanceMismatch(d.to_string(), kind.as_str().to_string())
            })?,
        };

        let ef_construction = opts
            .get_usize("ef")
            .unwrap_or(DEFAULT_HNSW_EF_CONSTRUCTION);

        Ok(Self {
            name: name.to_string(),
            kind,
            dim,
            distance,
            capacity: opts.get_usize("size").unwrap_or(DEFAULT_HNSW_CAPACITY),
            m: opts.get_usize("M").unwrap_or(DEFAULT_HNSW_M),
            ef_construction,
            // ef_search falls back to the construction width.
            ef_search: opts.get_usize("ef_search").unwrap_or(ef_construction),
            online: matches!(opts.get("online"), Some("Y") | Some("y")),
            track: opts.get("track").map(str::to_string),
            threads: opts.get_usize("threads").unwrap_or(0),
        })
    }

    /// Storage width of one serialized column value.
    pub fn storage_len(&self) -> usize {
        self.kind.vector_kind().storage_len(self.dim)
    }
}

/// Owned vector elements entering an index. Payload bytes are always
/// copied before they reach an index; no caller pointers are retained.
#[derive(Debug, Clone)]
pub enum VectorElems {
    F32(Vec<f32>),
    Bits(Vec<u8>),
}

impl VectorElems {
    pub fn dim(&self) -> usize {
        match self {
            VectorElems::F32(v) => v.len(),
            VectorElems::Bits(b) => b.len() * 8,
        }
    }

    pub fn from_payload(view: &VectorPayload<'_>) -> Self {
        match view.kind {
            VectorKind::Float32 => VectorElems::F32(view.floats()),
            VectorKind::Bit => VectorElems::Bits(view.data().to_vec()),
        }
    }
}

/// Borrowed query vector for searches.
#[derive(Debug, Clone, Copy)]
pub enum QueryRef<'a> {
    F32(&'a [f32]),
    Bits(&'a [u8]),
}

impl<'a> QueryRef<'a> {
    pub fn dim(&self) -> usize {
        match self {
            QueryRef::F32(v) => v.len(),
            QueryRef::Bits(b) => b.len() * 8,
        }
    }
}

impl<'a> From<&'a VectorElems> for QueryRef<'a> {
    fn from(v: &'a VectorElems) -> Self {
        match v {
            VectorElems::F32(e) => QueryRef::F32(e),
            VectorElems::Bits(b) => QueryRef::Bits(b),
        }
    }
}

/// Capability surface shared by all index variants.
pub trait VectorIndex: Send + Sync {
    fn descriptor(&self) -> &IndexDescriptor;

    fn state(&self) -> IndexState;

    fn row_count(&self) -> u64;

    /// In-memory state diverges from disk.
    fn is_dirty(&self) -> bool;

    /// Whether the index persists anything at all.
    fn supports_persist(&self) -> bool;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn dim(&self) -> usize {
        self.descriptor().dim
    }

    /// Online index: consumes binlog updates.
    fn supports_incr_updates(&self) -> bool {
        self.descriptor().online
    }

    /// Tracking column configured: supports `refresh`.
    fn supports_incr_refresh(&self) -> bool {
        self.descriptor().track.is_some()
    }

    /// Reset to an empty, ready-to-insert index.
    fn init(&self) -> Result<()>;

    /// Quiesce; the registry calls this with the exclusive lock held.
    fn close(&self);

    /// Append one vector. Keys repeat only when a row mutation shadows an
    /// earlier insert; the newest entry wins at search time.
    fn insert(&self, elems: VectorElems, key: u64) -> Result<()>;

    /// `n` nearest keys with distances, nearest first.
    fn search(&self, query: QueryRef<'_>, n: usize) -> Result<Vec<(u64, f32)>>;

    fn save(&self, dir: &Path, mode: SaveMode) -> Result<()>;

    fn load(&self, dir: &Path) -> Result<()>;

    fn drop_files(&self, dir: &Path) -> Result<()>;

    /// Arm batched parallel build; returns false for indexes that build
    /// serially regardless.
    fn start_parallel_build(&self, threads: usize) -> bool;

    fn set_update_ts(&self, ts: u64);

    fn update_ts(&self) -> u64;

    fn last_coords(&self) -> LogCoord;

    fn set_last_coords(&self, coord: LogCoord);
}

/// Instantiate the index variant named by an option string. Unknown types
/// degrade to KNN, matching the original open path.
pub fn open_index(name: &str, options: &str) -> Result<Box<dyn VectorIndex>, DescriptorError> {
    let desc = IndexDescriptor::from_options(name, options)?;
    Ok(match desc.kind {
        IndexKind::Hnsw | IndexKind::HnswBv => Box::new(hnsw::HnswIndex::new(desc)),
        IndexKind::Knn => Box::new(exact::ExactIndex::new(desc)),
    })
}
