//! MyVector: vector index engine and change-capture pipeline for a
//! MySQL vector-search plugin.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Query Rewriter (MYVECTOR annotations → SQL)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Admin / Search Dispatch (build · refresh · ann_set · …)   │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   Index Registry (leases)    │   CDC Tail Consumer (binlog) │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │     Vector Indexes: exact KNN · HNSW (graph + on-disk)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Payload Codec (FP32 / bit vectors + CRC) · Distances    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host database's parser, storage engine, and network stack are
//! external collaborators reached through the [`host`] trait seams.

pub mod cdc;
pub mod checkpoint;
pub mod dispatch;
pub mod distance;
pub mod engine;
pub mod host;
pub mod index;
pub mod options;
pub mod payload;
pub mod rewrite;
pub mod simd;

pub use checkpoint::{Checkpoint, LogCoord};
pub use distance::Distance;
pub use engine::{Engine, EngineConfig};
pub use index::registry::Registry;
pub use payload::{VectorKind, VectorPayload};
pub use rewrite::rewrite_query;
