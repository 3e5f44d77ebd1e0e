//! The HNSW graph.
//!
//! Standard Malkov-Yashunin construction: each inserted vector draws a
//! random top layer from an exponential distribution, is wired into every
//! layer from there down to 0 with a diversity-preserving neighbor
//! heuristic, and searches descend greedily before a beam search on the
//! base layer.
//!
//! The graph owns its vectors (payloads are copied on insert) and maps
//! internal node indices to external row keys. Row keys may repeat when a
//! shadowing append replaces an earlier row; searches deduplicate per key
//! with the newest insertion winning.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::node::Node;
use super::visited::VisitedGuard;
use crate::distance::Distance;
use crate::index::QueryRef;
use crate::index::VectorElems;
use crate::payload::VectorKind;
use crate::simd;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HnswError {
    #[error("index is full: capacity {0} reached")]
    CapacityExceeded(usize),

    #[error("vector dimension {got} != index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector kind does not match the index space")]
    KindMismatch,
}

/// Flat storage for the graph's vectors, one stride per node.
pub enum VectorArena {
    F32 { data: Vec<f32>, dim: usize },
    Bits { data: Vec<u8>, stride: usize },
}

impl VectorArena {
    pub fn new(kind: VectorKind, dim: usize) -> Self {
        match kind {
            VectorKind::Float32 => VectorArena::F32 {
                data: Vec::new(),
                dim,
            },
            VectorKind::Bit => VectorArena::Bits {
                data: Vec::new(),
                stride: dim / 8,
            },
        }
    }

    pub fn kind(&self) -> VectorKind {
        match self {
            VectorArena::F32 { .. } => VectorKind::Float32,
            VectorArena::Bits { .. } => VectorKind::Bit,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            VectorArena::F32 { dim, .. } => *dim,
            VectorArena::Bits { stride, .. } => stride * 8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorArena::F32 { data, dim } => data.len() / dim,
            VectorArena::Bits { data, stride } => data.len() / stride,
        }
    }

    fn push(&mut self, elems: &VectorElems) -> Result<(), HnswError> {
        let expected = self.dim();
        if elems.dim() != expected {
            return Err(HnswError::DimensionMismatch {
                expected,
                got: elems.dim(),
            });
        }
        match (self, elems) {
            (VectorArena::F32 { data, .. }, VectorElems::F32(v)) => data.extend_from_slice(v),
            (VectorArena::Bits { data, .. }, VectorElems::Bits(b)) => data.extend_from_slice(b),
            _ => return Err(HnswError::KindMismatch),
        }
        Ok(())
    }

    #[inline]
    pub fn query_at(&self, idx: usize) -> QueryRef<'_> {
        match self {
            VectorArena::F32 { data, dim } => QueryRef::F32(&data[idx * dim..(idx + 1) * dim]),
            VectorArena::Bits { data, stride } => {
                QueryRef::Bits(&data[idx * stride..(idx + 1) * stride])
            }
        }
    }
}

/// Candidate for exploration (min-heap by distance).
#[derive(Clone, Copy)]
struct Candidate {
    idx: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse: smaller distance = higher priority.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result entry (max-heap, tracks the current worst of the beam).
#[derive(Clone, Copy)]
struct BeamEntry {
    idx: usize,
    distance: f32,
}

impl PartialEq for BeamEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for BeamEntry {}

impl Ord for BeamEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for BeamEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Graph {
    nodes: Vec<Node>,
    /// External row key per node, parallel to `nodes`.
    labels: Vec<u64>,
    arena: VectorArena,
    entry_point: Option<usize>,
    max_layer: usize,
    m: usize,
    m0: usize,
    /// Level multiplier for layer assignment, `1 / ln(M)`.
    ml: f64,
    ef_construction: usize,
    capacity: usize,
    distance: Distance,
    rng: StdRng,
}

impl Graph {
    pub fn new(
        kind: VectorKind,
        dim: usize,
        distance: Distance,
        capacity: usize,
        m: usize,
        ef_construction: usize,
    ) -> Self {
        Self::with_seed(kind, dim, distance, capacity, m, ef_construction, rand::random())
    }

    pub fn with_seed(
        kind: VectorKind,
        dim: usize,
        distance: Distance,
        capacity: usize,
        m: usize,
        ef_construction: usize,
        seed: u64,
    ) -> Self {
        Self {
            nodes: Vec::new(),
            labels: Vec::new(),
            arena: VectorArena::new(kind, dim),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m.max(2) as f64).ln(),
            ef_construction,
            capacity,
            distance,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reconstruct from persisted parts.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn from_parts(
        nodes: Vec<Node>,
        labels: Vec<u64>,
        arena: VectorArena,
        entry_point: Option<usize>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
        capacity: usize,
        distance: Distance,
    ) -> Self {
        Self {
            nodes,
            labels,
            arena,
            entry_point,
            max_layer,
            m,
            m0,
            ml: 1.0 / (m.max(2) as f64).ln(),
            ef_construction,
            capacity,
            distance,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.arena.dim()
    }

    pub(super) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(super) fn labels(&self) -> &[u64] {
        &self.labels
    }

    pub(super) fn arena(&self) -> &VectorArena {
        &self.arena
    }

    pub(super) fn entry_point(&self) -> Option<usize> {
        self.entry_point
    }

    pub(super) fn max_layer(&self) -> usize {
        self.max_layer
    }

    pub(super) fn params(&self) -> (usize, usize, usize, usize) {
        (self.m, self.m0, self.ef_construction, self.capacity)
    }

    #[inline]
    fn dist_to_query(&self, query: QueryRef<'_>, idx: usize) -> f32 {
        match (query, self.arena.query_at(idx)) {
            (QueryRef::F32(q), QueryRef::F32(v)) => match self.distance {
                Distance::L2 => simd::l2_squared(q, v),
                Distance::Ip => -simd::dot_product(q, v),
                Distance::Cosine => {
                    let dot = simd::dot_product(q, v);
                    let t = simd::dot_product(q, q).sqrt() * simd::dot_product(v, v).sqrt();
                    if t == 0.0 {
                        1.0
                    } else {
                        1.0 - dot / t
                    }
                }
                Distance::Hamming => f32::INFINITY, // unreachable by construction
            },
            (QueryRef::Bits(q), QueryRef::Bits(v)) => simd::hamming(q, v) as f32,
            _ => f32::INFINITY,
        }
    }

    #[inline]
    fn dist_between(&self, a: usize, b: usize) -> f32 {
        self.dist_to_query(self.arena.query_at(a), b)
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        (-r.ln() * self.ml).floor() as usize
    }

    fn check_query(&self, query: QueryRef<'_>) -> Result<(), HnswError> {
        if query.dim() != self.arena.dim() {
            return Err(HnswError::DimensionMismatch {
                expected: self.arena.dim(),
                got: query.dim(),
            });
        }
        match (query, self.arena.kind()) {
            (QueryRef::F32(_), VectorKind::Float32) | (QueryRef::Bits(_), VectorKind::Bit) => {
                Ok(())
            }
            _ => Err(HnswError::KindMismatch),
        }
    }

    /// Insert a vector under the single-writer discipline.
    pub fn insert(&mut self, elems: &VectorElems, label: u64) -> Result<(), HnswError> {
        if self.nodes.len() >= self.capacity {
            return Err(HnswError::CapacityExceeded(self.capacity));
        }

        self.arena.push(elems)?;
        let new_idx = self.nodes.len();
        let node_layer = self.random_layer();
        let mut node = Node::new(node_layer);

        // First node becomes the entry point.
        let Some(entry) = self.entry_point else {
            self.entry_point = Some(new_idx);
            self.max_layer = node_layer;
            self.nodes.push(node);
            self.labels.push(label);
            return Ok(());
        };

        let mut current = entry;

        // Phase 1: zoom in from the top layer to node_layer + 1.
        for layer in (node_layer + 1..=self.max_layer).rev() {
            let nearest = self.search_layer_idx(new_idx, &[current], 1, layer);
            if let Some(&(idx, _)) = nearest.first() {
                current = idx;
            }
        }

        // Phase 2: wire layers min(node_layer, max_layer) down to 0.
        let start_layer = node_layer.min(self.max_layer);
        let mut reverse_edges: Vec<(usize, usize)> = Vec::new(); // (node, layer)
        let mut prune_ops: Vec<(usize, usize, Vec<u32>)> = Vec::new();

        for layer in (0..=start_layer).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };

            let candidates = self.search_layer_idx(new_idx, &[current], self.ef_construction, layer);
            let neighbors = self.select_neighbors(&candidates, m_layer);

            for &(neighbor, neighbor_dist) in &neighbors {
                node.add_neighbor(layer, neighbor as u32);

                let current_degree = self.nodes[neighbor].neighbors(layer).len();
                if current_degree >= m_layer {
                    // Re-select the neighbor's adjacency with the new node
                    // in the running.
                    let mut pool: Vec<(usize, f32)> = self.nodes[neighbor]
                        .neighbors(layer)
                        .iter()
                        .map(|&n| (n as usize, self.dist_between(neighbor, n as usize)))
                        .collect();
                    pool.push((new_idx, neighbor_dist));
                    let pruned = self.select_neighbors(&pool, m_layer);
                    prune_ops.push((
                        neighbor,
                        layer,
                        pruned.iter().map(|&(i, _)| i as u32).collect(),
                    ));
                } else {
                    reverse_edges.push((neighbor, layer));
                }
            }

            if let Some(&(first, _)) = candidates.first() {
                current = first;
            }
        }

        for (neighbor, layer) in reverse_edges {
            self.nodes[neighbor].add_neighbor(layer, new_idx as u32);
        }
        for (neighbor, layer, new_neighbors) in prune_ops {
            if let Some(adj) = self.nodes[neighbor].neighbors_mut(layer) {
                adj.clear();
                adj.extend(new_neighbors);
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(new_idx);
        }

        self.nodes.push(node);
        self.labels.push(label);
        Ok(())
    }

    /// Beam search on one layer, seeded from `entry_points`, for the
    /// vector already stored at `query_idx` (used during insertion).
    fn search_layer_idx(
        &self,
        query_idx: usize,
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)> {
        self.search_layer_by(|idx| self.dist_between(query_idx, idx), entry_points, ef, layer)
    }

    fn search_layer_query(
        &self,
        query: QueryRef<'_>,
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)> {
        self.search_layer_by(|idx| self.dist_to_query(query, idx), entry_points, ef, layer)
    }

    fn search_layer_by<F>(
        &self,
        dist: F,
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> f32,
    {
        let mut visited = VisitedGuard::lease(self.nodes.len().max(1024));

        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut beam: BinaryHeap<BeamEntry> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if ep >= self.nodes.len() || visited.is_visited(ep) {
                continue;
            }
            visited.visit(ep);
            let d = dist(ep);
            candidates.push(Candidate { idx: ep, distance: d });
            beam.push(BeamEntry { idx: ep, distance: d });
        }

        while let Some(current) = candidates.pop() {
            if let Some(worst) = beam.peek() {
                if current.distance > worst.distance && beam.len() >= ef {
                    break;
                }
            }

            for &neighbor in self.nodes[current.idx].neighbors(layer) {
                let neighbor = neighbor as usize;
                if visited.is_visited(neighbor) {
                    continue;
                }
                visited.visit(neighbor);

                let d = dist(neighbor);
                let dominated = beam.len() >= ef && d > beam.peek().unwrap().distance;
                if !dominated {
                    candidates.push(Candidate {
                        idx: neighbor,
                        distance: d,
                    });
                    beam.push(BeamEntry {
                        idx: neighbor,
                        distance: d,
                    });
                    if beam.len() > ef {
                        beam.pop();
                    }
                }
            }
        }

        let mut out: Vec<(usize, f32)> = beam.into_iter().map(|e| (e.idx, e.distance)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-preserving neighbor selection: a candidate is kept only
    /// if it is closer to the query than to any already-selected
    /// neighbor; remaining slots are back-filled nearest-first.
    fn select_neighbors(&self, candidates: &[(usize, f32)], m: usize) -> Vec<(usize, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(m);
        for &(idx, dist) in &sorted {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|&(kept, _)| self.dist_between(idx, kept) >= dist);
            if diverse {
                selected.push((idx, dist));
            }
        }

        if selected.len() < m {
            for &(idx, dist) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(kept, _)| kept == idx) {
                    selected.push((idx, dist));
                }
            }
        }

        selected
    }

    /// `n` nearest `(key, distance)` pairs, nearest first. `ef` governs
    /// the base-layer beam width and is clamped to at least `n`.
    pub fn search_knn(
        &self,
        query: QueryRef<'_>,
        n: usize,
        ef: usize,
    ) -> Result<Vec<(u64, f32)>, HnswError> {
        self.check_query(query)?;

        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            let nearest = self.search_layer_query(query, &[current], 1, layer);
            if let Some(&(idx, _)) = nearest.first() {
                current = idx;
            }
        }

        let beam = self.search_layer_query(query, &[current], ef.max(n), 0);

        // Shadowing appends reuse a key; the newest node (largest internal
        // index) wins and earlier generations are suppressed.
        let mut newest: HashMap<u64, (usize, f32)> = HashMap::with_capacity(beam.len());
        for (idx, dist) in beam {
            let label = self.labels[idx];
            match newest.entry(label) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    if idx > entry.get().0 {
                        entry.insert((idx, dist));
                    }
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert((idx, dist));
                }
            }
        }

        let mut out: Vec<(u64, f32, usize)> = newest
            .into_iter()
            .map(|(label, (idx, dist))| (label, dist, idx))
            .collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        out.truncate(n);
        Ok(out.into_iter().map(|(label, dist, _)| (label, dist)).collect())
    }
}
