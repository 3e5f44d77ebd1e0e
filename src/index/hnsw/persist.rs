//! On-disk representation of an HNSW index.
//!
//! One index owns four files under the configured index directory:
//!
//! - `<name>.hnsw.index`: full graph snapshot with params, checkpoint
//!   id, then per node its row key, vector, and layered adjacency.
//!   Rewritten only by a `build` save.
//! - `<name>.hnsw.index.links`: frame directory for incremental
//!   checkpoints, one entry per checkpoint with its id and row count.
//! - `<name>.hnsw.index.links.data`: the appended row records
//!   (key + vector) accumulated since the last full snapshot.
//! - `<name>.hnsw.index.status`: small rewrite-in-place file holding the
//!   current checkpoint id and total durable row count.
//!
//! A load replays `.links.data` rows through the normal insert path on
//! top of the snapshot. Replayed graphs are search-equivalent to a
//! from-scratch build over the same rows, which is the checkpoint
//! contract; adjacency lists are not required to match byte-for-byte.
//! Rows in `.links.data` beyond the last complete frame belong to an
//! interrupted checkpoint and are ignored.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::graph::{Graph, VectorArena};
use super::node::Node;
use crate::checkpoint::Checkpoint;
use crate::distance::Distance;
use crate::index::{IndexDescriptor, VectorElems};
use crate::payload::{VectorKind, ELEM_BV, ELEM_FP32};

const INDEX_MAGIC: &[u8; 8] = b"MYVXHNSW";
const LINKS_MAGIC: &[u8; 8] = b"MYVXLNKS";
const LINKS_DATA_MAGIC: &[u8; 8] = b"MYVXLDAT";
const STATUS_MAGIC: &[u8; 8] = b"MYVXSTAT";

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("bad magic in {0}")]
    BadMagic(String),

    #[error("unsupported index format version {0}")]
    BadVersion(u32),

    #[error("corrupt index file: {0}")]
    Corrupt(String),

    #[error("index file is for dim {file}, descriptor says {descriptor}")]
    DimMismatch { file: usize, descriptor: usize },
}

/// File set for one index under `dir`.
pub(super) struct PersistPaths {
    pub index: PathBuf,
    pub links: PathBuf,
    pub links_data: PathBuf,
    pub status: PathBuf,
}

impl PersistPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        let index = dir.join(format!("{name}.hnsw.index"));
        let links = dir.join(format!("{name}.hnsw.index.links"));
        let links_data = dir.join(format!("{name}.hnsw.index.links.data"));
        let status = dir.join(format!("{name}.hnsw.index.status"));
        Self {
            index,
            links,
            links_data,
            status,
        }
    }

    /// Best-effort unlink of all four files.
    pub fn remove_all(&self) {
        for path in [&self.index, &self.links, &self.links_data, &self.status] {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn distance_tag(d: Distance) -> u8 {
    match d {
        Distance::L2 => 0,
        Distance::Ip => 1,
        Distance::Cosine => 2,
        Distance::Hamming => 3,
    }
}

fn distance_from_tag(tag: u8) -> Result<Distance, PersistError> {
    Ok(match tag {
        0 => Distance::L2,
        1 => Distance::Ip,
        2 => Distance::Cosine,
        3 => Distance::Hamming,
        other => return Err(PersistError::Corrupt(format!("distance tag {other}"))),
    })
}

fn kind_tag(kind: VectorKind) -> u8 {
    match kind {
        VectorKind::Float32 => ELEM_FP32,
        VectorKind::Bit => ELEM_BV,
    }
}

fn kind_from_tag(tag: u8) -> Result<VectorKind, PersistError> {
    match tag {
        ELEM_FP32 => Ok(VectorKind::Float32),
        ELEM_BV => Ok(VectorKind::Bit),
        other => Err(PersistError::Corrupt(format!("vector kind tag {other}"))),
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, PersistError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > 4096 {
        return Err(PersistError::Corrupt(format!("string length {len}")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| PersistError::Corrupt("non-utf8 string".into()))
}

fn write_vector<W: Write>(w: &mut W, arena: &VectorArena, idx: usize) -> io::Result<()> {
    match arena.query_at(idx) {
        crate::index::QueryRef::F32(v) => {
            for &x in v {
                w.write_f32::<LittleEndian>(x)?;
            }
        }
        crate::index::QueryRef::Bits(b) => w.write_all(b)?,
    }
    Ok(())
}

fn read_vector<R: Read>(
    r: &mut R,
    kind: VectorKind,
    dim: usize,
) -> Result<VectorElems, PersistError> {
    match kind {
        VectorKind::Float32 => {
            let mut v = vec![0.0f32; dim];
            r.read_f32_into::<LittleEndian>(&mut v)?;
            Ok(VectorElems::F32(v))
        }
        VectorKind::Bit => {
            let mut b = vec![0u8; dim / 8];
            r.read_exact(&mut b)?;
            Ok(VectorElems::Bits(b))
        }
    }
}

/// Rename-into-place write: the target file is either the old version or
/// the complete new one, never a torn intermediate.
fn write_atomically<F>(path: &Path, write_fn: F) -> Result<(), PersistError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), PersistError>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        write_fn(&mut writer)?;
        writer.flush()?;
        writer.get_mut().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Full snapshot: rewrite the primary file and reset the incremental
/// frame files. Used by `build` saves.
pub(super) fn save_full(
    graph: &Graph,
    checkpoint: &Checkpoint,
    distance: Distance,
    paths: &PersistPaths,
) -> Result<(), PersistError> {
    write_atomically(&paths.index, |w| {
        w.write_all(INDEX_MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u8(kind_tag(graph.arena().kind()))?;
        w.write_u8(distance_tag(distance))?;
        w.write_u32::<LittleEndian>(graph.dim() as u32)?;

        let (m, m0, ef_construction, capacity) = graph.params();
        w.write_u32::<LittleEndian>(m as u32)?;
        w.write_u32::<LittleEndian>(m0 as u32)?;
        w.write_u32::<LittleEndian>(ef_construction as u32)?;
        w.write_u64::<LittleEndian>(capacity as u64)?;

        w.write_u64::<LittleEndian>(graph.entry_point().map(|e| e as u64).unwrap_or(u64::MAX))?;
        w.write_u32::<LittleEndian>(graph.max_layer() as u32)?;
        w.write_u64::<LittleEndian>(graph.len() as u64)?;
        write_string(w, &checkpoint.to_string())?;

        for idx in 0..graph.len() {
            w.write_u64::<LittleEndian>(graph.labels()[idx])?;
            write_vector(w, graph.arena(), idx)?;

            let node = &graph.nodes()[idx];
            w.write_u8(node.max_layer() as u8)?;
            for layer in &node.layers {
                w.write_u32::<LittleEndian>(layer.len() as u32)?;
                for &neighbor in layer {
                    w.write_u32::<LittleEndian>(neighbor)?;
                }
            }
        }
        Ok(())
    })?;

    // A fresh snapshot owns all rows; reset the incremental frames.
    write_atomically(&paths.links, |w| {
        w.write_all(LINKS_MAGIC)?;
        Ok(())
    })?;
    write_atomically(&paths.links_data, |w| {
        w.write_all(LINKS_DATA_MAGIC)?;
        Ok(())
    })?;
    write_status(paths, checkpoint, graph.len() as u64)?;

    Ok(())
}

fn write_status(
    paths: &PersistPaths,
    checkpoint: &Checkpoint,
    total_rows: u64,
) -> Result<(), PersistError> {
    write_atomically(&paths.status, |w| {
        w.write_all(STATUS_MAGIC)?;
        write_string(w, &checkpoint.to_string())?;
        w.write_u64::<LittleEndian>(total_rows)?;
        Ok(())
    })
}

/// Incremental checkpoint: append rows `[from_row, graph.len())` to the
/// data file, record a frame, and rewrite the status file. The data is
/// durable before the frame that references it.
pub(super) fn append_checkpoint(
    graph: &Graph,
    from_row: usize,
    checkpoint: &Checkpoint,
    paths: &PersistPaths,
) -> Result<(), PersistError> {
    let to_row = graph.len();

    if !paths.links_data.exists() {
        write_atomically(&paths.links_data, |w| {
            w.write_all(LINKS_DATA_MAGIC)?;
            Ok(())
        })?;
    }
    if !paths.links.exists() {
        write_atomically(&paths.links, |w| {
            w.write_all(LINKS_MAGIC)?;
            Ok(())
        })?;
    }

    {
        let file = OpenOptions::new().append(true).open(&paths.links_data)?;
        let mut w = BufWriter::new(file);
        for idx in from_row..to_row {
            w.write_u64::<LittleEndian>(graph.labels()[idx])?;
            write_vector(w.by_ref(), graph.arena(), idx)?;
        }
        w.flush()?;
        w.get_mut().sync_all()?;
    }

    {
        let file = OpenOptions::new().append(true).open(&paths.links)?;
        let mut w = BufWriter::new(file);
        write_string(&mut w, &checkpoint.to_string())?;
        w.write_u64::<LittleEndian>((to_row - from_row) as u64)?;
        w.flush()?;
        w.get_mut().sync_all()?;
    }

    write_status(paths, checkpoint, to_row as u64)
}

pub(super) struct LoadedIndex {
    pub graph: Graph,
    pub checkpoint: Checkpoint,
}

/// Load the snapshot and replay completed incremental frames. Returns
/// `Ok(None)` when no index file exists (caller reinitializes empty).
pub(super) fn load(
    desc: &IndexDescriptor,
    paths: &PersistPaths,
) -> Result<Option<LoadedIndex>, PersistError> {
    if !paths.index.exists() {
        return Ok(None);
    }

    let file = File::open(&paths.index)?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != INDEX_MAGIC {
        return Err(PersistError::BadMagic(paths.index.display().to_string()));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(PersistError::BadVersion(version));
    }

    let kind = kind_from_tag(r.read_u8()?)?;
    let distance = distance_from_tag(r.read_u8()?)?;
    let dim = r.read_u32::<LittleEndian>()? as usize;
    if dim != desc.dim {
        return Err(PersistError::DimMismatch {
            file: dim,
            descriptor: desc.dim,
        });
    }

    let m = r.read_u32::<LittleEndian>()? as usize;
    let m0 = r.read_u32::<LittleEndian>()? as usize;
    let ef_construction = r.read_u32::<LittleEndian>()? as usize;
    let capacity = r.read_u64::<LittleEndian>()? as usize;

    let entry_raw = r.read_u64::<LittleEndian>()?;
    let entry_point = (entry_raw != u64::MAX).then_some(entry_raw as usize);
    let max_layer = r.read_u32::<LittleEndian>()? as usize;
    let count = r.read_u64::<LittleEndian>()? as usize;
    let snapshot_checkpoint = Checkpoint::parse(&read_string(&mut r)?)
        .map_err(|e| PersistError::Corrupt(e.to_string()))?;

    if count > capacity {
        return Err(PersistError::Corrupt(format!(
            "row count {count} exceeds capacity {capacity}"
        )));
    }

    let mut nodes = Vec::with_capacity(count);
    let mut labels = Vec::with_capacity(count);
    let mut arena = VectorArena::new(kind, dim);
    let mut arena_rows: Vec<VectorElems> = Vec::with_capacity(count);

    for _ in 0..count {
        labels.push(r.read_u64::<LittleEndian>()?);
        arena_rows.push(read_vector(&mut r, kind, dim)?);

        let node_max_layer = r.read_u8()? as usize;
        let mut layers = Vec::with_capacity(node_max_layer + 1);
        for _ in 0..=node_max_layer {
            let n = r.read_u32::<LittleEndian>()? as usize;
            if n > capacity {
                return Err(PersistError::Corrupt(format!("neighbor count {n}")));
            }
            let mut neighbors = Vec::with_capacity(n);
            for _ in 0..n {
                let neighbor = r.read_u32::<LittleEndian>()?;
                if neighbor as usize >= count {
                    return Err(PersistError::Corrupt(format!("neighbor id {neighbor}")));
                }
                neighbors.push(neighbor);
            }
            layers.push(neighbors);
        }
        nodes.push(Node { layers });
    }

    // The arena push cannot fail here: rows were sized by read_vector.
    for row in &arena_rows {
        let stored = match (row, &mut arena) {
            (VectorElems::F32(v), VectorArena::F32 { data, .. }) => {
                data.extend_from_slice(v);
                true
            }
            (VectorElems::Bits(b), VectorArena::Bits { data, .. }) => {
                data.extend_from_slice(b);
                true
            }
            _ => false,
        };
        if !stored {
            return Err(PersistError::Corrupt("vector kind drift".into()));
        }
    }

    let mut graph = Graph::from_parts(
        nodes,
        labels,
        arena,
        entry_point,
        max_layer,
        m,
        m0,
        ef_construction,
        capacity.max(desc.capacity),
        distance,
    );

    let mut checkpoint = snapshot_checkpoint;
    if let Some((frames_ck, rows)) = read_frames(paths, kind, dim)? {
        for (label, elems) in rows {
            graph
                .insert(&elems, label)
                .map_err(|e| PersistError::Corrupt(e.to_string()))?;
        }
        checkpoint = frames_ck;
    }

    // The status file is written after the frame it describes; a mismatch
    // means the last checkpoint was interrupted between the two writes.
    if let Some(status_ck) = read_status_checkpoint(paths) {
        if status_ck != checkpoint {
            tracing::warn!(
                index = %paths.index.display(),
                "status checkpoint disagrees with replayed frames, using frame checkpoint"
            );
        }
    }

    Ok(Some(LoadedIndex { graph, checkpoint }))
}

/// Read the frame directory and the rows covered by complete frames.
#[allow(clippy::type_complexity)]
fn read_frames(
    paths: &PersistPaths,
    kind: VectorKind,
    dim: usize,
) -> Result<Option<(Checkpoint, Vec<(u64, VectorElems)>)>, PersistError> {
    if !paths.links.exists() || !paths.links_data.exists() {
        return Ok(None);
    }

    let mut covered_rows = 0usize;
    let mut last_checkpoint = None;
    {
        let file = File::open(&paths.links)?;
        let mut r = BufReader::new(file);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != LINKS_MAGIC {
            return Err(PersistError::BadMagic(paths.links.display().to_string()));
        }
        loop {
            let ck = match read_string(&mut r) {
                Ok(s) => s,
                Err(PersistError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let rows = r.read_u64::<LittleEndian>()? as usize;
            covered_rows += rows;
            last_checkpoint =
                Some(Checkpoint::parse(&ck).map_err(|e| PersistError::Corrupt(e.to_string()))?);
        }
    }

    let Some(checkpoint) = last_checkpoint else {
        return Ok(None);
    };

    let mut rows = Vec::with_capacity(covered_rows);
    {
        let file = File::open(&paths.links_data)?;
        let mut r = BufReader::new(file);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != LINKS_DATA_MAGIC {
            return Err(PersistError::BadMagic(
                paths.links_data.display().to_string(),
            ));
        }
        for _ in 0..covered_rows {
            let label = r.read_u64::<LittleEndian>()?;
            rows.push((label, read_vector(&mut r, kind, dim)?));
        }
        // Anything past this point is an interrupted checkpoint's tail.
    }

    Ok(Some((checkpoint, rows)))
}

/// Peek the checkpoint id of a saved index without loading the graph.
pub(super) fn read_status_checkpoint(paths: &PersistPaths) -> Option<Checkpoint> {
    let file = File::open(&paths.status).ok()?;
    let mut r = BufReader::new(file);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).ok()?;
    if &magic != STATUS_MAGIC {
        return None;
    }
    let s = read_string(&mut r).ok()?;
    Checkpoint::parse(&s).ok()
}

