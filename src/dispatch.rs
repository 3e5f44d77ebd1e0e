//! Admin and per-query search dispatch.
//!
//! The host exposes scalar functions that land here: `search_open`
//! drives the admin actions (`build`, `refresh`, `load`, `save`,
//! `drop`), `ann_set` serves nearest-neighbor lookups for rewritten
//! queries, and `row_distance` reads back the distances of the last
//! search from the query's scratch.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};

use crate::cdc::VectorColumnInfo;
use crate::engine::Engine;
use crate::host::HostSession;
use crate::index::{SaveMode, VectorElems};
use crate::options::OptionsMap;
use crate::payload;

/// Neighbors returned by `ann_set` when no `nn=` option is given.
pub const DEFAULT_ANN_RETURN_COUNT: usize = 10;

/// Hard cap on neighbors per `ann_set` call.
pub const MAX_ANN_RETURN_COUNT: usize = 10_000;

/// Distance reported for ids the last search did not return.
pub const ROW_DISTANCE_SENTINEL: f64 = 99_999_999_999.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Build,
    Refresh,
    Load,
    Save,
    Drop,
}

impl AdminAction {
    pub fn parse(action: &str) -> Result<Self> {
        Ok(match action {
            "build" => AdminAction::Build,
            "refresh" => AdminAction::Refresh,
            "load" => AdminAction::Load,
            "save" => AdminAction::Save,
            "drop" => AdminAction::Drop,
            other => bail!("unknown admin action '{other}'"),
        })
    }
}

/// Per-query distance scratch. Owned by the query (not by any UDF
/// lifecycle), filled by [`ann_set`], read by [`row_distance`].
#[derive(Debug, Default)]
pub struct SearchScratch {
    distances: HashMap<u64, f64>,
}

impl SearchScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.distances.is_empty()
    }
}

/// Distance of `id` in the last `ann_set` result, or the sentinel.
pub fn row_distance(scratch: &SearchScratch, id: u64) -> f64 {
    scratch
        .distances
        .get(&id)
        .copied()
        .unwrap_or(ROW_DISTANCE_SENTINEL)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn split_index_name(vec_id: &str) -> Result<(&str, &str, &str)> {
    let mut parts = vec_id.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(db), Some(table), Some(col), None) if !db.is_empty() && !table.is_empty() && !col.is_empty() => {
            Ok((db, table, col))
        }
        _ => bail!("vector index name '{vec_id}' is not db.table.column"),
    }
}

/// The `myvector_search_open` entrypoint: run one admin action against
/// the index named `vec_id`, using `session` for base-table scans and
/// dictionary lookups. Returns a status string for the host.
pub fn search_open(
    engine: &Engine,
    session: &mut dyn HostSession,
    vec_id: &str,
    options: &str,
    id_col: &str,
    action: AdminAction,
) -> Result<String> {
    tracing::info!(index = vec_id, ?action, "admin action");

    let lease = match engine.registry.get(vec_id) {
        Some(lease) => lease,
        None => engine.registry.open(vec_id, options, "open")?,
    };

    let opts = OptionsMap::parse(options)
        .with_context(|| format!("options for index {vec_id}"))?;
    let track = opts.get("track").map(str::to_string);
    let threads = match opts.get_usize("threads") {
        Some(t) => t,
        None => engine.config.index_bg_threads,
    };
    let dir = engine.config.index_dir.clone();

    match action {
        AdminAction::Save => {
            lease.save(&dir, SaveMode::Checkpoint)?;
            Ok("SUCCESS".to_string())
        }
        AdminAction::Load => {
            lease.load(&dir)?;
            Ok("SUCCESS".to_string())
        }
        AdminAction::Drop => {
            lease.drop_files(&dir)?;
            engine.registry.close(lease);
            Ok("SUCCESS".to_string())
        }
        AdminAction::Build | AdminAction::Refresh => {
            let (db, table, vec_col) = split_index_name(vec_id)?;
            let now = unix_now();
            let previous_ts = lease.update_ts();

            let where_clause = match (&track, action) {
                (Some(col), AdminAction::Build) => {
                    format!(" WHERE unix_timestamp({col}) <= {now}")
                }
                (Some(col), AdminAction::Refresh) => format!(
                    " WHERE unix_timestamp({col}) > {previous_ts} AND unix_timestamp({col}) <= {now}"
                ),
                _ => String::new(),
            };

            if action == AdminAction::Build {
                lease.drop_files(&dir)?;
                lease.init()?;
            }
            lease.set_update_ts(now);

            if threads >= 2 {
                lease.start_parallel_build(threads);
            }

            let mut inserted = 0u64;
            let mut dropped = 0u64;
            session
                .scan_table(db, table, id_col, vec_col, &where_clause, &mut |key, raw| {
                    match payload::decode(raw) {
                        Ok(view) => {
                            lease.insert(VectorElems::from_payload(&view), key)?;
                            inserted += 1;
                        }
                        Err(e) => {
                            tracing::warn!(index = vec_id, key, error = %e, "skipping invalid row payload");
                            dropped += 1;
                        }
                    }
                    Ok(())
                })
                .with_context(|| format!("scanning {db}.{table} for index build"))?;

            // Stamp the replication coordinates before persisting so the
            // embedded checkpoint covers everything the scan saw.
            let coord = engine.binlog_cursor.get();
            if let Some(coord) = &coord {
                lease.set_last_coords(coord.clone());
            }
            let mode = if action == AdminAction::Build {
                SaveMode::Build
            } else {
                SaveMode::Refresh
            };
            lease.save(&dir, mode)?;

            if lease.supports_incr_updates() {
                let (id_position, vec_position) =
                    session.column_positions(db, table, id_col, vec_col)?;
                if id_position > 0 && vec_position > 0 {
                    engine.router.register(
                        &format!("{db}.{table}"),
                        VectorColumnInfo {
                            vector_column: vec_col.to_string(),
                            id_position,
                            vec_position,
                        },
                    );
                }
            }

            if dropped > 0 {
                tracing::warn!(index = vec_id, dropped, "rows skipped during build");
            }
            let at = coord
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(no binlog)".to_string());
            Ok(format!(
                "SUCCESS: Index created & saved at {at}, rows: {inserted}."
            ))
        }
    }
}

/// The `myvector_search_save` entrypoint: persist the current in-memory
/// state of an already-open index.
pub fn search_save(engine: &Engine, vec_id: &str, action: &str) -> Result<String> {
    let Some(lease) = engine.registry.get(vec_id) else {
        bail!("index {vec_id} is not opened for build/refresh");
    };
    lease.save(&engine.config.index_dir, SaveMode::parse(action))?;
    Ok("SUCCESS".to_string())
}

/// The `myvector_search_add_row` entrypoint: push one row into an open
/// index during a host-driven build. Returns the number of rows added.
pub fn search_add_row(engine: &Engine, vec_id: &str, key: u64, raw: &[u8]) -> Result<u64> {
    let Some(lease) = engine.registry.get(vec_id) else {
        bail!("index {vec_id} is not opened for update");
    };
    let view = payload::decode(raw)?;
    lease.insert(VectorElems::from_payload(&view), key)?;
    Ok(1)
}

/// The `myvector_ann_set` entrypoint: nearest-neighbor ids for a query
/// payload, as a flat JSON array. Also fills the query's distance
/// scratch for `row_distance`.
pub fn ann_set(
    engine: &Engine,
    scratch: &mut SearchScratch,
    vec_id: &str,
    _id_col: &str,
    query_payload: &[u8],
    options: Option<&str>,
) -> Result<String> {
    let mut nn = DEFAULT_ANN_RETURN_COUNT;
    if let Some(opts) = options {
        if !opts.is_empty() {
            let map = OptionsMap::parse(opts).with_context(|| "ann_set options")?;
            if let Some(requested) = map.get("nn").and_then(|v| v.parse::<i64>().ok()) {
                nn = if requested <= 0 {
                    DEFAULT_ANN_RETURN_COUNT
                } else {
                    (requested as usize).min(MAX_ANN_RETURN_COUNT)
                };
            }
        }
    }

    let lease = engine
        .registry
        .get(vec_id)
        .ok_or_else(|| anyhow!("vector index ({vec_id}) not defined or not open for access"))?;

    let view = payload::decode(query_payload)?;
    if view.dim != lease.dim() {
        bail!(
            "query vector dimension {} != index dimension {}",
            view.dim,
            lease.dim()
        );
    }

    let elems = VectorElems::from_payload(&view);
    let hits = lease.search((&elems).into(), nn)?;

    scratch.distances.clear();
    let mut keys = Vec::with_capacity(hits.len());
    for (key, dist) in hits {
        scratch.distances.insert(key, dist as f64);
        keys.push(key);
    }

    Ok(serde_json::to_string(&keys)?)
}

/// Scalar `myvector_distance`: decode both payloads and measure.
pub fn distance(v1: &[u8], v2: &[u8], kind: Option<&str>) -> Result<f64> {
    let kind = match kind {
        Some(name) => crate::distance::Distance::parse(name)?,
        None => crate::distance::Distance::L2,
    };
    let a = payload::decode(v1)?;
    let b = payload::decode(v2)?;

    let value = match (VectorElems::from_payload(&a), VectorElems::from_payload(&b)) {
        (VectorElems::F32(x), VectorElems::F32(y)) => kind.compute(&x, &y)?,
        (VectorElems::Bits(x), VectorElems::Bits(y)) => {
            crate::distance::Distance::Hamming.compute_bits(&x, &y)?
        }
        _ => bail!("cannot measure distance between float and bit vectors"),
    };
    Ok(value as f64)
}

/// Scalar `myvector_hamming_distance` over raw bit-vector payloads.
pub fn hamming_distance(v1: &[u8], v2: &[u8]) -> Result<f64> {
    let a = payload::decode(v1)?;
    let b = payload::decode(v2)?;
    match (VectorElems::from_payload(&a), VectorElems::from_payload(&b)) {
        (VectorElems::Bits(x), VectorElems::Bits(y)) => {
            Ok(crate::distance::Distance::Hamming.compute_bits(&x, &y)? as f64)
        }
        _ => bail!("hamming distance requires bit-vector payloads"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::host::{BinlogStream, VectorColumnDef};
    use crate::payload::encode_f32;
    use tempfile::tempdir;

    /// Minimal fake host: one table of pre-encoded rows.
    struct FakeSession {
        rows: Vec<(u64, Vec<u8>)>,
    }

    impl HostSession for FakeSession {
        fn prepare_replication(&mut self) -> Result<()> {
            Ok(())
        }

        fn vector_columns(&mut self) -> Result<Vec<VectorColumnDef>> {
            Ok(Vec::new())
        }

        fn column_positions(
            &mut self,
            _db: &str,
            _table: &str,
            _id_col: &str,
            _vec_col: &str,
        ) -> Result<(u32, u32)> {
            Ok((1, 2))
        }

        fn scan_table(
            &mut self,
            _db: &str,
            _table: &str,
            _id_col: &str,
            _vec_col: &str,
            _where_clause: &str,
            sink: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
        ) -> Result<()> {
            for (id, payload) in &self.rows {
                sink(*id, payload)?;
            }
            Ok(())
        }

        fn binlog_stream(
            &mut self,
            _start_file: Option<&str>,
            _start_offset: u64,
        ) -> Result<Box<dyn BinlogStream>> {
            bail!("not a replication session")
        }
    }

    fn engine_with_dir(dir: &std::path::Path) -> Engine {
        Engine::new(EngineConfig::new(dir).with_bg_threads(1))
    }

    #[test]
    fn build_scan_search_flow() {
        let dir = tempdir().unwrap();
        let engine = engine_with_dir(dir.path());
        let mut session = FakeSession {
            rows: vec![
                (1, encode_f32(&[1.0, 0.0, 0.0, 0.0]).unwrap()),
                (2, encode_f32(&[0.0, 1.0, 0.0, 0.0]).unwrap()),
                (3, encode_f32(&[1.0, 1.0, 0.0, 0.0]).unwrap()),
            ],
        };

        let status = search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=4",
            "id",
            AdminAction::Build,
        )
        .unwrap();
        assert!(status.starts_with("SUCCESS"), "{status}");
        assert!(status.contains("rows: 3"));

        let mut scratch = SearchScratch::new();
        let qvec = encode_f32(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let ids = ann_set(&engine, &mut scratch, "test.t.v", "id", &qvec, Some("nn=2")).unwrap();
        assert_eq!(ids, "[1,3]");

        assert_eq!(row_distance(&scratch, 1), 0.0);
        assert_eq!(row_distance(&scratch, 3), 1.0);
        assert_eq!(row_distance(&scratch, 42), ROW_DISTANCE_SENTINEL);
    }

    #[test]
    fn build_skips_corrupt_rows() {
        let dir = tempdir().unwrap();
        let engine = engine_with_dir(dir.path());
        let mut bad = encode_f32(&[1.0, 0.0]).unwrap();
        bad[0] ^= 0xff;
        let mut session = FakeSession {
            rows: vec![
                (1, encode_f32(&[1.0, 0.0]).unwrap()),
                (2, bad),
            ],
        };

        let status = search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=2",
            "id",
            AdminAction::Build,
        )
        .unwrap();
        assert!(status.contains("rows: 1"));
    }

    #[test]
    fn ann_set_unknown_index_errors() {
        let dir = tempdir().unwrap();
        let engine = engine_with_dir(dir.path());
        let mut scratch = SearchScratch::new();
        let qvec = encode_f32(&[1.0, 0.0]).unwrap();
        assert!(ann_set(&engine, &mut scratch, "no.such.index", "id", &qvec, None).is_err());
    }

    #[test]
    fn ann_set_nn_parsing_and_cap() {
        let dir = tempdir().unwrap();
        let engine = engine_with_dir(dir.path());
        let mut session = FakeSession {
            rows: (0..20)
                .map(|i| (i as u64, encode_f32(&[i as f32, 0.0]).unwrap()))
                .collect(),
        };
        search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=2",
            "id",
            AdminAction::Build,
        )
        .unwrap();

        let mut scratch = SearchScratch::new();
        let qvec = encode_f32(&[0.0, 0.0]).unwrap();

        // Default nn=10.
        let ids = ann_set(&engine, &mut scratch, "test.t.v", "id", &qvec, None).unwrap();
        let parsed: Vec<u64> = serde_json::from_str(&ids).unwrap();
        assert_eq!(parsed.len(), 10);

        // Negative falls back to the default.
        let ids = ann_set(&engine, &mut scratch, "test.t.v", "id", &qvec, Some("nn=-4")).unwrap();
        let parsed: Vec<u64> = serde_json::from_str(&ids).unwrap();
        assert_eq!(parsed.len(), 10);

        // Larger than the population: all rows.
        let ids = ann_set(&engine, &mut scratch, "test.t.v", "id", &qvec, Some("nn=500")).unwrap();
        let parsed: Vec<u64> = serde_json::from_str(&ids).unwrap();
        assert_eq!(parsed.len(), 20);
    }

    #[test]
    fn drop_then_get_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = engine_with_dir(dir.path());
        let mut session = FakeSession { rows: Vec::new() };
        search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=2",
            "id",
            AdminAction::Build,
        )
        .unwrap();
        assert_eq!(engine.registry.len(), 1);

        search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=2",
            "id",
            AdminAction::Drop,
        )
        .unwrap();
        assert!(engine.registry.get("test.t.v").is_none());

        // Drop again: idempotent, no error.
        search_open(
            &engine,
            &mut session,
            "test.t.v",
            "type=KNN,dim=2",
            "id",
            AdminAction::Drop,
        )
        .unwrap();
    }

    #[test]
    fn scalar_distance_function() {
        let a = encode_f32(&[1.0, 0.0]).unwrap();
        let b = encode_f32(&[0.0, 1.0]).unwrap();
        assert_eq!(distance(&a, &b, None).unwrap(), 2.0);
        assert_eq!(distance(&a, &b, Some("IP")).unwrap(), 0.0);
        assert!((distance(&a, &b, Some("Cosine")).unwrap() - 1.0).abs() < 1e-6);
        assert!(distance(&a, &b, Some("nope")).is_err());

        let c = encode_f32(&[1.0, 0.0, 0.0]).unwrap();
        assert!(distance(&a, &c, None).is_err(), "dimension mismatch must error");
    }

    #[test]
    fn scalar_hamming_distance_function() {
        let mut x = vec![0u8; 16];
        let y = vec![0u8; 16];
        x[0] = 0b101;
        x[15] = 0b1;
        let a = crate::payload::encode_bits(&x).unwrap();
        let b = crate::payload::encode_bits(&y).unwrap();
        assert_eq!(hamming_distance(&a, &b).unwrap(), 3.0);

        let f = encode_f32(&[1.0, 2.0]).unwrap();
        assert!(hamming_distance(&a, &f).is_err());
    }
}
