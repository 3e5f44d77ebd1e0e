//! Change-data-capture pipeline.
//!
//! A single consumer connects to the host as a replication client and
//! tails the binlog. Row events for tables carrying online vector
//! indexes are decoded and queued; a pool of workers applies them to the
//! matching indexes. File rotations drain the queue and checkpoint every
//! online index, so restart replays only the events after the last
//! durable coordinate, and the per-index coordinate filter makes that
//! replay idempotent.

pub mod config;
pub mod event;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;

use crate::checkpoint::LogCoord;
use crate::engine::Engine;
use crate::host::{BinlogStream, HostConnector, HostSession};
use crate::index::{SaveMode, VectorElems};
use crate::options::OptionsMap;
use crate::payload;
use config::CdcConfig;
use queue::UpdateQueue;

/// Routing record for one online vector column. Ordinal positions are
/// 1-based, as reported by the schema dictionary.
#[derive(Debug, Clone)]
pub struct VectorColumnInfo {
    pub vector_column: String,
    pub id_position: u32,
    pub vec_position: u32,
}

/// `db.table` → vector column routing map, shared between the consumer
/// and the admin dispatch (a build of an online index registers here).
#[derive(Default)]
pub struct Router {
    map: RwLock<HashMap<String, VectorColumnInfo>>,
}

impl Router {
    pub fn register(&self, table_key: &str, info: VectorColumnInfo) {
        tracing::debug!(table = table_key, column = %info.vector_column, "routing online index");
        self.map.write().insert(table_key.to_string(), info);
    }

    pub fn lookup(&self, table_key: &str) -> Option<VectorColumnInfo> {
        self.map.read().get(table_key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn table_keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

/// One queued row mutation.
#[derive(Debug, Clone)]
pub struct IndexUpdate {
    pub db: String,
    pub table: String,
    pub column: String,
    pub key: u64,
    pub payload: Vec<u8>,
    pub coord: LogCoord,
}

impl IndexUpdate {
    fn index_name(&self) -> String {
        format!("{}.{}.{}", self.db, self.table, self.column)
    }
}

/// Apply one queued update to its index. Replay-safe: a coordinate at or
/// before the index's last applied coordinate is dropped.
pub fn apply_index_update(engine: &Engine, update: &IndexUpdate) {
    let name = update.index_name();
    let Some(lease) = engine.registry.get(&name) else {
        return;
    };

    let last = lease.last_coords();
    if !last.is_sentinel() && !update.coord.is_after(&last) {
        tracing::debug!(
            index = %name,
            coord = %update.coord,
            %last,
            "skipping index update at or before last applied coordinate"
        );
        return;
    }

    let view = match payload::decode(&update.payload) {
        Ok(view) => view,
        Err(e) => {
            // One bad row never stops the stream.
            tracing::warn!(index = %name, key = update.key, error = %e, "dropping undecodable row");
            return;
        }
    };

    if let Err(e) = lease.insert(VectorElems::from_payload(&view), update.key) {
        tracing::warn!(index = %name, key = update.key, error = %e, "dropping failed index update");
        return;
    }
    lease.set_last_coords(update.coord.clone());
}

/// Checkpoint one online index at the rotation coordinate if it has
/// advanced past the index's last durable position.
fn checkpoint_index(engine: &Engine, table_key: &str, vec_col: &str, coord: &LogCoord) {
    let name = format!("{table_key}.{vec_col}");
    let Some(lease) = engine.registry.get(&name) else {
        return;
    };

    let last = lease.last_coords();
    tracing::debug!(index = %name, %coord, "checkpoint index");
    // Persist unless the index is already past the rotation coordinate
    // (a stale rotation observed during replay). Equality still saves:
    // the in-memory rows applied up to this coordinate become durable.
    if last.is_sentinel() || !last.is_after(coord) {
        lease.set_last_coords(coord.clone());
        if let Err(e) = lease.save(&engine.config.index_dir, SaveMode::Checkpoint) {
            tracing::error!(index = %name, error = %e, "checkpoint save failed");
        }
    }
}

/// The binlog tail consumer. `run` owns the calling thread until the
/// upstream stream closes or errors; the plugin shell spawns it once at
/// init.
pub struct CdcConsumer {
    engine: Arc<Engine>,
    connector: Arc<dyn HostConnector>,
    cdc_config: CdcConfig,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl CdcConsumer {
    pub fn new(
        engine: Arc<Engine>,
        connector: Arc<dyn HostConnector>,
        cdc_config: CdcConfig,
    ) -> Self {
        Self {
            engine,
            connector,
            cdc_config,
            retry_attempts: config::CONNECT_RETRY_ATTEMPTS,
            retry_interval: config::CONNECT_RETRY_INTERVAL,
        }
    }

    /// Shrink the retry budget (tests, embedded runs).
    pub fn with_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_interval = interval;
        self
    }

    fn connect_with_retry(&self) -> Result<Box<dyn HostSession>> {
        let mut attempts = 0;
        loop {
            match self.connector.connect(&self.cdc_config) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.retry_attempts {
                        return Err(e).context("binlog consumer failed to connect");
                    }
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    /// Query the dictionary for `online=Y` vector columns, load each
    /// index, and fill the routing map.
    fn open_online_indexes(&self, session: &mut dyn HostSession) -> Result<()> {
        for def in session.vector_columns()? {
            let opts = match OptionsMap::parse(&def.options) {
                Ok(opts) => opts,
                Err(e) => {
                    tracing::warn!(column = %def.index_name(), error = %e, "bad column options, skipping");
                    continue;
                }
            };

            if !matches!(opts.get("online"), Some("Y") | Some("y")) {
                continue;
            }
            let Some(id_col) = opts.get("idcol") else {
                tracing::warn!(column = %def.index_name(), "online column without idcol option, skipping");
                continue;
            };

            let (id_position, vec_position) =
                session.column_positions(&def.db, &def.table, id_col, &def.column)?;
            if id_position == 0 || vec_position == 0 {
                tracing::warn!(column = %def.index_name(), "column positions not found, skipping");
                continue;
            }

            let name = def.index_name();
            let lease = self.engine.registry.open(&name, &def.options, "load")?;
            lease.load(&self.engine.config.index_dir)?;
            drop(lease);

            self.engine.router.register(
                &def.table_key(),
                VectorColumnInfo {
                    vector_column: def.column.clone(),
                    id_position,
                    vec_position,
                },
            );
        }
        Ok(())
    }

    /// Drain the update queue, then checkpoint every online index at the
    /// current coordinates. Called on every file rotation with the
    /// cursor still at the closing file.
    fn flush_online_indexes(&self, update_queue: &UpdateQueue) {
        while !update_queue.is_empty() {
            thread::sleep(Duration::from_millis(50));
        }
        let Some(coord) = self.engine.binlog_cursor.get() else {
            return;
        };
        for table_key in self.engine.router.table_keys() {
            if let Some(info) = self.engine.router.lookup(&table_key) {
                checkpoint_index(&self.engine, &table_key, &info.vector_column, &coord);
            }
        }
    }

    pub fn run(&self) -> Result<()> {
        if !self.engine.config.cdc_enabled() {
            tracing::info!("binlog event consumer is disabled");
            return Ok(());
        }

        tracing::info!(
            host = %self.cdc_config.host,
            user = %self.cdc_config.user,
            "binlog consumer starting"
        );

        let mut session = self.connect_with_retry()?;
        session.prepare_replication()?;
        self.open_online_indexes(session.as_mut())?;

        let start_file = self.engine.registry.earliest_tracked_log_file();
        let mut stream = session
            .binlog_stream(start_file.as_deref(), 4)
            .context("opening binlog stream")?;

        let update_queue = UpdateQueue::new();
        let workers = self.spawn_workers(&update_queue)?;

        let result = self.event_loop(stream.as_mut(), &update_queue);

        // Disconnect the workers and let them drain what is queued.
        drop(update_queue);
        for worker in workers {
            let _ = worker.join();
        }

        tracing::info!("binlog consumer exiting");
        result
    }

    fn spawn_workers(&self, update_queue: &UpdateQueue) -> Result<Vec<thread::JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(self.engine.config.index_bg_threads);
        for id in 0..self.engine.config.index_bg_threads {
            let rx = update_queue.consumer();
            let engine = Arc::clone(&self.engine);
            let handle = thread::Builder::new()
                .name(format!("myvector-cdc-{id}"))
                .spawn(move || {
                    tracing::debug!(worker = id, "cdc worker started");
                    while let Ok(update) = rx.recv() {
                        apply_index_update(&engine, &update);
                    }
                })
                .context("spawning cdc worker")?;
            workers.push(handle);
        }
        Ok(workers)
    }

    fn event_loop(&self, stream: &mut dyn BinlogStream, update_queue: &UpdateQueue) -> Result<()> {
        let mut table_map: Option<event::TableMapEvent> = None;

        while let Some(buf) = stream.fetch()? {
            let Some(ty) = event::event_type(&buf) else {
                continue;
            };

            if ty == event::ROTATE_EVENT {
                let had_file = self.engine.binlog_cursor.get().is_some();
                if had_file {
                    self.flush_online_indexes(update_queue);
                }
                match event::parse_rotate(&buf, had_file) {
                    Ok(rotate) => {
                        self.engine
                            .binlog_cursor
                            .set(LogCoord::new(rotate.next_file, rotate.position));
                    }
                    Err(e) => tracing::warn!(error = %e, "undecodable rotate event"),
                }
                continue;
            }

            self.engine.binlog_cursor.advance(buf.len() as u64);

            if self.engine.router.is_empty() {
                continue;
            }

            match ty {
                event::TABLE_MAP_EVENT => {
                    // Decode the full layout only for routed tables.
                    match event::parse_table_map_name(&buf) {
                        Ok((db, table)) if self.engine.router.lookup(&format!("{db}.{table}")).is_some() => {
                            match event::parse_table_map(&buf) {
                                Ok(tmap) => table_map = Some(tmap),
                                Err(e) => {
                                    tracing::warn!(error = %e, "undecodable table map, dropping");
                                    table_map = None;
                                }
                            }
                        }
                        Ok(_) => table_map = None,
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable table map header");
                            table_map = None;
                        }
                    }
                }
                event::WRITE_ROWS_EVENT => {
                    let Some(tmap) = table_map.as_ref() else {
                        continue;
                    };
                    let table_key = format!("{}.{}", tmap.db, tmap.table);
                    let Some(info) = self.engine.router.lookup(&table_key) else {
                        continue;
                    };

                    let coord = self
                        .engine
                        .binlog_cursor
                        .get()
                        .ok_or_else(|| anyhow!("row event before any rotate"))?;

                    match event::parse_write_rows(
                        &buf,
                        tmap,
                        info.id_position as usize - 1,
                        info.vec_position as usize - 1,
                    ) {
                        Ok(rows) => {
                            tracing::debug!(
                                table = %table_key,
                                rows = rows.len(),
                                %coord,
                                "row events decoded"
                            );
                            for (key, vec_payload) in rows {
                                update_queue.enqueue(IndexUpdate {
                                    db: tmap.db.clone(),
                                    table: tmap.table.clone(),
                                    column: info.vector_column.clone(),
                                    key,
                                    payload: vec_payload,
                                    coord: coord.clone(),
                                });
                            }
                        }
                        Err(e) => {
                            // Log and drop; the stream continues.
                            tracing::warn!(table = %table_key, error = %e, "undecodable rows event");
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}
