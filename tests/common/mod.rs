//! Shared test fixtures: an in-memory fake host and binlog event
//! builders for driving the CDC pipeline without a server.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

use myvector::cdc::config::CdcConfig;
use myvector::host::{BinlogStream, HostConnector, HostSession, VectorColumnDef};

pub const TYPE_LONG: u8 = 3;
pub const TYPE_VARCHAR: u8 = 15;
pub const TYPE_TIMESTAMP2: u8 = 17;

const EVENT_HEADER_LEN: usize = 19;
const EVENT_TYPE_OFFSET: usize = 4;
const ROTATE_EVENT: u8 = 4;
const TABLE_MAP_EVENT: u8 = 19;
const WRITE_ROWS_EVENT: u8 = 30;

#[derive(Default)]
pub struct FakeHostState {
    /// `db.table` → rows served by table scans.
    pub tables: HashMap<String, Vec<(u64, Vec<u8>)>>,
    /// Dictionary of declared vector columns.
    pub columns: Vec<VectorColumnDef>,
    /// `db.table` → (id ordinal, vector ordinal), 1-based.
    pub positions: HashMap<String, (u32, u32)>,
    /// Scripted replication stream.
    pub events: Vec<Vec<u8>>,
    /// WHERE clauses observed by scans, for assertions.
    pub scanned_where: Vec<String>,
    /// (start_file, start_offset) of each binlog_stream open.
    pub binlog_requests: Vec<(Option<String>, u64)>,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeHostState>>,
}

impl FakeHost {
    pub fn new(state: FakeHostState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeHostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

impl HostConnector for FakeHost {
    fn connect(&self, _config: &CdcConfig) -> Result<Box<dyn HostSession>> {
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeSession {
    state: Arc<Mutex<FakeHostState>>,
}

impl HostSession for FakeSession {
    fn prepare_replication(&mut self) -> Result<()> {
        Ok(())
    }

    fn vector_columns(&mut self) -> Result<Vec<VectorColumnDef>> {
        Ok(self.state.lock().unwrap().columns.clone())
    }

    fn column_positions(
        &mut self,
        db: &str,
        table: &str,
        _id_col: &str,
        _vec_col: &str,
    ) -> Result<(u32, u32)> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .get(&format!("{db}.{table}"))
            .copied()
            .unwrap_or((0, 0)))
    }

    fn scan_table(
        &mut self,
        db: &str,
        table: &str,
        _id_col: &str,
        _vec_col: &str,
        where_clause: &str,
        sink: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let rows = {
            let mut state = self.state.lock().unwrap();
            state.scanned_where.push(where_clause.to_string());
            match state.tables.get(&format!("{db}.{table}")) {
                Some(rows) => rows.clone(),
                None => bail!("unknown table {db}.{table}"),
            }
        };
        for (id, payload) in rows {
            sink(id, &payload)?;
        }
        Ok(())
    }

    fn binlog_stream(
        &mut self,
        start_file: Option<&str>,
        start_offset: u64,
    ) -> Result<Box<dyn BinlogStream>> {
        let mut state = self.state.lock().unwrap();
        state
            .binlog_requests
            .push((start_file.map(str::to_string), start_offset));
        Ok(Box::new(FakeStream {
            events: state.events.iter().cloned().collect(),
        }))
    }
}

pub struct FakeStream {
    events: VecDeque<Vec<u8>>,
}

impl BinlogStream for FakeStream {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.events.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Binlog event builders
// ---------------------------------------------------------------------------

pub enum RowValue {
    Long(u64),
    Varchar(Vec<u8>),
    Timestamp2,
}

fn header(event_type: u8, body_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; EVENT_HEADER_LEN];
    buf[EVENT_TYPE_OFFSET] = event_type;
    LittleEndian::write_u32(&mut buf[9..13], (EVENT_HEADER_LEN + body_len) as u32);
    buf
}

pub fn build_rotate(file: &str, position: u64, with_checksum: bool) -> Vec<u8> {
    let body_len = 8 + file.len() + if with_checksum { 4 } else { 0 };
    let mut buf = header(ROTATE_EVENT, body_len);
    let mut pos = [0u8; 8];
    LittleEndian::write_u64(&mut pos, position);
    buf.extend_from_slice(&pos);
    buf.extend_from_slice(file.as_bytes());
    if with_checksum {
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    }
    buf
}

pub fn build_table_map(db: &str, table: &str, columns: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[1, 0, 0, 0, 0, 0]); // table id
    body.extend_from_slice(&[0, 0]); // flags
    body.push(db.len() as u8);
    body.extend_from_slice(db.as_bytes());
    body.push(0);
    body.push(table.len() as u8);
    body.extend_from_slice(table.as_bytes());
    body.push(0);
    body.push(columns.len() as u8);
    for &(ty, _) in columns {
        body.push(ty);
    }
    let mut meta = Vec::new();
    for &(ty, m) in columns {
        match ty {
            TYPE_VARCHAR => meta.extend_from_slice(&m.to_le_bytes()),
            TYPE_TIMESTAMP2 => meta.push(m as u8),
            _ => {}
        }
    }
    body.push(meta.len() as u8);
    body.extend_from_slice(&meta);

    let mut buf = header(TABLE_MAP_EVENT, body.len());
    buf.extend_from_slice(&body);
    buf
}

pub fn build_write_rows(columns: &[(u8, u16)], rows: &[Vec<RowValue>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[1, 0, 0, 0, 0, 0]); // table id
    body.extend_from_slice(&[0, 0]); // flags
    body.extend_from_slice(&2u16.to_le_bytes()); // empty var header
    body.push(columns.len() as u8);
    let bitmap_len = columns.len().div_ceil(8);
    body.extend(std::iter::repeat(0xffu8).take(bitmap_len)); // included

    for row in rows {
        body.extend(std::iter::repeat(0u8).take(bitmap_len)); // null bitmap
        for (value, &(_, meta)) in row.iter().zip(columns) {
            match value {
                RowValue::Long(v) => body.extend_from_slice(&(*v as u32).to_le_bytes()),
                RowValue::Varchar(bytes) => {
                    if meta < 256 {
                        body.push(bytes.len() as u8);
                    } else {
                        body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                    }
                    body.extend_from_slice(bytes);
                }
                RowValue::Timestamp2 => body.extend_from_slice(&[0, 0, 0, 0]),
            }
        }
    }
    body.extend_from_slice(&[0, 0, 0, 0]); // checksum

    let mut buf = header(WRITE_ROWS_EVENT, body.len());
    buf.extend_from_slice(&body);
    buf
}
