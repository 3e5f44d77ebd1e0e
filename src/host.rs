//! Host-database seams.
//!
//! The host's SQL executor, schema dictionary, and replication endpoint
//! are external collaborators. The engine reaches them through these
//! traits; tests drive the pipeline with in-memory fakes, and a real
//! deployment supplies a client-backed implementation from the plugin
//! shell.

use anyhow::Result;

use crate::cdc::config::CdcConfig;

/// A vector column discovered from the host's dictionary
/// (`db`, `table`, `column`, and the stored option string).
#[derive(Debug, Clone)]
pub struct VectorColumnDef {
    pub db: String,
    pub table: String,
    pub column: String,
    pub options: String,
}

impl VectorColumnDef {
    /// Registry key: `db.table.column`.
    pub fn index_name(&self) -> String {
        format!("{}.{}.{}", self.db, self.table, self.column)
    }

    /// Routing key: `db.table`.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.db, self.table)
    }
}

/// A replication event stream. `fetch` blocks on the network; `Ok(None)`
/// is a clean upstream close.
pub trait BinlogStream: Send {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>>;
}

/// One authenticated session against the host.
pub trait HostSession: Send {
    /// Disable checksum rewriting and stretch network timeouts before the
    /// session is used as a replication client.
    fn prepare_replication(&mut self) -> Result<()>;

    /// All declared vector columns, from the host's dictionary.
    fn vector_columns(&mut self) -> Result<Vec<VectorColumnDef>>;

    /// 1-based ordinal positions of the id and vector columns within the
    /// base table, from the schema dictionary.
    fn column_positions(
        &mut self,
        db: &str,
        table: &str,
        id_col: &str,
        vec_col: &str,
    ) -> Result<(u32, u32)>;

    /// Scan `SELECT id_col, vec_col FROM db.table [where_clause]` with
    /// the table locked for read, feeding each row to `sink`.
    fn scan_table(
        &mut self,
        db: &str,
        table: &str,
        id_col: &str,
        vec_col: &str,
        where_clause: &str,
        sink: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Open the replication stream from `(start_file, start_offset)`, or
    /// from the host's current log when no file is given.
    fn binlog_stream(
        &mut self,
        start_file: Option<&str>,
        start_offset: u64,
    ) -> Result<Box<dyn BinlogStream>>;
}

/// Session factory; the CDC consumer retries `connect` until the host
/// accepts the configured credentials.
pub trait HostConnector: Send + Sync {
    fn connect(&self, config: &CdcConfig) -> Result<Box<dyn HostSession>>;
}
