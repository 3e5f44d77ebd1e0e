//! Binlog event decoding.
//!
//! Row-based replication delivers a `TABLE_MAP` event describing column
//! types before each `WRITE_ROWS` event, with `ROTATE` events marking
//! file boundaries. The decoders here are table-driven: each column type
//! has a parser that returns the decoded value and the new offset, so a
//! row image is walked column by column using the metadata captured from
//! the preceding table map.
//!
//! Limitations carried over from the upstream wire handling: tables are
//! decoded up to 255 columns, and row images are assumed to carry every
//! column non-NULL (full row images, the replication default; vector
//! tables keep their id and vector columns NOT NULL).

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Common header: timestamp(4), type(1), server_id(4), event_len(4),
/// next_pos(4), flags(2).
pub const EVENT_HEADER_LEN: usize = 19;

/// Offset of the type byte within the common header.
pub const EVENT_TYPE_OFFSET: usize = 4;

/// Trailing CRC32 carried by (most) events.
const EVENT_CHECKSUM_LEN: usize = 4;

// Binlog event type codes.
pub const ROTATE_EVENT: u8 = 4;
pub const TABLE_MAP_EVENT: u8 = 19;
pub const WRITE_ROWS_EVENT: u8 = 30;

// Column type codes from the wire protocol.
pub const TYPE_LONG: u8 = 3;
pub const TYPE_FLOAT: u8 = 4;
pub const TYPE_DOUBLE: u8 = 5;
pub const TYPE_LONGLONG: u8 = 8;
pub const TYPE_VARCHAR: u8 = 15;
pub const TYPE_BIT: u8 = 16;
pub const TYPE_TIMESTAMP2: u8 = 17;
pub const TYPE_DATETIME2: u8 = 18;
pub const TYPE_TIME2: u8 = 19;
pub const TYPE_JSON: u8 = 245;
pub const TYPE_NEWDECIMAL: u8 = 246;
pub const TYPE_ENUM: u8 = 247;
pub const TYPE_SET: u8 = 248;
pub const TYPE_BLOB: u8 = 252;
pub const TYPE_STRING: u8 = 254;
pub const TYPE_GEOMETRY: u8 = 255;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("event truncated at offset {0}")]
    Truncated(usize),

    #[error("unrecognized column type {0} in row image")]
    UnknownColumnType(u8),

    #[error("table has {0} columns, only tables up to 255 columns are decoded")]
    TooManyColumns(usize),
}

/// Type byte of a raw event buffer.
pub fn event_type(buf: &[u8]) -> Option<u8> {
    buf.get(EVENT_TYPE_OFFSET).copied()
}

fn need(buf: &[u8], at: usize, len: usize) -> Result<(), EventError> {
    if at + len > buf.len() {
        return Err(EventError::Truncated(at));
    }
    Ok(())
}

/// `ROTATE`: the position and name of the next binlog file. The first
/// rotate of a connection is synthetic and carries no trailing checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub next_file: String,
    pub position: u64,
}

pub fn parse_rotate(buf: &[u8], has_checksum: bool) -> Result<RotateEvent, EventError> {
    let mut at = EVENT_HEADER_LEN;
    need(buf, at, 8)?;
    let position = LittleEndian::read_u64(&buf[at..at + 8]);
    at += 8;

    let mut end = buf.len();
    if has_checksum {
        end = end.saturating_sub(EVENT_CHECKSUM_LEN);
    }
    if end < at {
        return Err(EventError::Truncated(at));
    }
    let next_file = String::from_utf8_lossy(&buf[at..end]).into_owned();
    Ok(RotateEvent {
        next_file,
        position,
    })
}

/// `TABLE_MAP`: numeric table id plus the column layout needed to decode
/// the row events that follow.
#[derive(Debug, Clone, Default)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub db: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_metadata: Vec<u16>,
}

/// Decode just far enough to name the table; callers skip the column
/// layout for tables that route nowhere.
pub fn parse_table_map_name(buf: &[u8]) -> Result<(String, String), EventError> {
    let (db, table, _) = parse_table_map_header(buf)?;
    Ok((db, table))
}

fn parse_table_map_header(buf: &[u8]) -> Result<(String, String, usize), EventError> {
    let mut at = EVENT_HEADER_LEN;

    need(buf, at, 6 + 2)?;
    at += 6; // table id (48-bit)
    at += 2; // flags

    need(buf, at, 1)?;
    let db_len = buf[at] as usize;
    at += 1;
    need(buf, at, db_len + 1)?;
    let db = String::from_utf8_lossy(&buf[at..at + db_len]).into_owned();
    at += db_len + 1; // trailing NUL

    need(buf, at, 1)?;
    let table_len = buf[at] as usize;
    at += 1;
    need(buf, at, table_len + 1)?;
    let table = String::from_utf8_lossy(&buf[at..at + table_len]).into_owned();
    at += table_len + 1;

    Ok((db, table, at))
}

pub fn parse_table_map(buf: &[u8]) -> Result<TableMapEvent, EventError> {
    let (db, table, mut at) = parse_table_map_header(buf)?;

    let mut table_id = [0u8; 8];
    need(buf, EVENT_HEADER_LEN, 6)?;
    table_id[..6].copy_from_slice(&buf[EVENT_HEADER_LEN..EVENT_HEADER_LEN + 6]);

    need(buf, at, 1)?;
    let n_columns = buf[at] as usize;
    at += 1;

    need(buf, at, n_columns)?;
    let column_types = buf[at..at + n_columns].to_vec();
    at += n_columns;

    need(buf, at, 1)?;
    at += 1; // metadata block length

    let mut column_metadata = Vec::with_capacity(n_columns);
    for &ty in &column_types {
        let meta = match ty {
            TYPE_FLOAT | TYPE_DOUBLE | TYPE_BLOB | TYPE_JSON | TYPE_GEOMETRY | TYPE_TIME2
            | TYPE_DATETIME2 | TYPE_TIMESTAMP2 => {
                need(buf, at, 1)?;
                let m = buf[at] as u16;
                at += 1;
                m
            }
            TYPE_BIT | TYPE_VARCHAR | TYPE_NEWDECIMAL | TYPE_SET | TYPE_ENUM | TYPE_STRING => {
                need(buf, at, 2)?;
                let m = LittleEndian::read_u16(&buf[at..at + 2]);
                at += 2;
                m
            }
            _ => 0,
        };
        column_metadata.push(meta);
    }

    Ok(TableMapEvent {
        table_id: u64::from_le_bytes(table_id),
        db,
        table,
        column_types,
        column_metadata,
    })
}

/// A decoded column value; only the shapes the pipeline routes on are
/// materialized.
enum ColumnValue<'a> {
    Unsigned(u64),
    Bytes(&'a [u8]),
    Skipped,
}

/// Parse one column of a row image, returning the value and new offset.
fn parse_column(
    ty: u8,
    meta: u16,
    buf: &[u8],
    at: usize,
) -> Result<(ColumnValue<'_>, usize), EventError> {
    match ty {
        TYPE_LONG => {
            need(buf, at, 4)?;
            Ok((
                ColumnValue::Unsigned(LittleEndian::read_u32(&buf[at..at + 4]) as u64),
                at + 4,
            ))
        }
        TYPE_LONGLONG => {
            need(buf, at, 8)?;
            Ok((
                ColumnValue::Unsigned(LittleEndian::read_u64(&buf[at..at + 8])),
                at + 8,
            ))
        }
        TYPE_VARCHAR => {
            // length prefix is 1 byte when the declared max fits one.
            let (len, mut next) = if meta < 256 {
                need(buf, at, 1)?;
                (buf[at] as usize, at + 1)
            } else {
                need(buf, at, 2)?;
                (LittleEndian::read_u16(&buf[at..at + 2]) as usize, at + 2)
            };
            need(buf, next, len)?;
            let bytes = &buf[next..next + len];
            next += len;
            Ok((ColumnValue::Bytes(bytes), next))
        }
        TYPE_TIMESTAMP2 => {
            // 4 bytes plus packed fractional seconds.
            let frac = (meta as usize + 1) / 2;
            need(buf, at, 4 + frac)?;
            Ok((ColumnValue::Skipped, at + 4 + frac))
        }
        other => Err(EventError::UnknownColumnType(other)),
    }
}

/// `WRITE_ROWS` decoded against its table map: every `(id, vector)` pair
/// at the recorded ordinal positions, covering single- and multi-row
/// events.
pub fn parse_write_rows(
    buf: &[u8],
    tmap: &TableMapEvent,
    id_position: usize,
    vec_position: usize,
) -> Result<Vec<(u64, Vec<u8>)>, EventError> {
    let n_columns = tmap.column_types.len();
    if n_columns > 255 {
        return Err(EventError::TooManyColumns(n_columns));
    }

    let mut at = EVENT_HEADER_LEN;
    need(buf, at, 6 + 2 + 2)?;
    at += 6; // table id
    at += 2; // flags

    // var-header length includes its own two bytes.
    let extra = LittleEndian::read_u16(&buf[at..at + 2]) as usize;
    at += extra.max(2);

    need(buf, at, 1)?;
    let ncols = buf[at] as usize;
    at += 1;
    if ncols != n_columns {
        // Row image disagrees with the captured table map; bail before
        // misreading offsets.
        return Err(EventError::Truncated(at));
    }

    let bitmap_len = ncols.div_ceil(8);
    need(buf, at, bitmap_len)?;
    at += bitmap_len; // included-columns bitmap, full images assumed

    let body_end = buf.len().saturating_sub(EVENT_CHECKSUM_LEN);
    let mut rows = Vec::new();

    while at < body_end {
        need(buf, at, bitmap_len)?;
        at += bitmap_len; // null bitmap, NOT NULL columns assumed

        let mut id: Option<u64> = None;
        let mut vector: Option<Vec<u8>> = None;

        for (i, (&ty, &meta)) in tmap
            .column_types
            .iter()
            .zip(&tmap.column_metadata)
            .enumerate()
        {
            let (value, next) = parse_column(ty, meta, buf, at)?;
            at = next;

            match value {
                ColumnValue::Unsigned(v) if i == id_position => id = Some(v),
                ColumnValue::Bytes(b) if i == vec_position => vector = Some(b.to_vec()),
                _ => {}
            }
        }

        if let (Some(id), Some(vector)) = (id, vector) {
            rows.push((id, vector));
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(event_type: u8, body_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_HEADER_LEN];
        buf[EVENT_TYPE_OFFSET] = event_type;
        LittleEndian::write_u32(
            &mut buf[9..13],
            (EVENT_HEADER_LEN + body_len) as u32,
        );
        buf
    }

    fn build_rotate(file: &str, position: u64, with_checksum: bool) -> Vec<u8> {
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

    pub(crate) fn build_table_map(db: &str, table: &str, columns: &[(u8, u16)]) -> Vec<u8> {
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
                TYPE_FLOAT | TYPE_DOUBLE | TYPE_BLOB | TYPE_JSON | TYPE_GEOMETRY | TYPE_TIME2
                | TYPE_DATETIME2 | TYPE_TIMESTAMP2 => meta.push(m as u8),
                TYPE_BIT | TYPE_VARCHAR | TYPE_NEWDECIMAL | TYPE_SET | TYPE_ENUM
                | TYPE_STRING => {
                    meta.extend_from_slice(&m.to_le_bytes());
                }
                _ => {}
            }
        }
        body.push(meta.len() as u8);
        body.extend_from_slice(&meta);

        let mut buf = header(TABLE_MAP_EVENT, body.len());
        buf.extend_from_slice(&body);
        buf
    }

    pub(crate) fn build_write_rows(
        tmap_columns: &[(u8, u16)],
        rows: &[Vec<RowValue>],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0]); // table id
        body.extend_from_slice(&[0, 0]); // flags
        body.extend_from_slice(&2u16.to_le_bytes()); // empty var header
        body.push(tmap_columns.len() as u8);
        let bitmap_len = tmap_columns.len().div_ceil(8);
        body.extend(std::iter::repeat(0xffu8).take(bitmap_len)); // included

        for row in rows {
            body.extend(std::iter::repeat(0u8).take(bitmap_len)); // null bitmap
            for value in row {
                match value {
                    RowValue::Long(v) => body.extend_from_slice(&(*v as u32).to_le_bytes()),
                    RowValue::LongLong(v) => body.extend_from_slice(&v.to_le_bytes()),
                    RowValue::Varchar(bytes, wide) => {
                        if *wide {
                            body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                        } else {
                            body.push(bytes.len() as u8);
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

    pub(crate) enum RowValue {
        Long(u64),
        LongLong(u64),
        Varchar(Vec<u8>, bool),
        Timestamp2,
    }

    #[test]
    fn rotate_with_and_without_checksum() {
        let ev = build_rotate("binlog.000042", 4, false);
        let parsed = parse_rotate(&ev, false).unwrap();
        assert_eq!(parsed.next_file, "binlog.000042");
        assert_eq!(parsed.position, 4);

        let ev = build_rotate("binlog.000043", 4, true);
        let parsed = parse_rotate(&ev, true).unwrap();
        assert_eq!(parsed.next_file, "binlog.000043");
    }

    #[test]
    fn table_map_layout() {
        let columns = [
            (TYPE_LONG, 0u16),
            (TYPE_VARCHAR, 40),
            (TYPE_TIMESTAMP2, 0),
        ];
        let ev = build_table_map("test", "books", &columns);
        assert_eq!(event_type(&ev), Some(TABLE_MAP_EVENT));

        let tmap = parse_table_map(&ev).unwrap();
        assert_eq!(tmap.db, "test");
        assert_eq!(tmap.table, "books");
        assert_eq!(tmap.column_types, vec![TYPE_LONG, TYPE_VARCHAR, TYPE_TIMESTAMP2]);
        assert_eq!(tmap.column_metadata, vec![0, 40, 0]);

        let (db, table) = parse_table_map_name(&ev).unwrap();
        assert_eq!((db.as_str(), table.as_str()), ("test", "books"));
    }

    #[test]
    fn write_rows_single_and_multi() {
        let columns = [(TYPE_LONG, 0u16), (TYPE_VARCHAR, 40)];
        let tmap = parse_table_map(&build_table_map("test", "t", &columns)).unwrap();

        let payload_a = vec![1u8, 2, 3, 4];
        let payload_b = vec![9u8, 9];
        let ev = build_write_rows(
            &columns,
            &[
                vec![RowValue::Long(7), RowValue::Varchar(payload_a.clone(), false)],
                vec![RowValue::Long(8), RowValue::Varchar(payload_b.clone(), false)],
            ],
        );

        let rows = parse_write_rows(&ev, &tmap, 0, 1).unwrap();
        assert_eq!(rows, vec![(7, payload_a), (8, payload_b)]);
    }

    #[test]
    fn write_rows_wide_varchar_and_bigint() {
        let columns = [(TYPE_LONGLONG, 0u16), (TYPE_VARCHAR, 4000)];
        let tmap = parse_table_map(&build_table_map("test", "t", &columns)).unwrap();

        let payload = vec![0xabu8; 300];
        let ev = build_write_rows(
            &columns,
            &[vec![
                RowValue::LongLong(1 << 40),
                RowValue::Varchar(payload.clone(), true),
            ]],
        );

        let rows = parse_write_rows(&ev, &tmap, 0, 1).unwrap();
        assert_eq!(rows, vec![(1 << 40, payload)]);
    }

    #[test]
    fn write_rows_skips_timestamp_columns() {
        let columns = [
            (TYPE_LONG, 0u16),
            (TYPE_VARCHAR, 40),
            (TYPE_TIMESTAMP2, 0),
        ];
        let tmap = parse_table_map(&build_table_map("test", "t", &columns)).unwrap();

        let ev = build_write_rows(
            &columns,
            &[vec![
                RowValue::Long(3),
                RowValue::Varchar(vec![5, 5], false),
                RowValue::Timestamp2,
            ]],
        );
        let rows = parse_write_rows(&ev, &tmap, 0, 1).unwrap();
        assert_eq!(rows, vec![(3, vec![5, 5])]);
    }

    #[test]
    fn unknown_column_type_fails_decode() {
        let columns = [(TYPE_LONG, 0u16), (TYPE_GEOMETRY, 1)];
        let tmap = parse_table_map(&build_table_map("test", "t", &columns)).unwrap();
        let ev = build_write_rows(&columns, &[vec![RowValue::Long(1)]]);
        assert!(matches!(
            parse_write_rows(&ev, &tmap, 0, 1),
            Err(EventError::UnknownColumnType(TYPE_GEOMETRY))
        ));
    }

    #[test]
    fn truncated_event_is_rejected() {
        let columns = [(TYPE_LONG, 0u16)];
        let ev = build_table_map("test", "t", &columns);
        assert!(parse_table_map(&ev[..EVENT_HEADER_LEN + 3]).is_err());
    }
}
