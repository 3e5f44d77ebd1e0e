//! Vector payload codec.
//!
//! # Wire format (little-endian)
//!
//! ```text
//! Offset            Size     Description
//! ──────────────────────────────────────────────────────────
//! 0x00              N*4      f32 elements            (float vectors)
//!                   N/8      packed bits, LSB-first  (bit vectors)
//! data_len          4        metadata word: version | (kind << 8)
//! data_len + 4      4        CRC-32 over all preceding bytes
//! ```
//!
//! Every payload stored in a MYVECTOR column, passed to a scalar
//! function, or decoded off the binlog carries this trailer. The
//! checksum is verified on every decode.

use std::fmt::Write as _;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::options::OptionsMap;

/// Payload format version.
pub const VERSION_V1: u8 = 0x01;

/// Element-type tags in the metadata word.
pub const ELEM_FP32: u8 = 0x01;
pub const ELEM_BV: u8 = 0x04;

/// Trailer size: 4-byte metadata word + 4-byte checksum.
pub const COLUMN_EXTRA_LEN: usize = 8;

/// Supported dimension range.
pub const MIN_DIM: usize = 2;
pub const MAX_DIM: usize = 4096;

/// Default precision for [`render`].
pub const DISPLAY_DEFAULT_PRECISION: usize = 7;

const BITS_PER_BYTE: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("payload truncated: {0} bytes")]
    Truncated(usize),

    #[error("unrecognized payload metadata word {0:#010x}")]
    BadMetadata(u32),

    #[error("payload checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("vector dimension {0} outside [{MIN_DIM}, {MAX_DIM}]")]
    DimensionOutOfRange(usize),

    #[error("binary vector dimension {0} is not a multiple of 64")]
    BitDimensionNotAligned(usize),

    #[error("packed float input length {0} is not a multiple of 4")]
    UnalignedFloats(usize),

    #[error("cannot parse vector element '{0}'")]
    BadElement(String),

    #[error("unsupported construct conversion i={input}, o={output}")]
    UnsupportedConversion { input: String, output: String },
}

/// Vector element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Float32,
    Bit,
}

impl VectorKind {
    fn elem_tag(self) -> u8 {
        match self {
            VectorKind::Float32 => ELEM_FP32,
            VectorKind::Bit => ELEM_BV,
        }
    }

    fn metadata_word(self) -> u32 {
        VERSION_V1 as u32 | ((self.elem_tag() as u32) << 8)
    }

    /// Serialized column width for a vector of `dim` dimensions.
    pub fn storage_len(self, dim: usize) -> usize {
        match self {
            VectorKind::Float32 => dim * 4 + COLUMN_EXTRA_LEN,
            VectorKind::Bit => dim / BITS_PER_BYTE + COLUMN_EXTRA_LEN,
        }
    }

    /// Dimension implied by a serialized column width.
    pub fn dim_from_storage_len(self, len: usize) -> usize {
        match self {
            VectorKind::Float32 => (len - COLUMN_EXTRA_LEN) / 4,
            VectorKind::Bit => (len - COLUMN_EXTRA_LEN) * BITS_PER_BYTE,
        }
    }
}

/// Decoded, checksum-verified view over a payload's data bytes.
#[derive(Debug, Clone, Copy)]
pub struct VectorPayload<'a> {
    pub kind: VectorKind,
    pub dim: usize,
    data: &'a [u8],
}

impl<'a> VectorPayload<'a> {
    /// Raw element bytes, without the trailer.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Copy out f32 elements. Payload bytes may be unaligned, so this
    /// always materializes a fresh buffer.
    pub fn floats(&self) -> Vec<f32> {
        debug_assert_eq!(self.kind, VectorKind::Float32);
        let mut out = vec![0.0f32; self.dim];
        LittleEndian::read_f32_into(self.data, &mut out);
        out
    }
}

fn metadata_kind(word: u32) -> Option<VectorKind> {
    if word & 0xff != VERSION_V1 as u32 {
        return None;
    }
    match ((word >> 8) & 0xff) as u8 {
        ELEM_FP32 => Some(VectorKind::Float32),
        ELEM_BV => Some(VectorKind::Bit),
        _ => None,
    }
}

fn check_dim(kind: VectorKind, dim: usize) -> Result<(), PayloadError> {
    if !(MIN_DIM..=MAX_DIM).contains(&dim) {
        return Err(PayloadError::DimensionOutOfRange(dim));
    }
    if kind == VectorKind::Bit && dim % 64 != 0 {
        return Err(PayloadError::BitDimensionNotAligned(dim));
    }
    Ok(())
}

fn append_trailer(mut data: Vec<u8>, kind: VectorKind) -> Vec<u8> {
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, kind.metadata_word());
    data.extend_from_slice(&word);

    let cksum = crc32fast::hash(&data);
    let mut tail = [0u8; 4];
    LittleEndian::write_u32(&mut tail, cksum);
    data.extend_from_slice(&tail);
    data
}

/// Serialize f32 elements into a v1 float payload.
pub fn encode_f32(elems: &[f32]) -> Result<Vec<u8>, PayloadError> {
    check_dim(VectorKind::Float32, elems.len())?;
    let mut data = vec![0u8; elems.len() * 4];
    LittleEndian::write_f32_into(elems, &mut data);
    Ok(append_trailer(data, VectorKind::Float32))
}

/// Serialize packed bit bytes into a v1 bit payload.
pub fn encode_bits(bits: &[u8]) -> Result<Vec<u8>, PayloadError> {
    check_dim(VectorKind::Bit, bits.len() * BITS_PER_BYTE)?;
    Ok(append_trailer(bits.to_vec(), VectorKind::Bit))
}

/// Decode and verify a payload. The checksum is always checked.
pub fn decode(bytes: &[u8]) -> Result<VectorPayload<'_>, PayloadError> {
    if bytes.len() < COLUMN_EXTRA_LEN + 1 {
        return Err(PayloadError::Truncated(bytes.len()));
    }

    let data_len = bytes.len() - COLUMN_EXTRA_LEN;
    let word = LittleEndian::read_u32(&bytes[data_len..data_len + 4]);
    let kind = metadata_kind(word).ok_or(PayloadError::BadMetadata(word))?;

    let stored = LittleEndian::read_u32(&bytes[data_len + 4..]);
    let computed = crc32fast::hash(&bytes[..data_len + 4]);
    if stored != computed {
        return Err(PayloadError::ChecksumMismatch { stored, computed });
    }

    let dim = match kind {
        VectorKind::Float32 => {
            if data_len % 4 != 0 {
                return Err(PayloadError::UnalignedFloats(data_len));
            }
            data_len / 4
        }
        VectorKind::Bit => data_len * BITS_PER_BYTE,
    };
    check_dim(kind, dim)?;

    Ok(VectorPayload {
        kind,
        dim,
        data: &bytes[..data_len],
    })
}

/// Checksum + dimension check used by the `myvector_is_valid` scalar.
pub fn validate(bytes: &[u8], expected_dim: usize) -> bool {
    match decode(bytes) {
        Ok(view) => view.dim == expected_dim,
        Err(_) => false,
    }
}

/// Parse a textual vector: `[0.1, 0.2]`, `{0.1 0.2}`, `(0.1,0.2)`, or a
/// bare delimiter-free list. Separators are commas and/or spaces.
fn parse_text_elems(text: &str) -> Result<Vec<String>, PayloadError> {
    let trimmed = text.trim();
    let body = match trimmed.as_bytes().first() {
        Some(b'[') => trimmed.trim_start_matches('[').trim_end_matches(']'),
        Some(b'{') => trimmed.trim_start_matches('{').trim_end_matches('}'),
        Some(b'(') => trimmed.trim_start_matches('(').trim_end_matches(')'),
        _ => trimmed,
    };

    Ok(body
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_text_floats(text: &str) -> Result<Vec<f32>, PayloadError> {
    parse_text_elems(text)?
        .into_iter()
        .map(|s| {
            s.parse::<f32>()
                .map_err(|_| PayloadError::BadElement(s.clone()))
        })
        .collect()
}

/// Scalar quantization from floats to a bit vector: bit `i` is set iff
/// `elems[i] > 0`. Bits are packed LSB-first within each 64-bit word.
pub fn quantize_to_bits(elems: &[f32]) -> Result<Vec<u8>, PayloadError> {
    check_dim(VectorKind::Bit, elems.len())?;
    let mut words = vec![0u64; elems.len() / 64];
    for (i, &v) in elems.iter().enumerate() {
        if v > 0.0 {
            words[i / 64] |= 1u64 << (i % 64);
        }
    }
    let mut bytes = vec![0u8; words.len() * 8];
    LittleEndian::write_u64_into(&words, &mut bytes);
    Ok(bytes)
}

/// The `myvector_construct` entrypoint: build a payload from one of the
/// accepted input flavors. `opts` follows the `i=`/`o=` convention:
///
/// | i        | o      | behavior                                         |
/// |----------|--------|--------------------------------------------------|
/// | `string` | `float`| parse text list of floats (default)              |
/// | `float`  | `float`| input is already-packed f32 bytes                |
/// | `bv`     | `bv`   | input is raw bit-vector bytes                    |
/// | `string` | `bv`   | parse text list of byte values                   |
/// | `float`  | `bv`   | quantize packed f32 bytes                        |
/// | `column` | `bv`   | quantize an existing float payload               |
pub fn construct(input: &[u8], opts: Option<&str>) -> Result<Vec<u8>, PayloadError> {
    let (in_kind, out_kind) = match opts {
        Some(o) if !o.is_empty() => {
            let map = OptionsMap::parse(o)
                .map_err(|_| PayloadError::BadElement(o.to_string()))?;
            (
                map.get("i").unwrap_or("string").to_string(),
                map.get("o").unwrap_or("float").to_string(),
            )
        }
        _ => ("string".to_string(), "float".to_string()),
    };

    match (in_kind.as_str(), out_kind.as_str()) {
        ("string", "float") => {
            let text = String::from_utf8_lossy(input);
            encode_f32(&parse_text_floats(&text)?)
        }
        ("float", "float") => {
            if input.len() % 4 != 0 {
                return Err(PayloadError::UnalignedFloats(input.len()));
            }
            let mut elems = vec![0.0f32; input.len() / 4];
            LittleEndian::read_f32_into(input, &mut elems);
            encode_f32(&elems)
        }
        ("bv", "bv") => encode_bits(input),
        ("string", "bv") => {
            let text = String::from_utf8_lossy(input);
            let bytes = parse_text_elems(&text)?
                .into_iter()
                .map(|s| {
                    s.parse::<u8>()
                        .map_err(|_| PayloadError::BadElement(s.clone()))
                })
                .collect::<Result<Vec<u8>, _>>()?;
            encode_bits(&bytes)
        }
        ("float", "bv") => {
            if input.len() % 4 != 0 {
                return Err(PayloadError::UnalignedFloats(input.len()));
            }
            let mut elems = vec![0.0f32; input.len() / 4];
            LittleEndian::read_f32_into(input, &mut elems);
            encode_bits(&quantize_to_bits(&elems)?)
        }
        ("column", "bv") => {
            let view = decode(input)?;
            encode_bits(&quantize_to_bits(&view.floats())?)
        }
        _ => Err(PayloadError::UnsupportedConversion {
            input: in_kind,
            output: out_kind,
        }),
    }
}

/// Render a payload as `[x0 x1 …]`. Float elements print with
/// `precision` fractional digits (default 7); bit vectors print raw
/// byte values.
///
/// Payloads with an unrecognized trailer are rendered as legacy packed
/// f32 buffers for read-only compatibility with pre-v1 columns.
pub fn render(bytes: &[u8], precision: Option<usize>) -> Result<String, PayloadError> {
    let precision = precision.unwrap_or(DISPLAY_DEFAULT_PRECISION).max(1);

    enum View<'a> {
        Floats(Vec<f32>),
        Bytes(&'a [u8]),
    }

    let view = match decode(bytes) {
        Ok(p) => match p.kind {
            VectorKind::Float32 => View::Floats(p.floats()),
            VectorKind::Bit => View::Bytes(p.data()),
        },
        Err(PayloadError::BadMetadata(_)) => {
            // Legacy v0 columns: the whole buffer is packed f32.
            if bytes.len() % 4 != 0 {
                return Err(PayloadError::UnalignedFloats(bytes.len()));
            }
            let mut elems = vec![0.0f32; bytes.len() / 4];
            LittleEndian::read_f32_into(bytes, &mut elems);
            View::Floats(elems)
        }
        Err(e) => return Err(e),
    };

    let mut out = String::from("[");
    match view {
        View::Floats(elems) => {
            for (i, v) in elems.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{:.*}", precision, v);
            }
        }
        View::Bytes(data) => {
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{b}");
            }
        }
    }
    out.push(']');
    Ok(out)
}
