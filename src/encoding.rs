//! On-disk codecs: TLV values, raw (zstd) and dictionary column blocks, delta timestamp blocks.
//!
//! All integers are little-endian. The encoders exist for fixtures and tooling; the ingest
//! path that normally produces these files lives elsewhere.

use crate::error::{ReadError, Result};
use crate::types::MAX_RECORDS_PER_BLOCK;

use crc32fast::Hasher as Crc32;
use std::io::Write;

// --- Tags ---

/// Column block holding a zstd-compressed stream of TLV records.
pub const BLOCK_ENC_RAW_ZSTD: u8 = 0x01;
/// Column block holding a dictionary of TLV words and their record numbers.
pub const BLOCK_ENC_DICTIONARY: u8 = 0x02;
/// Timestamp block: low timestamp plus fixed-width deltas from it.
pub const TS_ENC_TOPDIFF: u8 = 0x03;

const TS_HEADER_LEN: usize = 1 + 1 + 8;
const MAX_SHORT_LEN: usize = u16::MAX as usize;

/// Per-block encoding chosen independently for every column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEncoding {
    RawZstd,
    Dictionary,
}

impl BlockEncoding {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            BLOCK_ENC_RAW_ZSTD => Ok(BlockEncoding::RawZstd),
            BLOCK_ENC_DICTIONARY => Ok(BlockEncoding::Dictionary),
            other => Err(ReadError::corruption(format!(
                "Unknown block encoding tag {:#04x}",
                other
            ))),
        }
    }
}

/// Type tag of a TLV record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Backfill = 0x00,
    Bool = 0x01,
    Int8 = 0x02,
    Int16 = 0x03,
    Int32 = 0x04,
    Int64 = 0x05,
    Uint8 = 0x06,
    Uint16 = 0x07,
    Uint32 = 0x08,
    Uint64 = 0x09,
    Float64 = 0x0A,
    SmallString = 0x0B,
    RawJson = 0x0C,
    DictArray = 0x0D,
}

impl ValueType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        let t = match tag {
            0x00 => ValueType::Backfill,
            0x01 => ValueType::Bool,
            0x02 => ValueType::Int8,
            0x03 => ValueType::Int16,
            0x04 => ValueType::Int32,
            0x05 => ValueType::Int64,
            0x06 => ValueType::Uint8,
            0x07 => ValueType::Uint16,
            0x08 => ValueType::Uint32,
            0x09 => ValueType::Uint64,
            0x0A => ValueType::Float64,
            0x0B => ValueType::SmallString,
            0x0C => ValueType::RawJson,
            0x0D => ValueType::DictArray,
            other => {
                return Err(ReadError::corruption(format!(
                    "Unknown value type tag {:#04x}",
                    other
                )))
            }
        };
        Ok(t)
    }

    /// Payload width for fixed-size types; `None` when a 2-byte length prefix follows the tag.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ValueType::Backfill => Some(0),
            ValueType::Bool | ValueType::Int8 | ValueType::Uint8 => Some(1),
            ValueType::Int16 | ValueType::Uint16 => Some(2),
            ValueType::Int32 | ValueType::Uint32 => Some(4),
            ValueType::Int64 | ValueType::Uint64 | ValueType::Float64 => Some(8),
            ValueType::SmallString | ValueType::RawJson | ValueType::DictArray => None,
        }
    }
}

/// A decoded TLV value. Variable-length variants borrow from the block buffer they were
/// decoded from, so the buffer cannot be reused while a value is alive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TlvValue<'a> {
    Backfill,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float64(f64),
    Str(&'a str),
    RawJson(&'a [u8]),
    DictArray(&'a [u8]),
}

impl TlvValue<'_> {
    pub fn value_type(&self) -> ValueType {
        match self {
            TlvValue::Backfill => ValueType::Backfill,
            TlvValue::Bool(_) => ValueType::Bool,
            TlvValue::Int8(_) => ValueType::Int8,
            TlvValue::Int16(_) => ValueType::Int16,
            TlvValue::Int32(_) => ValueType::Int32,
            TlvValue::Int64(_) => ValueType::Int64,
            TlvValue::Uint8(_) => ValueType::Uint8,
            TlvValue::Uint16(_) => ValueType::Uint16,
            TlvValue::Uint32(_) => ValueType::Uint32,
            TlvValue::Uint64(_) => ValueType::Uint64,
            TlvValue::Float64(_) => ValueType::Float64,
            TlvValue::Str(_) => ValueType::SmallString,
            TlvValue::RawJson(_) => ValueType::RawJson,
            TlvValue::DictArray(_) => ValueType::DictArray,
        }
    }
}

/// Appends the TLV encoding of `v` to `out`.
pub fn encode_tlv(v: &TlvValue<'_>, out: &mut Vec<u8>) -> Result<()> {
    out.push(v.value_type() as u8);
    match *v {
        TlvValue::Backfill => {}
        TlvValue::Bool(b) => out.push(b as u8),
        TlvValue::Int8(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Int16(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Int32(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Int64(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Uint8(x) => out.push(x),
        TlvValue::Uint16(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Uint32(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Uint64(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Float64(x) => out.extend_from_slice(&x.to_le_bytes()),
        TlvValue::Str(s) => write_short_bytes(out, s.as_bytes())?,
        TlvValue::RawJson(b) | TlvValue::DictArray(b) => write_short_bytes(out, b)?,
    }
    Ok(())
}

/// Total length (tag included) of the TLV record starting at `offset`.
pub fn tlv_record_len(buf: &[u8], offset: usize) -> Result<usize> {
    let tag = *buf
        .get(offset)
        .ok_or_else(|| ReadError::corruption("TLV record starts past end of block"))?;
    let len = match ValueType::from_tag(tag)?.fixed_width() {
        Some(w) => 1 + w,
        None => 3 + read_u16_at(buf, offset + 1)? as usize,
    };
    if offset + len > buf.len() {
        return Err(ReadError::corruption("Truncated TLV record"));
    }
    Ok(len)
}

/// Decodes one TLV record from the start of `buf`. Returns the value and its encoded length.
pub fn decode_tlv(buf: &[u8]) -> Result<(TlvValue<'_>, usize)> {
    let len = tlv_record_len(buf, 0)?;
    let p = &buf[1..len];
    let v = match ValueType::from_tag(buf[0])? {
        ValueType::Backfill => TlvValue::Backfill,
        ValueType::Bool => TlvValue::Bool(p[0] != 0),
        ValueType::Int8 => TlvValue::Int8(p[0] as i8),
        ValueType::Int16 => TlvValue::Int16(i16::from_le_bytes([p[0], p[1]])),
        ValueType::Int32 => TlvValue::Int32(i32::from_le_bytes(fixed(p)?)),
        ValueType::Int64 => TlvValue::Int64(i64::from_le_bytes(fixed(p)?)),
        ValueType::Uint8 => TlvValue::Uint8(p[0]),
        ValueType::Uint16 => TlvValue::Uint16(u16::from_le_bytes([p[0], p[1]])),
        ValueType::Uint32 => TlvValue::Uint32(u32::from_le_bytes(fixed(p)?)),
        ValueType::Uint64 => TlvValue::Uint64(u64::from_le_bytes(fixed(p)?)),
        ValueType::Float64 => TlvValue::Float64(f64::from_le_bytes(fixed(p)?)),
        ValueType::SmallString => TlvValue::Str(
            std::str::from_utf8(&p[2..])
                .map_err(|e| ReadError::corruption(format!("Invalid UTF-8 in string: {}", e)))?,
        ),
        ValueType::RawJson => TlvValue::RawJson(&p[2..]),
        ValueType::DictArray => TlvValue::DictArray(&p[2..]),
    };
    Ok((v, len))
}

fn fixed<const N: usize>(p: &[u8]) -> Result<[u8; N]> {
    p.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ReadError::corruption("Truncated fixed-width value"))
}

// --- Raw (zstd) blocks ---

/// Encodes a raw block from already TLV-encoded records.
pub fn encode_raw_block(records: &[Vec<u8>], level: i32) -> Result<Vec<u8>> {
    let mut stream = Vec::with_capacity(records.iter().map(|r| r.len()).sum());
    for r in records {
        stream.extend_from_slice(r);
    }
    let compressed = zstd::bulk::compress(&stream, level)
        .map_err(|e| ReadError::Internal(format!("Zstd compress failed: {}", e)))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(BLOCK_ENC_RAW_ZSTD);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decompresses a raw block payload (tag already stripped) into `out`, replacing its contents.
pub fn decompress_raw_block(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    zstd::stream::copy_decode(payload, &mut *out)
        .map_err(|e| ReadError::corruption(format!("Zstd decompress failed: {}", e)))
}

// --- Dictionary blocks ---

/// Marks a record that no dictionary word claimed.
pub const NO_WORD: u16 = u16::MAX;

/// Parsed dictionary block. Word ranges index into the buffer the block was parsed from.
#[derive(Debug, Default)]
pub struct DictBlock {
    pub words: Vec<(usize, usize)>,
    /// `record number -> word index`, [`NO_WORD`] when unclaimed.
    pub rec_to_word: Vec<u16>,
}

impl DictBlock {
    /// TLV bytes of the word holding `record`, if any word claimed it.
    #[inline]
    pub fn word_for<'a>(&self, buf: &'a [u8], record: usize) -> Option<&'a [u8]> {
        let w = *self.rec_to_word.get(record)?;
        if w == NO_WORD {
            return None;
        }
        let (s, e) = self.words[w as usize];
        Some(&buf[s..e])
    }
}

/// Parses `[numWords:2]{[word TLV][numRecs:2][recNum:2]*}*` starting at `start`.
///
/// Duplicate or out-of-range record numbers are corruption. Unclaimed records are left as
/// [`NO_WORD`]; whether that is acceptable depends on the column.
pub fn parse_dict_block(
    buf: &[u8],
    start: usize,
    record_count: usize,
    out: &mut DictBlock,
) -> Result<()> {
    if record_count > MAX_RECORDS_PER_BLOCK {
        return Err(ReadError::corruption(format!(
            "Record count {} exceeds block limit",
            record_count
        )));
    }
    let num_words = read_u16_at(buf, start)? as usize;
    if num_words >= NO_WORD as usize {
        return Err(ReadError::corruption("Too many dictionary words"));
    }
    out.words.clear();
    out.words.reserve(num_words);
    out.rec_to_word.clear();
    out.rec_to_word.resize(record_count, NO_WORD);

    let mut off = start + 2;
    for word_idx in 0..num_words {
        let wlen = tlv_record_len(buf, off)?;
        out.words.push((off, off + wlen));
        off += wlen;

        let num_recs = read_u16_at(buf, off)? as usize;
        off += 2;
        for _ in 0..num_recs {
            let rec = read_u16_at(buf, off)? as usize;
            off += 2;
            let slot = out.rec_to_word.get_mut(rec).ok_or_else(|| {
                ReadError::corruption(format!(
                    "Dictionary record {} out of range (block has {})",
                    rec, record_count
                ))
            })?;
            if *slot != NO_WORD {
                return Err(ReadError::corruption(format!(
                    "Dictionary record {} claimed by two words",
                    rec
                )));
            }
            *slot = word_idx as u16;
        }
    }
    Ok(())
}

/// Encodes a dictionary block from `(word TLV, record numbers)` pairs.
pub fn encode_dict_block(words: &[(Vec<u8>, Vec<u16>)]) -> Result<Vec<u8>> {
    if words.len() >= NO_WORD as usize {
        return Err(ReadError::Internal("Too many dictionary words".to_string()));
    }
    let mut out = vec![BLOCK_ENC_DICTIONARY];
    write_u16(&mut out, words.len() as u16);
    for (word, recs) in words {
        out.extend_from_slice(word);
        let n: u16 = recs
            .len()
            .try_into()
            .map_err(|_| ReadError::Internal("Too many records for one word".to_string()))?;
        write_u16(&mut out, n);
        for r in recs {
            write_u16(&mut out, *r);
        }
    }
    Ok(out)
}

// --- Timestamp blocks ---

/// Width of each stored delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaWidth {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x03,
    U64 = 0x04,
}

impl DeltaWidth {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(DeltaWidth::U8),
            0x02 => Ok(DeltaWidth::U16),
            0x03 => Ok(DeltaWidth::U32),
            0x04 => Ok(DeltaWidth::U64),
            other => Err(ReadError::corruption(format!(
                "Unknown timestamp delta width tag {:#04x}",
                other
            ))),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            DeltaWidth::U8 => 1,
            DeltaWidth::U16 => 2,
            DeltaWidth::U32 => 4,
            DeltaWidth::U64 => 8,
        }
    }

    /// Smallest width able to hold `max_delta`.
    pub fn for_max_delta(max_delta: u64) -> Self {
        if max_delta <= u8::MAX as u64 {
            DeltaWidth::U8
        } else if max_delta <= u16::MAX as u64 {
            DeltaWidth::U16
        } else if max_delta <= u32::MAX as u64 {
            DeltaWidth::U32
        } else {
            DeltaWidth::U64
        }
    }
}

/// Encodes timestamps as `[TOPDIFF][width][low:8][delta]*` with the narrowest width.
pub fn encode_timestamp_block(timestamps: &[u64]) -> Vec<u8> {
    let low = timestamps.iter().copied().min().unwrap_or(0);
    let max_delta = timestamps.iter().map(|t| t - low).max().unwrap_or(0);
    encode_timestamp_block_with_width(timestamps, DeltaWidth::for_max_delta(max_delta))
}

/// Same as [`encode_timestamp_block`] with a caller-chosen width. Deltas must fit.
pub fn encode_timestamp_block_with_width(timestamps: &[u64], width: DeltaWidth) -> Vec<u8> {
    let low = timestamps.iter().copied().min().unwrap_or(0);
    let mut out = Vec::with_capacity(TS_HEADER_LEN + timestamps.len() * width.bytes());
    out.push(TS_ENC_TOPDIFF);
    out.push(width as u8);
    write_u64(&mut out, low);
    for &t in timestamps {
        let d = t - low;
        match width {
            DeltaWidth::U8 => out.push(d as u8),
            DeltaWidth::U16 => out.extend_from_slice(&(d as u16).to_le_bytes()),
            DeltaWidth::U32 => out.extend_from_slice(&(d as u32).to_le_bytes()),
            DeltaWidth::U64 => out.extend_from_slice(&d.to_le_bytes()),
        }
    }
    out
}

/// Decodes up to `expected` timestamps from a timestamp block, appending to `out`.
///
/// Returns how many values were decoded; fewer than `expected` means the block ran out of
/// bytes. Header problems are corruption errors.
pub fn decode_timestamp_block(buf: &[u8], expected: usize, out: &mut Vec<u64>) -> Result<usize> {
    if buf.len() < TS_HEADER_LEN {
        return Err(ReadError::corruption("Truncated timestamp block header"));
    }
    if buf[0] != TS_ENC_TOPDIFF {
        return Err(ReadError::corruption(format!(
            "Unknown timestamp encoding tag {:#04x}",
            buf[0]
        )));
    }
    let width = DeltaWidth::from_tag(buf[1])?;
    let low = read_u64_at(buf, 2)?;
    let deltas = &buf[TS_HEADER_LEN..];
    let step = width.bytes();
    let n = expected.min(deltas.len() / step);
    out.reserve(n);
    for c in deltas.chunks_exact(step).take(n) {
        let d = match width {
            DeltaWidth::U8 => c[0] as u64,
            DeltaWidth::U16 => u16::from_le_bytes([c[0], c[1]]) as u64,
            DeltaWidth::U32 => u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64,
            DeltaWidth::U64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            }
        };
        let t = low
            .checked_add(d)
            .ok_or_else(|| ReadError::corruption("Timestamp delta overflow"))?;
        out.push(t);
    }
    Ok(n)
}

// --- Binary helpers ---

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Writes `[len:2][bytes]`.
pub fn write_short_bytes(buf: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    if b.len() > MAX_SHORT_LEN {
        return Err(ReadError::Internal(format!(
            "Value of {} bytes exceeds 2-byte length prefix",
            b.len()
        )));
    }
    write_u16(buf, b.len() as u16);
    buf.extend_from_slice(b);
    Ok(())
}

#[inline]
pub fn read_u16_at(buf: &[u8], off: usize) -> Result<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| ReadError::corruption(format!("Truncated u16 at offset {}", off)))
}

#[inline]
pub fn read_u32_at(buf: &[u8], off: usize) -> Result<u32> {
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ReadError::corruption(format!("Truncated u32 at offset {}", off)))
}

#[inline]
pub fn read_u64_at(buf: &[u8], off: usize) -> Result<u64> {
    let b: [u8; 8] = buf
        .get(off..off + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ReadError::corruption(format!("Truncated u64 at offset {}", off)))?;
    Ok(u64::from_le_bytes(b))
}

/// Reads `[len:2][bytes]` at `off`; returns the bytes and the offset after them.
pub fn read_short_bytes_at(buf: &[u8], off: usize) -> Result<(&[u8], usize)> {
    let n = read_u16_at(buf, off)? as usize;
    let s = off + 2;
    let b = buf
        .get(s..s + n)
        .ok_or_else(|| ReadError::corruption(format!("Truncated string at offset {}", off)))?;
    Ok((b, s + n))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

/// Positional read that leaves the file cursor alone, so one descriptor can serve many
/// readers at once.
#[cfg(unix)]
pub fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(
    file: &std::fs::File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes a whole file in one go (fixture helper shared by the encoders).
pub fn write_file(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_data()?;
    Ok(())
}
