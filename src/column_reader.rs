//! Single-column segment reader.
//!
//! A reader is bound to one open column file and loads one block at a time. Raw blocks are
//! walked with a forward-only cursor; dictionary blocks are indexed by record number.

use crate::encoding::{
    decode_tlv, decompress_raw_block, parse_dict_block, read_exact_at, tlv_record_len,
    BlockEncoding, DictBlock, TlvValue,
};
use crate::error::{ReadError, Result};
use crate::pool::BufferPools;
use crate::telemetry::reader_metrics;
use crate::types::{BlockNum, SegmentMeta};

use std::fs::File;
use std::sync::Arc;

/// Cursor over a raw TLV stream: the record it points at and where that record's bytes are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub block_num: BlockNum,
    pub record_num: usize,
    pub byte_offset: usize,
    pub record_len: usize,
}

impl Position {
    /// Position of record 0, or `None` for an empty stream.
    pub fn start(block_num: BlockNum, stream: &[u8]) -> Result<Option<Position>> {
        if stream.is_empty() {
            return Ok(None);
        }
        Ok(Some(Position {
            block_num,
            record_num: 0,
            byte_offset: 0,
            record_len: tlv_record_len(stream, 0)?,
        }))
    }

    /// Position of the next record, or `None` past the last one.
    pub fn advance(self, stream: &[u8]) -> Result<Option<Position>> {
        let next = self.byte_offset + self.record_len;
        if next >= stream.len() {
            return Ok(None);
        }
        Ok(Some(Position {
            block_num: self.block_num,
            record_num: self.record_num + 1,
            byte_offset: next,
            record_len: tlv_record_len(stream, next)?,
        }))
    }

    /// Moves to `target`, continuing from `from` when it is not past the target and
    /// restarting from record 0 otherwise.
    pub fn seek(
        from: Option<Position>,
        block_num: BlockNum,
        stream: &[u8],
        target: usize,
    ) -> Result<Option<Position>> {
        let mut cur = match from {
            Some(p) if p.block_num == block_num && p.record_num <= target => Some(p),
            _ => Position::start(block_num, stream)?,
        };
        while let Some(p) = cur {
            if p.record_num == target {
                return Ok(Some(p));
            }
            cur = p.advance(stream)?;
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Unloaded,
    /// Column has no data in this block.
    Absent(BlockNum),
    Raw {
        block: BlockNum,
        cursor: Option<Position>,
    },
    Dict(BlockNum),
}

#[derive(Debug)]
pub struct ColumnReader {
    column: String,
    file: Arc<File>,
    segment: Arc<SegmentMeta>,
    pools: Arc<BufferPools>,
    /// Block bytes as stored on disk (dictionary blocks are parsed in place).
    raw_buf: Vec<u8>,
    /// Decompressed TLV stream of a raw block.
    decoded_buf: Vec<u8>,
    dict: DictBlock,
    state: BlockState,
}

impl ColumnReader {
    pub fn new(
        column: impl Into<String>,
        file: Arc<File>,
        segment: Arc<SegmentMeta>,
        pools: Arc<BufferPools>,
    ) -> Self {
        let raw_buf = pools.bytes.acquire_empty(0);
        let decoded_buf = pools.bytes.acquire_empty(0);
        Self {
            column: column.into(),
            file,
            segment,
            pools,
            raw_buf,
            decoded_buf,
            dict: DictBlock::default(),
            state: BlockState::Unloaded,
        }
    }

    pub fn column_name(&self) -> &str {
        &self.column
    }

    /// Block currently held by the reader, if any (absent blocks included).
    pub fn loaded_block(&self) -> Option<BlockNum> {
        match self.state {
            BlockState::Unloaded => None,
            BlockState::Absent(b) | BlockState::Dict(b) => Some(b),
            BlockState::Raw { block, .. } => Some(block),
        }
    }

    /// Loads `block` unless it is already loaded. Returns `false` when the column has no
    /// data in that block.
    pub fn validate_and_read_block(&mut self, block: BlockNum) -> Result<bool> {
        match self.state {
            BlockState::Absent(b) if b == block => return Ok(false),
            BlockState::Dict(b) if b == block => return Ok(true),
            BlockState::Raw { block: b, .. } if b == block => return Ok(true),
            _ => {}
        }
        self.state = BlockState::Unloaded;

        let Some(loc) = self.segment.column_location(&self.column, block) else {
            self.state = BlockState::Absent(block);
            return Ok(false);
        };
        let record_count = self.segment.record_count(block).ok_or_else(|| {
            ReadError::corruption(format!("No block summary for block {}", block))
                .in_block(&self.column, block)
        })?;

        self.raw_buf.clear();
        self.raw_buf.resize(loc.length as usize, 0);
        read_exact_at(&self.file, &mut self.raw_buf, loc.offset)?;
        let Some(&tag) = self.raw_buf.first() else {
            return Err(ReadError::corruption("Empty column block").in_block(&self.column, block));
        };

        match BlockEncoding::from_tag(tag).map_err(|e| e.in_block(&self.column, block))? {
            BlockEncoding::RawZstd => {
                decompress_raw_block(&self.raw_buf[1..], &mut self.decoded_buf)
                    .map_err(|e| e.in_block(&self.column, block))?;
                reader_metrics::record_block_decoded(false);
                self.state = BlockState::Raw {
                    block,
                    cursor: None,
                };
            }
            BlockEncoding::Dictionary => {
                parse_dict_block(&self.raw_buf, 1, record_count, &mut self.dict)
                    .map_err(|e| e.in_block(&self.column, block))?;
                reader_metrics::record_block_decoded(true);
                self.state = BlockState::Dict(block);
            }
        }
        Ok(true)
    }

    /// TLV bytes of `record` in `block`, or `None` when the value is absent.
    ///
    /// Raw blocks are cheapest to read in non-decreasing record order; reading backwards
    /// restarts the walk from the first record.
    pub fn read_record_from_block(
        &mut self,
        block: BlockNum,
        record: usize,
    ) -> Result<Option<&[u8]>> {
        if !self.validate_and_read_block(block)? {
            return Ok(None);
        }
        match self.state {
            BlockState::Raw { cursor, .. } => {
                match Position::seek(cursor, block, &self.decoded_buf, record)
                    .map_err(|e| e.in_block(&self.column, block))?
                {
                    Some(p) => {
                        self.state = BlockState::Raw {
                            block,
                            cursor: Some(p),
                        };
                        Ok(Some(
                            &self.decoded_buf[p.byte_offset..p.byte_offset + p.record_len],
                        ))
                    }
                    None => self.missing_record(block, record),
                }
            }
            BlockState::Dict(_) => match self.dict.word_for(&self.raw_buf, record) {
                Some(word) => Ok(Some(word)),
                None => self.missing_record(block, record),
            },
            BlockState::Unloaded | BlockState::Absent(_) => Ok(None),
        }
    }

    /// Decoded value of `record` in `block`.
    pub fn read_value(&mut self, block: BlockNum, record: usize) -> Result<Option<TlvValue<'_>>> {
        match self.read_record_from_block(block, record)? {
            Some(bytes) => Ok(Some(decode_tlv(bytes)?.0)),
            None => Ok(None),
        }
    }

    fn missing_record<T>(&self, block: BlockNum, record: usize) -> Result<Option<T>> {
        if self.segment.has_absent_blocks(&self.column) {
            return Ok(None);
        }
        Err(ReadError::Corruption {
            details: format!("Record {} not found before end of block", record),
            column: Some(self.column.clone()),
            block: Some(block),
        })
    }
}

impl Drop for ColumnReader {
    fn drop(&mut self) {
        self.pools.bytes.release(std::mem::take(&mut self.raw_buf));
        self.pools.bytes.release(std::mem::take(&mut self.decoded_buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_dict_block, encode_raw_block, encode_tlv};
    use crate::types::{BlockMetadata, BlockSummary, ColumnBlockLocation};
    use std::io::Write;

    fn tlv(v: TlvValue<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        encode_tlv(&v, &mut out).unwrap();
        out
    }

    /// Writes `blocks` for column "c" into one file and returns a reader over it.
    fn reader_over(blocks: Vec<Option<(Vec<u8>, u16)>>, sparse: bool) -> (tempfile::TempDir, ColumnReader) {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("seg0").to_string_lossy().into_owned();
        let mut meta = SegmentMeta::new(key);
        let path = meta.column_file_path("c");
        let mut f = File::create(&path).unwrap();
        let mut off = 0u64;
        for (i, b) in blocks.into_iter().enumerate() {
            let mut bm = BlockMetadata {
                block_num: i as u16,
                ..Default::default()
            };
            let count = match b {
                Some((bytes, count)) => {
                    f.write_all(&bytes).unwrap();
                    bm.columns.insert(
                        "c".to_string(),
                        ColumnBlockLocation {
                            offset: off,
                            length: bytes.len() as u32,
                        },
                    );
                    off += bytes.len() as u64;
                    count
                }
                None => 1,
            };
            meta.blocks.insert(i as u16, bm);
            meta.summaries.push(BlockSummary {
                record_count: count,
                low_ts: 0,
                high_ts: 0,
            });
        }
        if sparse {
            meta.columns_with_absent_blocks.insert("c".to_string());
        }
        drop(f);
        let file = Arc::new(File::open(&path).unwrap());
        let pools = Arc::new(BufferPools::new(4));
        let r = ColumnReader::new("c", file, Arc::new(meta), pools);
        (dir, r)
    }

    fn raw_records() -> Vec<Vec<u8>> {
        vec![
            tlv(TlvValue::Str("alpha")),
            tlv(TlvValue::Int64(-42)),
            tlv(TlvValue::Backfill),
            tlv(TlvValue::Float64(2.5)),
            tlv(TlvValue::Bool(true)),
        ]
    }

    #[test]
    fn raw_block_forward_and_backward_access() {
        let recs = raw_records();
        let block = encode_raw_block(&recs, 1).unwrap();
        let (_d, mut r) = reader_over(vec![Some((block, recs.len() as u16))], false);

        for i in 0..recs.len() {
            assert_eq!(r.read_record_from_block(0, i).unwrap().unwrap(), recs[i].as_slice());
        }
        // Backwards: cursor resets and walks forward again.
        assert_eq!(r.read_record_from_block(0, 1).unwrap().unwrap(), recs[1].as_slice());
        assert_eq!(r.read_record_from_block(0, 0).unwrap().unwrap(), recs[0].as_slice());
        assert_eq!(r.read_value(0, 3).unwrap(), Some(TlvValue::Float64(2.5)));
    }

    #[test]
    fn dictionary_block_lookup() {
        let words = vec![
            (tlv(TlvValue::Str("GET")), vec![0, 3]),
            (tlv(TlvValue::Str("POST")), vec![1, 2]),
        ];
        let block = encode_dict_block(&words).unwrap();
        let (_d, mut r) = reader_over(vec![Some((block, 4))], false);
        assert_eq!(r.read_value(0, 2).unwrap(), Some(TlvValue::Str("POST")));
        assert_eq!(r.read_value(0, 0).unwrap(), Some(TlvValue::Str("GET")));
        assert_eq!(r.read_value(0, 3).unwrap(), Some(TlvValue::Str("GET")));
    }

    #[test]
    fn column_absent_from_block_is_not_an_error() {
        let recs = raw_records();
        let block = encode_raw_block(&recs, 1).unwrap();
        let (_d, mut r) = reader_over(vec![None, Some((block, recs.len() as u16))], false);
        assert!(!r.validate_and_read_block(0).unwrap());
        assert!(r.read_record_from_block(0, 0).unwrap().is_none());
        assert_eq!(r.loaded_block(), Some(0));
        assert!(r.read_record_from_block(1, 4).unwrap().is_some());
    }

    #[test]
    fn reading_past_end_depends_on_sparse_flag() {
        let recs = raw_records();
        let block = encode_raw_block(&recs, 1).unwrap();
        let (_d, mut strict) = reader_over(vec![Some((block.clone(), 8))], false);
        let err = strict.read_record_from_block(0, 6).unwrap_err();
        match err {
            ReadError::Corruption { column, block, .. } => {
                assert_eq!(column.as_deref(), Some("c"));
                assert_eq!(block, Some(0));
            }
            other => panic!("expected corruption, got {other:?}"),
        }

        let (_d2, mut sparse) = reader_over(vec![Some((block, 8))], true);
        assert!(sparse.read_record_from_block(0, 6).unwrap().is_none());
    }

    #[test]
    fn unknown_block_encoding_is_fatal() {
        let (_d, mut r) = reader_over(vec![Some((vec![0x42, 1, 2, 3], 1))], false);
        assert!(matches!(
            r.validate_and_read_block(0).unwrap_err(),
            ReadError::Corruption { .. }
        ));
        assert_eq!(r.loaded_block(), None);
    }

    #[test]
    fn dropping_reader_returns_buffers() {
        let recs = raw_records();
        let block = encode_raw_block(&recs, 1).unwrap();
        let (_d, mut r) = reader_over(vec![Some((block, recs.len() as u16))], false);
        r.read_record_from_block(0, 0).unwrap();
        let pools = Arc::clone(&r.pools);
        drop(r);
        assert_eq!(pools.bytes.retained(), 2);
    }

    #[test]
    fn position_seek_is_pure() {
        let recs = raw_records();
        let stream: Vec<u8> = recs.concat();
        let p3 = Position::seek(None, 0, &stream, 3).unwrap().unwrap();
        assert_eq!(p3.record_num, 3);
        let again = Position::seek(Some(p3), 0, &stream, 1).unwrap().unwrap();
        assert_eq!(again.byte_offset, recs[0].len());
        assert!(Position::seek(Some(p3), 0, &stream, 9).unwrap().is_none());
    }
}
