//! Rollup bitsets: per block, per time bucket, the set of record numbers falling in that bucket.
//!
//! File layout, repeated per block until EOF:
//! `[blockNum:2][numBuckets:2]{[bucketKey:8][tag:1][bitsetLen:2][bitset]}*numBuckets`.
//! Bitsets use the portable Roaring serialization.

use crate::blob::BlobStore;
use crate::encoding::{read_exact_at, read_u16_at, read_u64_at, write_u16, write_u64};
use crate::error::{ReadError, Result};
use crate::pool::BufferPools;
use crate::telemetry::{ReaderEvent, ReaderEventListener};
use crate::types::{BlockNum, Timestamp};

use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Encoding tag for a Roaring bitset payload. The only one defined.
pub const ROLLUP_ENC_BITSET: u8 = 0x01;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    pub fn bucket_millis(self) -> u64 {
        match self {
            Granularity::Minute => MINUTE_MS,
            Granularity::Hour => HOUR_MS,
            Granularity::Day => DAY_MS,
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            Granularity::Minute => "mrup",
            Granularity::Hour => "hrup",
            Granularity::Day => "drup",
        }
    }

    fn index(self) -> usize {
        match self {
            Granularity::Minute => 0,
            Granularity::Hour => 1,
            Granularity::Day => 2,
        }
    }
}

/// Start of the bucket containing `ts` (epoch millis).
#[inline]
pub fn bucket_key(ts: Timestamp, granularity: Granularity) -> u64 {
    ts - ts % granularity.bucket_millis()
}

pub fn rollup_file_path(segment_key: &str, granularity: Granularity) -> PathBuf {
    PathBuf::from(format!("{}.{}", segment_key, granularity.file_extension()))
}

/// Buckets of one block: bucket key to matched record numbers.
pub type BlockRollups = BTreeMap<u64, RoaringBitmap>;

/// Every block's buckets for one granularity.
pub type RollupBlocks = HashMap<BlockNum, BlockRollups>;

/// Groups the records of a block (by position) into buckets.
pub fn build_block_rollups(timestamps: &[Timestamp], granularity: Granularity) -> BlockRollups {
    let mut out = BlockRollups::new();
    for (rec, &ts) in timestamps.iter().enumerate() {
        out.entry(bucket_key(ts, granularity))
            .or_default()
            .insert(rec as u32);
    }
    out
}

/// Serializes rollups in block order.
pub fn encode_rollup_file(blocks: &BTreeMap<BlockNum, BlockRollups>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut bitset = Vec::new();
    for (&block, buckets) in blocks {
        let n: u16 = buckets.len().try_into().map_err(|_| {
            ReadError::Internal(format!("Too many rollup buckets in block {}", block))
        })?;
        write_u16(&mut out, block);
        write_u16(&mut out, n);
        for (&key, bm) in buckets {
            bitset.clear();
            bm.serialize_into(&mut bitset)?;
            let len: u16 = bitset
                .len()
                .try_into()
                .map_err(|_| ReadError::Internal("Rollup bitset too large".to_string()))?;
            write_u64(&mut out, key);
            out.push(ROLLUP_ENC_BITSET);
            write_u16(&mut out, len);
            out.extend_from_slice(&bitset);
        }
    }
    Ok(out)
}

/// Parses a complete rollup file.
pub fn decode_rollup_file(buf: &[u8]) -> Result<RollupBlocks> {
    let mut out = RollupBlocks::new();
    let mut off = 0usize;
    while off < buf.len() {
        let block = read_u16_at(buf, off)?;
        let num_buckets = read_u16_at(buf, off + 2)?;
        off += 4;
        let buckets = out.entry(block).or_default();
        for _ in 0..num_buckets {
            let key = read_u64_at(buf, off)?;
            let tag = *buf
                .get(off + 8)
                .ok_or_else(|| ReadError::corruption("Truncated rollup bucket header"))?;
            if tag != ROLLUP_ENC_BITSET {
                return Err(ReadError::corruption(format!(
                    "Unknown rollup encoding tag {:#04x} in block {}",
                    tag, block
                )));
            }
            let len = read_u16_at(buf, off + 9)? as usize;
            off += 11;
            let bytes = buf
                .get(off..off + len)
                .ok_or_else(|| ReadError::corruption("Truncated rollup bitset"))?;
            let bm = RoaringBitmap::deserialize_from(bytes).map_err(|e| {
                ReadError::corruption(format!("Bad rollup bitset in block {}: {}", block, e))
            })?;
            buckets.insert(key, bm);
            off += len;
        }
    }
    Ok(out)
}

/// Lazily loads and caches the minute/hour/day rollup files of one segment.
///
/// Files that do not exist are treated as "no rollups at this granularity".
#[derive(Debug)]
pub struct RollupReader {
    segment_key: String,
    files: [Option<File>; 3],
    loaded: [Option<RollupBlocks>; 3],
    pools: Arc<BufferPools>,
    blob: Arc<dyn BlobStore>,
    events: Arc<dyn ReaderEventListener>,
}

impl RollupReader {
    pub fn open(
        segment_key: impl Into<String>,
        pools: Arc<BufferPools>,
        blob: Arc<dyn BlobStore>,
        events: Arc<dyn ReaderEventListener>,
    ) -> Result<Self> {
        let segment_key = segment_key.into();
        let mut files: [Option<File>; 3] = [None, None, None];
        for g in Granularity::ALL {
            files[g.index()] = match File::open(rollup_file_path(&segment_key, g)) {
                Ok(f) => Some(f),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(Self {
            segment_key,
            files,
            loaded: [None, None, None],
            pools,
            blob,
            events,
        })
    }

    /// Number of rollup files held open.
    pub fn open_files(&self) -> usize {
        self.files.iter().filter(|f| f.is_some()).count()
    }

    pub fn is_loaded(&self, granularity: Granularity) -> bool {
        self.loaded[granularity.index()].is_some()
    }

    /// Rollups of every block at `granularity`, parsed on first call and cached afterwards.
    pub fn load(&mut self, granularity: Granularity) -> Result<Option<&RollupBlocks>> {
        let idx = granularity.index();
        if self.loaded[idx].is_none() {
            let Some(file) = &self.files[idx] else {
                return Ok(None);
            };
            let len = file.metadata()?.len() as usize;
            let mut buf = self.pools.bytes.acquire(len);
            let parsed = read_exact_at(file, &mut buf, 0)
                .map_err(ReadError::from)
                .and_then(|_| decode_rollup_file(&buf));
            self.pools.bytes.release(buf);
            self.loaded[idx] = Some(parsed?);
        }
        Ok(self.loaded[idx].as_ref())
    }

    /// Buckets of one block, loading the granularity if needed.
    pub fn block_rollups(
        &mut self,
        granularity: Granularity,
        block: BlockNum,
    ) -> Result<Option<&BlockRollups>> {
        Ok(self.load(granularity)?.and_then(|all| all.get(&block)))
    }

    /// Closes the rollup files and tells the blob store they are no longer in use.
    pub fn close(self) {
        for g in Granularity::ALL {
            if self.files[g.index()].is_none() {
                continue;
            }
            let name = rollup_file_path(&self.segment_key, g)
                .to_string_lossy()
                .into_owned();
            if let Err(e) = self.blob.set_blob_as_not_in_use(&name) {
                self.events.on_event(ReaderEvent::BlobNotInUseFailed {
                    files: vec![name],
                    error: e.to_string(),
                });
            }
        }
    }
}
