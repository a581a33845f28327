//! Timestamp column decoding.
//!
//! [`TimeRangeReader`] decodes one block at a time on demand. [`read_all_timestamps_for_blocks`]
//! decodes many blocks of a segment at once: contiguous block ranges are read with a single
//! I/O each, then every block is decoded on a bounded worker pool.

use crate::encoding::{decode_timestamp_block, read_exact_at};
use crate::error::{ReadError, Result};
use crate::pool::BufferPools;
use crate::telemetry::{reader_metrics, ReaderEvent, ReaderEventListener};
use crate::types::{BlockNum, ColumnBlockLocation, SegmentMeta, Timestamp, TIMESTAMP_COLUMN};

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Decodes a timestamp block into `out` (cleared first) and checks the record count.
///
/// A short block yields [`ReadError::PartialTimestamps`] carrying the decoded prefix.
pub fn decode_timestamps_checked(
    buf: &[u8],
    block: BlockNum,
    expected: usize,
    mut out: Vec<u64>,
) -> Result<Vec<u64>> {
    out.clear();
    let decoded = decode_timestamp_block(buf, expected, &mut out)
        .map_err(|e| e.in_block(TIMESTAMP_COLUMN, block))?;
    if decoded != expected {
        return Err(ReadError::PartialTimestamps {
            block,
            decoded,
            expected,
            partial: out,
        });
    }
    Ok(out)
}

#[derive(Debug)]
pub struct TimeRangeReader {
    file: Arc<File>,
    segment: Arc<SegmentMeta>,
    pools: Arc<BufferPools>,
    events: Arc<dyn ReaderEventListener>,
    raw_buf: Vec<u8>,
    timestamps: Vec<u64>,
    /// Loaded block and whether the timestamp column exists in it.
    loaded: Option<(BlockNum, bool)>,
}

impl TimeRangeReader {
    pub fn new(
        file: Arc<File>,
        segment: Arc<SegmentMeta>,
        pools: Arc<BufferPools>,
        events: Arc<dyn ReaderEventListener>,
    ) -> Self {
        let raw_buf = pools.bytes.acquire_empty(0);
        let timestamps = pools.u64s.acquire_empty(0);
        Self {
            file,
            segment,
            pools,
            events,
            raw_buf,
            timestamps,
            loaded: None,
        }
    }

    fn load_block(&mut self, block: BlockNum) -> Result<bool> {
        if let Some((b, present)) = self.loaded {
            if b == block {
                return Ok(present);
            }
        }
        self.loaded = None;

        let Some(loc) = self.segment.column_location(TIMESTAMP_COLUMN, block) else {
            self.loaded = Some((block, false));
            return Ok(false);
        };
        let expected = self.segment.record_count(block).ok_or_else(|| {
            ReadError::corruption(format!("No block summary for block {}", block))
                .in_block(TIMESTAMP_COLUMN, block)
        })?;

        self.raw_buf.clear();
        self.raw_buf.resize(loc.length as usize, 0);
        read_exact_at(&self.file, &mut self.raw_buf, loc.offset)?;

        let out = std::mem::take(&mut self.timestamps);
        match decode_timestamps_checked(&self.raw_buf, block, expected, out) {
            Ok(ts) => {
                self.timestamps = ts;
                self.loaded = Some((block, true));
                reader_metrics::record_timestamp_blocks(1);
                Ok(true)
            }
            Err(e) => {
                if let ReadError::PartialTimestamps {
                    decoded, expected, ..
                } = &e
                {
                    self.events.on_event(ReaderEvent::TimestampDecodeShort {
                        segment_key: self.segment.segment_key.clone(),
                        block,
                        decoded: *decoded,
                        expected: *expected,
                    });
                }
                self.timestamps = self.pools.u64s.acquire_empty(expected);
                Err(e)
            }
        }
    }

    pub fn get_timestamp_for_record(
        &mut self,
        block: BlockNum,
        record: usize,
    ) -> Result<Option<Timestamp>> {
        if !self.load_block(block)? {
            return Ok(None);
        }
        Ok(self.timestamps.get(record).copied())
    }

    /// Every timestamp of `block`, or `None` when the block has no timestamp column.
    pub fn get_all_timestamps_for_block(&mut self, block: BlockNum) -> Result<Option<&[Timestamp]>> {
        if !self.load_block(block)? {
            return Ok(None);
        }
        Ok(Some(&self.timestamps))
    }
}

impl Drop for TimeRangeReader {
    fn drop(&mut self) {
        self.pools.bytes.release(std::mem::take(&mut self.raw_buf));
        self.pools.u64s.release(std::mem::take(&mut self.timestamps));
    }
}

/// One physical read covering consecutive blocks laid out back to back in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedRead {
    pub offset: u64,
    pub length: u64,
    /// `(block, offset within this read, length)`.
    pub blocks: Vec<(BlockNum, usize, usize)>,
}

/// Groups `blocks` into reads: adjacent block numbers whose byte ranges touch share a read.
/// Blocks without a timestamp column are left out.
pub fn coalesce_block_reads(segment: &SegmentMeta, blocks: &[BlockNum]) -> Vec<CoalescedRead> {
    let mut sorted: Vec<BlockNum> = blocks.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<CoalescedRead> = Vec::new();
    let mut prev: Option<(BlockNum, ColumnBlockLocation)> = None;
    for b in sorted {
        let Some(loc) = segment.column_location(TIMESTAMP_COLUMN, b) else {
            prev = None;
            continue;
        };
        let extend = matches!(prev, Some((pb, pl)) if pb.checked_add(1) == Some(b) && pl.end() == loc.offset);
        match out.last_mut() {
            Some(read) if extend => {
                read.blocks
                    .push((b, read.length as usize, loc.length as usize));
                read.length += loc.length as u64;
            }
            _ => out.push(CoalescedRead {
                offset: loc.offset,
                length: loc.length as u64,
                blocks: vec![(b, 0, loc.length as usize)],
            }),
        }
        prev = Some((b, loc));
    }
    out
}

/// Builds the bounded worker pool used by [`read_all_timestamps_for_blocks`]. Build it once
/// and share it between bulk reads.
pub fn build_decode_pool(parallelism: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .thread_name(|i| format!("segread-ts-{}", i))
        .build()
        .map_err(|e| ReadError::Internal(format!("Failed to build decode pool: {}", e)))
}

/// Result of a bulk timestamp read.
///
/// Every buffer (including the prefixes carried by `short`) comes from `pools.u64s`;
/// hand them back with [`BulkTimestamps::release`].
#[derive(Debug, Default)]
pub struct BulkTimestamps {
    /// Blocks decoded in full.
    pub decoded: HashMap<BlockNum, Vec<Timestamp>>,
    /// Blocks that decoded fewer values than declared, each a
    /// [`ReadError::PartialTimestamps`] holding the decoded prefix.
    pub short: BTreeMap<BlockNum, ReadError>,
}

impl BulkTimestamps {
    /// True when no block decoded short.
    pub fn is_complete(&self) -> bool {
        self.short.is_empty()
    }

    pub fn release(self, pools: &BufferPools) {
        release_timestamp_buffers(pools, self.decoded);
        for (_, err) in self.short {
            if let Some(partial) = err.into_partial_timestamps() {
                pools.u64s.release(partial);
            }
        }
    }
}

/// Decodes the timestamps of `blocks` on `workers`.
///
/// A short block does not fail the call: it lands in [`BulkTimestamps::short`] with its
/// partial buffer. Any other failure (I/O, corruption, cancellation) releases every buffer
/// decoded so far and returns the error of the lowest failing block. `cancel` is checked
/// before each job.
pub fn read_all_timestamps_for_blocks(
    file: &File,
    segment: &SegmentMeta,
    blocks: &[BlockNum],
    workers: &rayon::ThreadPool,
    pools: &BufferPools,
    cancel: Option<&AtomicBool>,
) -> Result<BulkTimestamps> {
    let reads = coalesce_block_reads(segment, blocks);
    if reads.is_empty() {
        return Ok(BulkTimestamps::default());
    }
    let cancelled = || cancel.map_or(false, |c| c.load(Ordering::Relaxed));

    let results: Vec<(BlockNum, Result<Vec<u64>>)> = workers.install(|| {
        let buffers: Vec<Result<Vec<u8>>> = reads
            .par_iter()
            .map(|r| {
                if cancelled() {
                    return Err(ReadError::Cancelled);
                }
                let mut buf = pools.bytes.acquire(r.length as usize);
                read_exact_at(file, &mut buf, r.offset)?;
                Ok(buf)
            })
            .collect();

        let jobs: Vec<(BlockNum, &[u8], &Result<Vec<u8>>)> = reads
            .iter()
            .zip(buffers.iter())
            .flat_map(|(r, buf)| {
                r.blocks.iter().map(move |&(b, start, len)| {
                    let slice: &[u8] = match buf {
                        Ok(bytes) => &bytes[start..start + len],
                        Err(_) => &[],
                    };
                    (b, slice, buf)
                })
            })
            .collect();

        let decoded = jobs
            .par_iter()
            .map(|&(block, bytes, read)| {
                if let Err(e) = read {
                    return (block, Err(clone_read_error(e)));
                }
                if cancelled() {
                    return (block, Err(ReadError::Cancelled));
                }
                let expected = match segment.record_count(block) {
                    Some(n) => n,
                    None => {
                        return (
                            block,
                            Err(ReadError::corruption(format!(
                                "No block summary for block {}",
                                block
                            ))
                            .in_block(TIMESTAMP_COLUMN, block)),
                        )
                    }
                };
                let out = pools.u64s.acquire_empty(expected);
                (block, decode_timestamps_checked(bytes, block, expected, out))
            })
            .collect();

        for buf in buffers.into_iter().flatten() {
            pools.bytes.release(buf);
        }
        decoded
    });

    let mut out = BulkTimestamps {
        decoded: HashMap::with_capacity(results.len()),
        short: BTreeMap::new(),
    };
    let mut fatal: Option<(BlockNum, ReadError)> = None;
    for (block, res) in results {
        match res {
            Ok(ts) => {
                out.decoded.insert(block, ts);
            }
            Err(e @ ReadError::PartialTimestamps { .. }) => {
                out.short.insert(block, e);
            }
            Err(e) => {
                if fatal.as_ref().map_or(true, |(b, _)| block < *b) {
                    fatal = Some((block, e));
                }
            }
        }
    }
    if let Some((_, e)) = fatal {
        out.release(pools);
        return Err(e);
    }
    reader_metrics::record_timestamp_blocks((out.decoded.len() + out.short.len()) as u64);
    Ok(out)
}

/// Returns bulk-decoded timestamp buffers to the pool.
pub fn release_timestamp_buffers(pools: &BufferPools, buffers: HashMap<BlockNum, Vec<Timestamp>>) {
    for (_, buf) in buffers {
        pools.u64s.release(buf);
    }
}

// `std::io::Error` is not `Clone`; a failed coalesced read is reported once per block.
fn clone_read_error(e: &ReadError) -> ReadError {
    match e {
        ReadError::Io(io) => ReadError::Io(std::io::Error::new(io.kind(), io.to_string())),
        ReadError::Cancelled => ReadError::Cancelled,
        other => ReadError::Internal(other.to_string()),
    }
}
