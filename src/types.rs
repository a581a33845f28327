use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::encoding::crc32;

/// Block number within a segment.
pub type BlockNum = u16;

/// Epoch milliseconds.
pub type Timestamp = u64;

/// Name of the column holding record timestamps.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Column name meaning "all columns"; never resolved to a file.
pub const WILDCARD_COLUMN: &str = "*";

/// Upper bound on records per block (record numbers are stored as `u16`).
pub const MAX_RECORDS_PER_BLOCK: usize = u16::MAX as usize;

const COLUMN_FILE_EXT: &str = "csg";
const ROTATED_SUFFIX: &str = "rot";

/// Byte range of one column inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnBlockLocation {
    pub offset: u64,
    pub length: u32,
}

impl ColumnBlockLocation {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Per-block column locations. A column missing from `columns` is absent from the block.
#[derive(Debug, Clone, Default)]
pub struct BlockMetadata {
    pub block_num: BlockNum,
    pub columns: HashMap<String, ColumnBlockLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub record_count: u16,
    pub low_ts: Timestamp,
    pub high_ts: Timestamp,
}

/// Read-only description of one segment: where each column's blocks live and how many
/// records every block holds.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Path prefix shared by every file of the segment.
    pub segment_key: String,
    pub blocks: BTreeMap<BlockNum, BlockMetadata>,
    /// Indexed by block number.
    pub summaries: Vec<BlockSummary>,
    /// Columns known to be missing from some blocks (or from trailing records of a block).
    pub columns_with_absent_blocks: HashSet<String>,
}

impl SegmentMeta {
    pub fn new(segment_key: impl Into<String>) -> Self {
        Self {
            segment_key: segment_key.into(),
            blocks: BTreeMap::new(),
            summaries: Vec::new(),
            columns_with_absent_blocks: HashSet::new(),
        }
    }

    pub fn column_location(&self, column: &str, block: BlockNum) -> Option<ColumnBlockLocation> {
        self.blocks
            .get(&block)
            .and_then(|b| b.columns.get(column))
            .copied()
    }

    pub fn record_count(&self, block: BlockNum) -> Option<usize> {
        self.summaries
            .get(block as usize)
            .map(|s| s.record_count as usize)
    }

    pub fn num_blocks(&self) -> usize {
        self.summaries.len()
    }

    pub fn has_absent_blocks(&self, column: &str) -> bool {
        self.columns_with_absent_blocks.contains(column)
    }

    pub fn column_file_path(&self, column: &str) -> PathBuf {
        column_file_path(&self.segment_key, column)
    }
}

/// A column requested by a multi-column reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRequest {
    pub name: String,
    /// The column file has to be downloaded from the blob store before it can be opened.
    pub remote: bool,
}

impl ColumnRequest {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: false,
        }
    }

    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: true,
        }
    }
}

/// Column file path: `{segment_key}_{crc32(column):08x}.csg`.
///
/// Hashing bounds the file name length regardless of the column name.
pub fn column_file_path(segment_key: &str, column: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}_{:08x}.{}",
        segment_key,
        crc32(column.as_bytes()),
        COLUMN_FILE_EXT
    ))
}

/// Name a column file carries after segment rotation moved it.
pub fn rotated_column_file_path(segment_key: &str, column: &str) -> PathBuf {
    let mut p = column_file_path(segment_key, column).into_os_string();
    p.push(".");
    p.push(ROTATED_SUFFIX);
    PathBuf::from(p)
}
