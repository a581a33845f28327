#![doc = include_str!("../README.md")]
// Declare modules
pub mod aggregation;
pub mod agile_tree;
pub mod blob;
pub mod column_reader;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fd_limiter;
pub mod multi_reader;
pub mod pool;
pub mod rollup;
pub mod telemetry;
pub mod time_reader;
pub mod types;

/// Group-by request and result types shared by the tree reader and callers.
pub use crate::aggregation::{
    AggFunction, GroupByBuckets, GroupByRequest, GroupByRow, MeasureAggregator, NumericValue,
};
/// Pre-aggregated group-by index reader.
pub use crate::agile_tree::{AgileTreeReader, AgileTreeWriter};
/// Boundary to the blob/object store.
pub use crate::blob::{BlobStore, LocalBlobStore};
/// Reader for one column file of a segment.
pub use crate::column_reader::ColumnReader;
/// Settings and shared state for all readers.
pub use crate::config::{ReaderConfig, ReaderContext};
/// Decoded TLV value.
pub use crate::encoding::TlvValue;
/// Error type for read operations.
pub use crate::error::{ReadError, Result};
/// Process-wide open file budget.
pub use crate::fd_limiter::{FdLimiter, FdPermit};
/// Column readers sharing open files.
pub use crate::multi_reader::{MultiColumnReader, SharedMultiColumnReaders};
/// Pooled scratch buffers.
pub use crate::pool::BufferPools;
/// Time-bucket rollup bitsets.
pub use crate::rollup::{Granularity, RollupReader};
/// Structured event hook for observability.
pub use crate::telemetry::{ReaderEvent, ReaderEventListener};
/// Timestamp column reader.
pub use crate::time_reader::{BulkTimestamps, TimeRangeReader};
/// Segment and block metadata.
pub use crate::types::{BlockNum, ColumnRequest, SegmentMeta, Timestamp};
