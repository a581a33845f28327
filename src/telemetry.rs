use std::path::PathBuf;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// Readers never print. Callers provide an implementation that forwards these events to
/// `tracing`, `log` or their own sinks.
pub trait ReaderEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: ReaderEvent);
}

/// Structured events emitted by the readers.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// A column could not be opened; the other columns of the reader set are unaffected.
    ColumnOpenFailed {
        segment_key: String,
        column: String,
        error: String,
    },
    /// The primary column file was missing and the rotated name was used instead.
    ColumnOpenedFromRotated { path: PathBuf },

    /// The blob store rejected a "not in use" notification. Not fatal.
    BlobNotInUseFailed { files: Vec<String>, error: String },

    FdAcquireRetry {
        requested: usize,
        available: usize,
        attempt: u32,
    },

    TimestampDecodeShort {
        segment_key: String,
        block: u16,
        decoded: usize,
        expected: usize,
    },

    /// A new group-by bucket was rejected because the bucket limit was reached.
    AgileTreeBucketLimitReached { segment_key: String, limit: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl ReaderEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: ReaderEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn ReaderEventListener> {
    Arc::new(NoopEventListener)
}

/// Counters recorded through the `metrics` facade.
///
/// Recording is effectively a no-op until the embedding process installs a recorder.
pub mod reader_metrics {
    use ::metrics::{describe_counter, Unit};

    pub const BLOCKS_DECODED_RAW: &str = "segread_blocks_decoded_raw";
    pub const BLOCKS_DECODED_DICT: &str = "segread_blocks_decoded_dict";
    pub const TIMESTAMP_BLOCKS_DECODED: &str = "segread_timestamp_blocks_decoded";
    pub const POOL_HITS: &str = "segread_pool_hits";
    pub const POOL_MISSES: &str = "segread_pool_misses";
    pub const FD_ACQUIRE_FAILURES: &str = "segread_fd_acquire_failures";
    pub const AGILE_TREE_NODES_SCANNED: &str = "segread_agile_tree_nodes_scanned";

    #[inline]
    pub fn record_block_decoded(dictionary: bool) {
        if dictionary {
            ::metrics::counter!(BLOCKS_DECODED_DICT).increment(1);
        } else {
            ::metrics::counter!(BLOCKS_DECODED_RAW).increment(1);
        }
    }

    #[inline]
    pub fn record_timestamp_blocks(blocks: u64) {
        if blocks > 0 {
            ::metrics::counter!(TIMESTAMP_BLOCKS_DECODED).increment(blocks);
        }
    }

    #[inline]
    pub fn record_pool_hit() {
        ::metrics::counter!(POOL_HITS).increment(1);
    }

    #[inline]
    pub fn record_pool_miss() {
        ::metrics::counter!(POOL_MISSES).increment(1);
    }

    #[inline]
    pub fn record_fd_acquire_failure() {
        ::metrics::counter!(FD_ACQUIRE_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_agile_tree_nodes(nodes: u64) {
        if nodes > 0 {
            ::metrics::counter!(AGILE_TREE_NODES_SCANNED).increment(nodes);
        }
    }

    /// Registers descriptions for every counter. Call once after installing a recorder.
    pub fn describe_all() {
        describe_counter!(
            BLOCKS_DECODED_RAW,
            Unit::Count,
            "Column blocks decompressed from raw zstd TLV streams."
        );
        describe_counter!(
            BLOCKS_DECODED_DICT,
            Unit::Count,
            "Column blocks parsed as dictionary blocks."
        );
        describe_counter!(
            TIMESTAMP_BLOCKS_DECODED,
            Unit::Count,
            "Timestamp blocks decoded (single-block and bulk paths)."
        );
        describe_counter!(POOL_HITS, Unit::Count, "Buffer pool acquisitions served from the free list.");
        describe_counter!(POOL_MISSES, Unit::Count, "Buffer pool acquisitions that allocated.");
        describe_counter!(
            FD_ACQUIRE_FAILURES,
            Unit::Count,
            "File descriptor budget acquisitions that gave up after all retries."
        );
        describe_counter!(
            AGILE_TREE_NODES_SCANNED,
            Unit::Count,
            "Group-by tree nodes decoded while answering queries."
        );
    }
}
