//! Multi-column readers over one segment.
//!
//! [`SharedMultiColumnReaders::open`] resolves and opens every requested column file once,
//! charges the descriptors to the process-wide [`FdLimiter`](crate::fd_limiter::FdLimiter),
//! and hands out `num_readers` independent [`MultiColumnReader`]s. Each instance owns its decode
//! state; the open files are shared and closed once, when the set is closed or dropped.

use crate::blob::BlobStore;
use crate::column_reader::ColumnReader;
use crate::config::ReaderContext;
use crate::encoding::TlvValue;
use crate::error::{ReadError, Result};
use crate::fd_limiter::FdPermit;
use crate::pool::BufferPools;
use crate::rollup::RollupReader;
use crate::telemetry::{ReaderEvent, ReaderEventListener};
use crate::time_reader::{read_all_timestamps_for_blocks, BulkTimestamps, TimeRangeReader};
use crate::types::{
    rotated_column_file_path, BlockNum, ColumnRequest, SegmentMeta, Timestamp, TIMESTAMP_COLUMN,
    WILDCARD_COLUMN,
};

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Descriptors reserved on top of the column files for the minute/hour/day rollup files.
pub const ROLLUP_FD_OVERHEAD: usize = 3;

/// A column that could not be opened under either file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOpenError {
    pub column: String,
    pub error: String,
}

/// One logical reader: a column reader per resolved column plus the timestamp reader.
#[derive(Debug)]
pub struct MultiColumnReader {
    segment: Arc<SegmentMeta>,
    columns: Vec<ColumnReader>,
    name_to_idx: HashMap<String, usize>,
    usage: Vec<u64>,
    by_usage: Vec<usize>,
    time_reader: Option<TimeRangeReader>,
}

impl MultiColumnReader {
    pub fn segment(&self) -> &SegmentMeta {
        &self.segment
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn get_column_index(&self, column: &str) -> Option<usize> {
        self.name_to_idx.get(column).copied()
    }

    pub fn column_name(&self, idx: usize) -> Option<&str> {
        self.columns.get(idx).map(|c| c.column_name())
    }

    fn column_mut(&mut self, idx: usize) -> Result<&mut ColumnReader> {
        let n = self.columns.len();
        self.columns
            .get_mut(idx)
            .ok_or_else(|| ReadError::Internal(format!("Column index {} out of range ({})", idx, n)))
    }

    /// TLV bytes of one record, `None` when the column has no value for it.
    pub fn read_raw_record(
        &mut self,
        col_idx: usize,
        block: BlockNum,
        record: usize,
    ) -> Result<Option<&[u8]>> {
        self.column_mut(col_idx)?.read_record_from_block(block, record)
    }

    pub fn read_value(
        &mut self,
        col_idx: usize,
        block: BlockNum,
        record: usize,
    ) -> Result<Option<TlvValue<'_>>> {
        self.column_mut(col_idx)?.read_value(block, record)
    }

    /// Loads `block` for every listed column ahead of a scan. Columns without data in the
    /// block are skipped.
    pub fn validate_and_read_block(&mut self, col_indices: &[usize], block: BlockNum) -> Result<()> {
        for &idx in col_indices {
            self.column_mut(idx)?.validate_and_read_block(block)?;
        }
        Ok(())
    }

    pub fn increment_column_usage_by_idx(&mut self, idx: usize) {
        if let Some(u) = self.usage.get_mut(idx) {
            *u += 1;
        }
    }

    pub fn increment_column_usage_by_name(&mut self, column: &str) {
        if let Some(idx) = self.get_column_index(column) {
            self.increment_column_usage_by_idx(idx);
        }
    }

    /// Recomputes [`columns_by_usage`](Self::columns_by_usage). Column indices do not change.
    pub fn reorder_column_usage(&mut self) {
        let usage = &self.usage;
        self.by_usage.sort_by(|&a, &b| usage[b].cmp(&usage[a]).then(a.cmp(&b)));
    }

    /// Column indices, most used first as of the last [`reorder_column_usage`](Self::reorder_column_usage).
    pub fn columns_by_usage(&self) -> &[usize] {
        &self.by_usage
    }

    pub fn column_usage(&self, idx: usize) -> u64 {
        self.usage.get(idx).copied().unwrap_or(0)
    }

    pub fn has_timestamps(&self) -> bool {
        self.time_reader.is_some()
    }

    pub fn get_timestamp_for_record(
        &mut self,
        block: BlockNum,
        record: usize,
    ) -> Result<Option<Timestamp>> {
        match self.time_reader.as_mut() {
            Some(r) => r.get_timestamp_for_record(block, record),
            None => Ok(None),
        }
    }

    pub fn get_all_timestamps_for_block(&mut self, block: BlockNum) -> Result<Option<&[Timestamp]>> {
        match self.time_reader.as_mut() {
            Some(r) => r.get_all_timestamps_for_block(block),
            None => Ok(None),
        }
    }
}

/// A set of [`MultiColumnReader`]s sharing one set of open column files.
#[derive(Debug)]
pub struct SharedMultiColumnReaders {
    segment: Arc<SegmentMeta>,
    readers: Vec<MultiColumnReader>,
    files: Vec<Arc<File>>,
    ts_file: Option<Arc<File>>,
    decode_pool: Arc<rayon::ThreadPool>,
    /// Every file reported as no longer in use on release.
    file_names: Vec<String>,
    permit: Option<FdPermit>,
    column_errors: Vec<ColumnOpenError>,
    failed_columns: usize,
    pools: Arc<BufferPools>,
    blob: Arc<dyn BlobStore>,
    events: Arc<dyn ReaderEventListener>,
    closed: bool,
}

impl SharedMultiColumnReaders {
    /// Opens the requested columns of `segment` and builds `num_readers` readers over them.
    ///
    /// The wildcard column is skipped. The descriptor budget is acquired before remote columns
    /// are downloaded; running out of budget or a download failure fails the whole call. A
    /// column whose file cannot be opened (under its primary or rotated name) is left out and
    /// recorded in [`column_errors`](Self::column_errors); its downloaded file is still
    /// released on close.
    pub fn open(
        segment: Arc<SegmentMeta>,
        columns: &[ColumnRequest],
        num_readers: usize,
        ctx: &ReaderContext,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut wanted: Vec<&ColumnRequest> = Vec::with_capacity(columns.len() + 1);
        for c in columns {
            if c.name == WILDCARD_COLUMN || c.name == TIMESTAMP_COLUMN {
                continue;
            }
            if seen.insert(c.name.as_str()) {
                wanted.push(c);
            }
        }
        let ts_remote = columns
            .iter()
            .any(|c| c.name == TIMESTAMP_COLUMN && c.remote);

        let remote: HashMap<String, String> = wanted
            .iter()
            .filter(|c| c.remote)
            .map(|c| (c.name.as_str(), segment.column_file_path(&c.name)))
            .chain(ts_remote.then(|| (TIMESTAMP_COLUMN, segment.column_file_path(TIMESTAMP_COLUMN))))
            .map(|(name, path)| (path.to_string_lossy().into_owned(), name.to_string()))
            .collect();

        // The budget is taken before any file is marked in use.
        let permit = ctx.fd_limiter.acquire(
            wanted.len() + 1 + ROLLUP_FD_OVERHEAD,
            ctx.config.fd_acquire_retries,
            ctx.config.fd_acquire_backoff,
            ctx.event_listener.as_ref(),
        )?;
        if !remote.is_empty() {
            ctx.blob_store.bulk_download_segment_blob(&remote, true)?;
        }

        let mut set = SharedMultiColumnReaders {
            segment: Arc::clone(&segment),
            readers: Vec::new(),
            files: Vec::with_capacity(wanted.len() + 1),
            ts_file: None,
            decode_pool: Arc::clone(&ctx.decode_pool),
            file_names: Vec::with_capacity(wanted.len() + 1),
            permit: Some(permit),
            column_errors: Vec::new(),
            failed_columns: 0,
            pools: Arc::clone(&ctx.pools),
            blob: Arc::clone(&ctx.blob_store),
            events: Arc::clone(&ctx.event_listener),
            closed: false,
        };

        let mut opened: Vec<(String, Arc<File>)> = Vec::with_capacity(wanted.len());
        for c in &wanted {
            if let Some(f) = set.open_column(&c.name, ctx.config.max_column_errors) {
                opened.push((c.name.clone(), f));
            }
        }
        let ts_file = set.open_column(TIMESTAMP_COLUMN, ctx.config.max_column_errors);

        for _ in 0..num_readers.max(1) {
            let columns: Vec<ColumnReader> = opened
                .iter()
                .map(|(name, f)| {
                    ColumnReader::new(
                        name.clone(),
                        Arc::clone(f),
                        Arc::clone(&segment),
                        Arc::clone(&ctx.pools),
                    )
                })
                .collect();
            let name_to_idx = opened
                .iter()
                .enumerate()
                .map(|(i, (name, _))| (name.clone(), i))
                .collect();
            let time_reader = ts_file.as_ref().map(|f| {
                TimeRangeReader::new(
                    Arc::clone(f),
                    Arc::clone(&segment),
                    Arc::clone(&ctx.pools),
                    Arc::clone(&ctx.event_listener),
                )
            });
            set.readers.push(MultiColumnReader {
                segment: Arc::clone(&segment),
                usage: vec![0; columns.len()],
                by_usage: (0..columns.len()).collect(),
                columns,
                name_to_idx,
                time_reader,
            });
        }
        set.ts_file = ts_file;

        // Downloaded files that did not open (or opened under the rotated name) are still
        // marked in use and must be released with the rest.
        for name in remote.into_keys() {
            if !set.file_names.contains(&name) {
                set.file_names.push(name);
            }
        }
        Ok(set)
    }

    /// Opens the primary file of `column`, falling back to the rotated name.
    fn open_column(&mut self, column: &str, max_errors: usize) -> Option<Arc<File>> {
        let primary = self.segment.column_file_path(column);
        let err = match File::open(&primary) {
            Ok(f) => return Some(self.track(primary, f)),
            Err(e) => e,
        };
        let rotated = rotated_column_file_path(&self.segment.segment_key, column);
        match File::open(&rotated) {
            Ok(f) => {
                self.events.on_event(ReaderEvent::ColumnOpenedFromRotated {
                    path: rotated.clone(),
                });
                Some(self.track(rotated, f))
            }
            Err(rot_err) => {
                self.failed_columns += 1;
                let error = format!(
                    "{}: {}; rotated {}: {}",
                    primary.display(),
                    err,
                    rotated.display(),
                    rot_err
                );
                if self.column_errors.len() < max_errors {
                    self.events.on_event(ReaderEvent::ColumnOpenFailed {
                        segment_key: self.segment.segment_key.clone(),
                        column: column.to_string(),
                        error: error.clone(),
                    });
                    self.column_errors.push(ColumnOpenError {
                        column: column.to_string(),
                        error,
                    });
                }
                None
            }
        }
    }

    fn track(&mut self, path: PathBuf, file: File) -> Arc<File> {
        let file = Arc::new(file);
        self.files.push(Arc::clone(&file));
        self.file_names.push(path.to_string_lossy().into_owned());
        file
    }

    pub fn segment(&self) -> &Arc<SegmentMeta> {
        &self.segment
    }

    pub fn readers(&self) -> &[MultiColumnReader] {
        &self.readers
    }

    pub fn readers_mut(&mut self) -> &mut [MultiColumnReader] {
        &mut self.readers
    }

    /// Recorded open failures, capped at the configured maximum.
    pub fn column_errors(&self) -> &[ColumnOpenError] {
        &self.column_errors
    }

    /// All columns that failed to open, including those past the cap.
    pub fn failed_column_count(&self) -> usize {
        self.failed_columns
    }

    /// Descriptors currently held open by the set.
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Bulk-decodes the timestamps of `blocks` over the set's timestamp file on the
    /// context's decode pool. Return the buffers with [`BulkTimestamps::release`].
    pub fn read_all_timestamps(
        &self,
        blocks: &[BlockNum],
        cancel: Option<&AtomicBool>,
    ) -> Result<BulkTimestamps> {
        match self.ts_file.as_deref() {
            Some(file) => read_all_timestamps_for_blocks(
                file,
                &self.segment,
                blocks,
                &self.decode_pool,
                &self.pools,
                cancel,
            ),
            None => Ok(BulkTimestamps::default()),
        }
    }

    /// Rollup reader for the same segment. Its descriptors are covered by this set's budget.
    pub fn open_rollups(&self) -> Result<RollupReader> {
        RollupReader::open(
            self.segment.segment_key.clone(),
            Arc::clone(&self.pools),
            Arc::clone(&self.blob),
            Arc::clone(&self.events),
        )
    }

    /// Returns every reader's buffers, closes the shared files, releases the descriptor
    /// budget and tells the blob store the files are no longer in use.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.readers.clear();
        self.ts_file = None;
        self.files.clear();
        self.permit = None;
        if self.file_names.is_empty() {
            return;
        }
        if let Err(e) = self.blob.set_seg_set_files_as_not_in_use(&self.file_names) {
            self.events.on_event(ReaderEvent::BlobNotInUseFailed {
                files: self.file_names.clone(),
                error: e.to_string(),
            });
        }
    }
}

impl Drop for SharedMultiColumnReaders {
    fn drop(&mut self) {
        self.release();
    }
}
