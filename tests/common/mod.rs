#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use segread::encoding::{encode_dict_block, encode_raw_block, encode_timestamp_block, encode_tlv};
use segread::types::{BlockMetadata, BlockSummary, ColumnBlockLocation, TIMESTAMP_COLUMN};
use segread::{ReaderEvent, ReaderEventListener, SegmentMeta, TlvValue};
use tempfile::TempDir;

pub fn tlv(v: TlvValue<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    encode_tlv(&v, &mut out).unwrap();
    out
}

pub fn tlv_str(s: &str) -> Vec<u8> {
    tlv(TlvValue::Str(s))
}

pub fn tlv_i64(v: i64) -> Vec<u8> {
    tlv(TlvValue::Int64(v))
}

/// Column content of one block.
pub enum BlockData {
    /// TLV records in record order.
    Raw(Vec<Vec<u8>>),
    /// `(TLV word, record numbers)` pairs.
    Dict(Vec<(Vec<u8>, Vec<u16>)>),
}

/// Writes column and timestamp files block by block and records their locations.
pub struct SegmentBuilder {
    meta: SegmentMeta,
    files: BTreeMap<String, Vec<u8>>,
    blocks_per_column: HashMap<String, usize>,
}

impl SegmentBuilder {
    pub fn new(dir: &TempDir, name: &str) -> Self {
        Self {
            meta: SegmentMeta::new(dir.path().join(name).to_string_lossy().into_owned()),
            files: BTreeMap::new(),
            blocks_per_column: HashMap::new(),
        }
    }

    fn append(&mut self, block: &mut BlockMetadata, column: &str, bytes: Vec<u8>) {
        let file = self.files.entry(column.to_string()).or_default();
        block.columns.insert(
            column.to_string(),
            ColumnBlockLocation {
                offset: file.len() as u64,
                length: bytes.len() as u32,
            },
        );
        file.extend_from_slice(&bytes);
        *self.blocks_per_column.entry(column.to_string()).or_default() += 1;
    }

    /// Adds the next block. Columns not listed are absent from it.
    pub fn add_block(&mut self, timestamps: &[u64], columns: Vec<(&str, BlockData)>) -> &mut Self {
        let block_num = self.meta.blocks.len() as u16;
        let mut block = BlockMetadata {
            block_num,
            ..Default::default()
        };
        self.append(&mut block, TIMESTAMP_COLUMN, encode_timestamp_block(timestamps));
        for (name, data) in columns {
            let bytes = match data {
                BlockData::Raw(records) => encode_raw_block(&records, 3).unwrap(),
                BlockData::Dict(words) => encode_dict_block(&words).unwrap(),
            };
            self.append(&mut block, name, bytes);
        }
        self.meta.blocks.insert(block_num, block);
        self.meta.summaries.push(BlockSummary {
            record_count: timestamps.len() as u16,
            low_ts: timestamps.iter().copied().min().unwrap_or(0),
            high_ts: timestamps.iter().copied().max().unwrap_or(0),
        });
        self
    }

    pub fn finish(mut self) -> Arc<SegmentMeta> {
        let total = self.meta.blocks.len();
        for (col, n) in &self.blocks_per_column {
            if *n < total {
                self.meta.columns_with_absent_blocks.insert(col.clone());
            }
        }
        for (col, bytes) in &self.files {
            std::fs::write(self.meta.column_file_path(col), bytes).unwrap();
        }
        Arc::new(self.meta)
    }
}

/// Listener that keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ReaderEvent>>,
}

impl ReaderEventListener for RecordingListener {
    fn on_event(&self, event: ReaderEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
