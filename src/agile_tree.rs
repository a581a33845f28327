//! Pre-aggregated group-by tree ("agile tree").
//!
//! The tree indexes an ordered list of group-by columns. Level `L` holds one node per distinct
//! combination of the first `L` columns, each carrying a fixed set of aggregate slots. A
//! query only reads the deepest level it needs and folds those nodes into its buckets.
//!
//! Meta file (`.stm`):
//! `[tag:1][metaLen:4][numGrp:2]{[len:2][name]}*[numMeasure:2]{[len:2][name]}*`
//! `{[len:2][name][numEntries:4]{[len:2][bytes]}*}*numGrp {[offset:8][size:4]}*numLevels`
//!
//! Level file (`.stl`), per level:
//! `[level:2][numNodes:4]{[ownKey:4][ancestorKeys:4*(level-1)][slots:9*numAggValues]}*`
//! with ancestors stored from level 1 downwards. Slot 0 is the record count, then each
//! measure column contributes `[min, max, sum]`.

use crate::aggregation::{
    Accumulator, AggFunction, BucketKey, GroupByBuckets, GroupByRequest, NumericValue,
};
use crate::encoding::{
    read_exact_at, read_short_bytes_at, read_u16_at, read_u32_at, read_u64_at, write_file,
    write_short_bytes, write_u16, write_u32, write_u64,
};
use crate::error::{ReadError, Result};
use crate::pool::BufferPools;
use crate::telemetry::{reader_metrics, ReaderEvent, ReaderEventListener};
use crate::types::WILDCARD_COLUMN;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

pub const AGILE_TREE_FORMAT: u8 = 0x01;

const SLOT_NONE: u8 = 0;
const SLOT_INT: u8 = 1;
const SLOT_FLOAT: u8 = 2;
const SLOT_LEN: usize = 9;
const KEY_LEN: usize = 4;
const SLOTS_PER_MEASURE: usize = 3;
const LEVEL_HEADER_LEN: usize = 6;

pub fn meta_file_path(segment_key: &str) -> PathBuf {
    PathBuf::from(format!("{}.stm", segment_key))
}

pub fn levels_file_path(segment_key: &str) -> PathBuf {
    PathBuf::from(format!("{}.stl", segment_key))
}

/// True if the segment was written with a group-by tree.
pub fn has_agile_tree(segment_key: &str) -> bool {
    meta_file_path(segment_key).is_file() && levels_file_path(segment_key).is_file()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelLocation {
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TreeMeta {
    pub group_by_columns: Vec<String>,
    pub measure_columns: Vec<String>,
    /// Per group-by column (same order), dictionary index to raw value.
    pub dictionaries: Vec<Vec<Vec<u8>>>,
    /// Index 0 is level 1.
    pub levels: Vec<LevelLocation>,
}

impl TreeMeta {
    /// Slots per node: the count plus `[min, max, sum]` per measure column.
    pub fn agg_values_per_node(&self) -> usize {
        1 + SLOTS_PER_MEASURE * self.measure_columns.len()
    }

    /// 1-based level of a group-by column.
    pub fn level_of(&self, column: &str) -> Option<usize> {
        self.group_by_columns
            .iter()
            .position(|c| c == column)
            .map(|p| p + 1)
    }

    fn measure_index(&self, column: &str) -> Option<usize> {
        self.measure_columns.iter().position(|c| c == column)
    }

    fn is_indexed(&self, column: &str) -> bool {
        self.level_of(column).is_some() || self.measure_index(column).is_some()
    }

    /// Parses a meta file, checking the format tag and the declared length.
    pub fn decode(buf: &[u8]) -> Result<TreeMeta> {
        let tag = *buf
            .first()
            .ok_or_else(|| ReadError::corruption("Empty agile tree meta file"))?;
        if tag != AGILE_TREE_FORMAT {
            return Err(ReadError::corruption(format!(
                "Unsupported agile tree format tag {:#04x}",
                tag
            )));
        }
        let meta_len = read_u32_at(buf, 1)? as usize;
        let body = buf
            .get(5..5 + meta_len)
            .ok_or_else(|| ReadError::corruption("Truncated agile tree meta"))?;

        let mut off = 0usize;
        let read_names = |off: &mut usize| -> Result<Vec<String>> {
            let n = read_u16_at(body, *off)? as usize;
            *off += 2;
            let mut names = Vec::with_capacity(n);
            for _ in 0..n {
                let (name, used) = read_short_bytes_at(body, *off)?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| ReadError::corruption("Agile tree column name is not valid UTF-8"))?;
                names.push(name.to_owned());
                *off += used;
            }
            Ok(names)
        };
        let group_by_columns = read_names(&mut off)?;
        let measure_columns = read_names(&mut off)?;

        let mut dictionaries = Vec::with_capacity(group_by_columns.len());
        for col in &group_by_columns {
            let (name, used) = read_short_bytes_at(body, off)?;
            off += used;
            if name != col.as_bytes() {
                return Err(ReadError::corruption(format!(
                    "Agile tree dictionary for '{}' found where '{}' was expected",
                    String::from_utf8_lossy(name),
                    col
                )));
            }
            let entries = read_u32_at(body, off)? as usize;
            off += 4;
            let mut dict = Vec::with_capacity(entries.min(body.len()));
            for _ in 0..entries {
                let (word, used) = read_short_bytes_at(body, off)?;
                dict.push(word.to_vec());
                off += used;
            }
            dictionaries.push(dict);
        }

        let mut levels = Vec::with_capacity(group_by_columns.len());
        for _ in 0..group_by_columns.len() {
            levels.push(LevelLocation {
                offset: read_u64_at(body, off)?,
                size: read_u32_at(body, off + 8)?,
            });
            off += 12;
        }
        Ok(TreeMeta {
            group_by_columns,
            measure_columns,
            dictionaries,
            levels,
        })
    }
}

/// Where a requested measure comes from inside a node.
#[derive(Debug, Clone, Copy)]
enum SlotPlan {
    /// Derived from the node's record count.
    Count,
    Slot { index: usize, function: AggFunction },
}

#[derive(Debug)]
pub struct AgileTreeReader {
    segment_key: String,
    meta_file: File,
    levels_file: File,
    meta: Option<TreeMeta>,
    pools: Arc<BufferPools>,
    events: Arc<dyn ReaderEventListener>,
}

impl AgileTreeReader {
    pub fn open(
        segment_key: impl Into<String>,
        pools: Arc<BufferPools>,
        events: Arc<dyn ReaderEventListener>,
    ) -> Result<Self> {
        let segment_key = segment_key.into();
        let meta_file = File::open(meta_file_path(&segment_key))?;
        let levels_file = File::open(levels_file_path(&segment_key))?;
        Ok(Self {
            segment_key,
            meta_file,
            levels_file,
            meta: None,
            pools,
            events,
        })
    }

    /// Reads the meta file on first call; later calls return the cached copy.
    pub fn read_tree_meta(&mut self) -> Result<&TreeMeta> {
        if self.meta.is_none() {
            let len = self.meta_file.metadata()?.len() as usize;
            let mut buf = self.pools.bytes.acquire(len);
            let parsed = read_exact_at(&self.meta_file, &mut buf, 0)
                .map_err(ReadError::from)
                .and_then(|_| TreeMeta::decode(&buf));
            self.pools.bytes.release(buf);
            self.meta = Some(parsed?);
        }
        match &self.meta {
            Some(meta) => Ok(meta),
            None => Err(ReadError::Internal("Agile tree meta not loaded".to_string())),
        }
    }

    /// True if every group-by column and every non-count measure column of `request` is
    /// indexed by the tree.
    pub fn can_use_agile_tree(&mut self, request: &GroupByRequest) -> Result<bool> {
        if request.group_by_columns.is_empty() && request.measure_operations.is_empty() {
            return Ok(false);
        }
        let meta = self.read_tree_meta()?;
        if meta.levels.is_empty() {
            return Ok(false);
        }
        if request
            .group_by_columns
            .iter()
            .any(|c| meta.level_of(c).is_none())
        {
            return Ok(false);
        }
        let measures_ok = request.measure_operations.iter().all(|m| {
            if m.is_count() {
                m.column == WILDCARD_COLUMN || meta.is_indexed(&m.column)
            } else {
                meta.measure_index(&m.column).is_some()
            }
        });
        Ok(measures_ok)
    }

    /// Answers `request` from the tree and adds the resulting buckets to `results`.
    ///
    /// Only the level of the deepest requested group-by column is read. Callers must have
    /// checked [`can_use_agile_tree`](Self::can_use_agile_tree).
    pub fn apply_group_by_jit(
        &mut self,
        request: &GroupByRequest,
        results: &mut GroupByBuckets,
    ) -> Result<()> {
        self.read_tree_meta()?;
        let Some(meta) = self.meta.as_ref() else {
            return Err(ReadError::Internal("Agile tree meta not loaded".to_string()));
        };

        let mut req_levels = Vec::with_capacity(request.group_by_columns.len());
        for col in &request.group_by_columns {
            let level = meta.level_of(col).ok_or_else(|| {
                ReadError::Internal(format!("Group-by column '{}' is not in the agile tree", col))
            })?;
            req_levels.push(level);
        }
        let max_level = req_levels.iter().copied().max().unwrap_or(1);
        let plans = slot_plans(meta, request)?;

        let loc = *meta.levels.get(max_level - 1).ok_or_else(|| {
            ReadError::corruption(format!("Agile tree has no level {}", max_level))
        })?;
        let mut buf = self.pools.bytes.acquire(loc.size as usize);
        let outcome = read_exact_at(&self.levels_file, &mut buf, loc.offset)
            .map_err(ReadError::from)
            .and_then(|_| {
                scan_level(meta, &buf, max_level, &req_levels, &plans, results)
            });
        self.pools.bytes.release(buf);
        let limit_hit = outcome?;

        if limit_hit {
            self.events.on_event(ReaderEvent::AgileTreeBucketLimitReached {
                segment_key: self.segment_key.clone(),
                limit: request.bucket_limit,
            });
        }
        Ok(())
    }
}

fn slot_plans(meta: &TreeMeta, request: &GroupByRequest) -> Result<Vec<SlotPlan>> {
    request
        .measure_operations
        .iter()
        .map(|m| {
            if m.is_count() {
                return Ok(SlotPlan::Count);
            }
            let mi = meta.measure_index(&m.column).ok_or_else(|| {
                ReadError::Internal(format!("Measure column '{}' is not in the agile tree", m.column))
            })?;
            let within = match m.function {
                AggFunction::Min => 0,
                AggFunction::Max => 1,
                _ => 2,
            };
            Ok(SlotPlan::Slot {
                index: 1 + SLOTS_PER_MEASURE * mi + within,
                function: m.function,
            })
        })
        .collect()
}

fn read_slot(buf: &[u8], off: usize) -> Result<Option<NumericValue>> {
    let dtype = *buf
        .get(off)
        .ok_or_else(|| ReadError::corruption("Truncated agile tree slot"))?;
    let raw = read_u64_at(buf, off + 1)?;
    match dtype {
        SLOT_NONE => Ok(None),
        SLOT_INT => Ok(Some(NumericValue::Int(raw as i64))),
        SLOT_FLOAT => Ok(Some(NumericValue::Float(f64::from_bits(raw)))),
        other => Err(ReadError::corruption(format!(
            "Unknown agile tree slot type {}",
            other
        ))),
    }
}

/// Offset of the dictionary index for `level` inside a node of `node_level`.
#[inline]
fn key_offset(level: usize, node_level: usize) -> usize {
    if level == node_level {
        0
    } else {
        KEY_LEN * level
    }
}

/// Folds one level into `results`. Returns whether the bucket limit rejected any key.
fn scan_level(
    meta: &TreeMeta,
    buf: &[u8],
    level: usize,
    req_levels: &[usize],
    plans: &[SlotPlan],
    results: &mut GroupByBuckets,
) -> Result<bool> {
    let stored_level = read_u16_at(buf, 0)? as usize;
    if stored_level != level {
        return Err(ReadError::corruption(format!(
            "Agile tree level header says {} where level {} was expected",
            stored_level, level
        )));
    }
    let num_nodes = read_u32_at(buf, 2)? as usize;
    let keys_len = KEY_LEN * level;
    let node_len = keys_len + SLOT_LEN * meta.agg_values_per_node();
    let needed = num_nodes
        .checked_mul(node_len)
        .and_then(|n| n.checked_add(LEVEL_HEADER_LEN));
    if needed.map_or(true, |n| n > buf.len()) {
        return Err(ReadError::corruption(format!(
            "Agile tree level {} is truncated: {} nodes of {} bytes in {} bytes",
            level,
            num_nodes,
            node_len,
            buf.len()
        )));
    }

    let offsets: Vec<usize> = req_levels.iter().map(|&l| key_offset(l, level)).collect();
    let columns: Vec<usize> = req_levels.iter().map(|&l| l - 1).collect();
    // Composite key of dictionary indices -> raw key if admitted.
    let mut admitted: HashMap<Vec<u8>, Option<BucketKey>> = HashMap::new();
    let mut combiner: HashMap<Vec<u8>, (u64, Vec<Accumulator>)> = HashMap::new();
    let mut composite = Vec::with_capacity(KEY_LEN * offsets.len());
    let mut limit_hit = false;

    for n in 0..num_nodes {
        let node = &buf[LEVEL_HEADER_LEN + n * node_len..LEVEL_HEADER_LEN + (n + 1) * node_len];
        composite.clear();
        for &o in &offsets {
            composite.extend_from_slice(&node[o..o + KEY_LEN]);
        }

        let is_admitted = match admitted.get(&composite) {
            Some(raw) => raw.is_some(),
            None => {
                let raw_key = resolve_key(meta, &columns, &composite)?;
                let ok = results.admit(&raw_key);
                limit_hit |= !ok;
                admitted.insert(composite.clone(), ok.then_some(raw_key));
                ok
            }
        };
        if !is_admitted {
            continue;
        }

        let slots = &node[keys_len..];
        let count = match read_slot(slots, 0)? {
            Some(NumericValue::Int(c)) => c.max(0) as u64,
            Some(NumericValue::Float(c)) => c.max(0.0) as u64,
            None => 0,
        };
        let entry = combiner
            .entry(composite.clone())
            .or_insert_with(|| (0, vec![Accumulator::Empty; plans.len()]));
        entry.0 += count;
        for (acc, plan) in entry.1.iter_mut().zip(plans) {
            if let SlotPlan::Slot { index, function } = *plan {
                if let Some(v) = read_slot(slots, index * SLOT_LEN)? {
                    acc.reduce(v, function);
                }
            }
        }
    }
    reader_metrics::record_agile_tree_nodes(num_nodes as u64);

    for (composite, (count, accs)) in combiner {
        if let Some(Some(raw_key)) = admitted.remove(&composite) {
            results.add(raw_key, count, &accs);
        }
    }
    Ok(limit_hit)
}

fn resolve_key(meta: &TreeMeta, columns: &[usize], composite: &[u8]) -> Result<BucketKey> {
    columns
        .iter()
        .zip(composite.chunks_exact(KEY_LEN))
        .map(|(&col, idx)| {
            let idx = read_u32_at(idx, 0)? as usize;
            let word = meta.dictionaries[col].get(idx).ok_or_else(|| {
                ReadError::corruption(format!(
                    "Dictionary index {} out of range for '{}'",
                    idx, meta.group_by_columns[col]
                ))
            })?;
            let word = std::str::from_utf8(word).map_err(|_| {
                ReadError::corruption(format!(
                    "Dictionary word {} of '{}' is not valid UTF-8",
                    idx, meta.group_by_columns[col]
                ))
            })?;
            Ok(word.to_owned())
        })
        .collect()
}

#[derive(Debug, Clone)]
struct NodeAggregates {
    count: u64,
    /// `[min, max, sum]` per measure column.
    slots: Vec<Accumulator>,
}

/// Builds the meta and level files for a segment. Used to produce fixtures.
#[derive(Debug)]
pub struct AgileTreeWriter {
    group_by_columns: Vec<String>,
    measure_columns: Vec<String>,
    dictionaries: Vec<Vec<Vec<u8>>>,
    dict_lookup: Vec<HashMap<Vec<u8>, u32>>,
    /// Full-depth key path to aggregates.
    leaves: BTreeMap<Vec<u32>, NodeAggregates>,
}

impl AgileTreeWriter {
    pub fn new<S: Into<String>>(
        group_by_columns: impl IntoIterator<Item = S>,
        measure_columns: impl IntoIterator<Item = S>,
    ) -> Self {
        let group_by_columns: Vec<String> = group_by_columns.into_iter().map(Into::into).collect();
        let n = group_by_columns.len();
        Self {
            group_by_columns,
            measure_columns: measure_columns.into_iter().map(Into::into).collect(),
            dictionaries: vec![Vec::new(); n],
            dict_lookup: vec![HashMap::new(); n],
            leaves: BTreeMap::new(),
        }
    }

    /// Adds one record: a raw value per group-by column and an optional value per measure.
    pub fn add_row(&mut self, group_values: &[&[u8]], measures: &[Option<NumericValue>]) -> Result<()> {
        if group_values.len() != self.group_by_columns.len()
            || measures.len() != self.measure_columns.len()
        {
            return Err(ReadError::Internal(format!(
                "Row has {} group values and {} measures; tree expects {} and {}",
                group_values.len(),
                measures.len(),
                self.group_by_columns.len(),
                self.measure_columns.len()
            )));
        }
        let mut path = Vec::with_capacity(group_values.len());
        for (col, value) in group_values.iter().enumerate() {
            let idx = match self.dict_lookup[col].get(*value) {
                Some(&i) => i,
                None => {
                    let i = self.dictionaries[col].len() as u32;
                    self.dictionaries[col].push(value.to_vec());
                    self.dict_lookup[col].insert(value.to_vec(), i);
                    i
                }
            };
            path.push(idx);
        }
        let width = SLOTS_PER_MEASURE * self.measure_columns.len();
        let node = self.leaves.entry(path).or_insert_with(|| NodeAggregates {
            count: 0,
            slots: vec![Accumulator::Empty; width],
        });
        node.count += 1;
        for (m, v) in measures.iter().enumerate() {
            if let Some(v) = *v {
                let s = &mut node.slots[SLOTS_PER_MEASURE * m..SLOTS_PER_MEASURE * (m + 1)];
                s[0].reduce(v, AggFunction::Min);
                s[1].reduce(v, AggFunction::Max);
                s[2].reduce(v, AggFunction::Sum);
            }
        }
        Ok(())
    }

    /// Node aggregates of `level`, keyed by the key path of levels `1..=level`.
    fn level_nodes(&self, level: usize) -> BTreeMap<Vec<u32>, NodeAggregates> {
        let mut out: BTreeMap<Vec<u32>, NodeAggregates> = BTreeMap::new();
        for (path, agg) in &self.leaves {
            let node = out
                .entry(path[..level].to_vec())
                .or_insert_with(|| NodeAggregates {
                    count: 0,
                    slots: vec![Accumulator::Empty; agg.slots.len()],
                });
            node.count += agg.count;
            for (i, (dst, &src)) in node.slots.iter_mut().zip(&agg.slots).enumerate() {
                let f = match i % SLOTS_PER_MEASURE {
                    0 => AggFunction::Min,
                    1 => AggFunction::Max,
                    _ => AggFunction::Sum,
                };
                dst.combine(src, f);
            }
        }
        out
    }

    /// Serializes `(meta, levels)` file contents.
    pub fn encode(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut levels_buf = Vec::new();
        let mut locations = Vec::with_capacity(self.group_by_columns.len());
        for level in 1..=self.group_by_columns.len() {
            let start = levels_buf.len();
            let nodes = self.level_nodes(level);
            write_u16(&mut levels_buf, level as u16);
            write_u32(&mut levels_buf, nodes.len() as u32);
            for (path, agg) in &nodes {
                write_u32(&mut levels_buf, path[level - 1]);
                for &anc in &path[..level - 1] {
                    write_u32(&mut levels_buf, anc);
                }
                write_slot(&mut levels_buf, Accumulator::Int(agg.count as i64));
                for &s in &agg.slots {
                    write_slot(&mut levels_buf, s);
                }
            }
            locations.push(LevelLocation {
                offset: start as u64,
                size: (levels_buf.len() - start) as u32,
            });
        }

        let mut body = Vec::new();
        for names in [&self.group_by_columns, &self.measure_columns] {
            write_u16(&mut body, names.len() as u16);
            for name in names {
                write_short_bytes(&mut body, name.as_bytes())?;
            }
        }
        for (name, dict) in self.group_by_columns.iter().zip(&self.dictionaries) {
            write_short_bytes(&mut body, name.as_bytes())?;
            write_u32(&mut body, dict.len() as u32);
            for word in dict {
                write_short_bytes(&mut body, word)?;
            }
        }
        for loc in &locations {
            write_u64(&mut body, loc.offset);
            write_u32(&mut body, loc.size);
        }
        let mut meta_buf = Vec::with_capacity(body.len() + 5);
        meta_buf.push(AGILE_TREE_FORMAT);
        write_u32(&mut meta_buf, body.len() as u32);
        meta_buf.extend_from_slice(&body);
        Ok((meta_buf, levels_buf))
    }

    pub fn write(&self, segment_key: &str) -> Result<()> {
        let (meta, levels) = self.encode()?;
        write_file(&levels_file_path(segment_key), &levels)?;
        write_file(&meta_file_path(segment_key), &meta)
    }
}

fn write_slot(out: &mut Vec<u8>, acc: Accumulator) {
    match acc {
        Accumulator::Empty => {
            out.push(SLOT_NONE);
            write_u64(out, 0);
        }
        Accumulator::Int(v) => {
            out.push(SLOT_INT);
            write_u64(out, v as u64);
        }
        Accumulator::Float(v) => {
            out.push(SLOT_FLOAT);
            write_u64(out, v.to_bits());
        }
    }
}
