//! Group-by requests, numeric accumulators and the per-query bucket collector.

use crate::types::WILDCARD_COLUMN;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunction {
    Count,
    Sum,
    Min,
    Max,
    /// Sum divided by record count, computed when the result is read.
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasureAggregator {
    pub column: String,
    pub function: AggFunction,
}

impl MeasureAggregator {
    pub fn new(column: impl Into<String>, function: AggFunction) -> Self {
        Self {
            column: column.into(),
            function,
        }
    }

    /// `count(*)`.
    pub fn count_all() -> Self {
        Self::new(WILDCARD_COLUMN, AggFunction::Count)
    }

    pub fn is_count(&self) -> bool {
        self.function == AggFunction::Count
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupByRequest {
    pub group_by_columns: Vec<String>,
    pub measure_operations: Vec<MeasureAggregator>,
    /// Maximum number of distinct buckets; `0` means unlimited.
    pub bucket_limit: usize,
}

impl GroupByRequest {
    pub fn new<S: Into<String>>(
        group_by_columns: impl IntoIterator<Item = S>,
        measure_operations: Vec<MeasureAggregator>,
    ) -> Self {
        Self {
            group_by_columns: group_by_columns.into_iter().map(Into::into).collect(),
            measure_operations,
            bucket_limit: 0,
        }
    }

    pub fn with_bucket_limit(mut self, limit: usize) -> Self {
        self.bucket_limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Int(i64),
    Float(f64),
}

impl NumericValue {
    pub fn as_f64(self) -> f64 {
        match self {
            NumericValue::Int(v) => v as f64,
            NumericValue::Float(v) => v,
        }
    }
}

/// Running value of one measure. Integer inputs stay integral until a float is mixed in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Accumulator {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
}

impl From<NumericValue> for Accumulator {
    fn from(v: NumericValue) -> Self {
        match v {
            NumericValue::Int(i) => Accumulator::Int(i),
            NumericValue::Float(f) => Accumulator::Float(f),
        }
    }
}

impl Accumulator {
    pub fn value(self) -> Option<NumericValue> {
        match self {
            Accumulator::Empty => None,
            Accumulator::Int(i) => Some(NumericValue::Int(i)),
            Accumulator::Float(f) => Some(NumericValue::Float(f)),
        }
    }

    /// Folds `other` into `self` under `function`. `Count` leaves the accumulator untouched;
    /// `Avg` accumulates the sum.
    pub fn combine(&mut self, other: Accumulator, function: AggFunction) {
        use Accumulator::*;
        let merged = match (*self, other) {
            (_, Empty) => return,
            (Empty, o) => o,
            (Int(a), Int(b)) => match function {
                AggFunction::Sum | AggFunction::Avg => Int(a.wrapping_add(b)),
                AggFunction::Min => Int(a.min(b)),
                AggFunction::Max => Int(a.max(b)),
                AggFunction::Count => return,
            },
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                match function {
                    AggFunction::Sum | AggFunction::Avg => Float(a + b),
                    AggFunction::Min => Float(a.min(b)),
                    AggFunction::Max => Float(a.max(b)),
                    AggFunction::Count => return,
                }
            }
        };
        *self = merged;
    }

    #[inline]
    pub fn reduce(&mut self, v: NumericValue, function: AggFunction) {
        self.combine(v.into(), function);
    }

    fn as_f64(self) -> f64 {
        match self {
            Accumulator::Empty => 0.0,
            Accumulator::Int(i) => i as f64,
            Accumulator::Float(f) => f,
        }
    }

    /// Final value of a measure for a bucket holding `count` records.
    pub fn finish(self, function: AggFunction, count: u64) -> Option<NumericValue> {
        match function {
            AggFunction::Count => Some(NumericValue::Int(count as i64)),
            AggFunction::Avg => {
                if count == 0 || self == Accumulator::Empty {
                    None
                } else {
                    Some(NumericValue::Float(self.as_f64() / count as f64))
                }
            }
            _ => self.value(),
        }
    }
}

/// Raw group-by values of a bucket, one per requested group-by column, in request order.
pub type BucketKey = Vec<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAggregates {
    pub count: u64,
    /// One per measure operation of the request.
    pub measures: Vec<Accumulator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupByRow {
    pub key: BucketKey,
    pub count: u64,
    pub values: Vec<Option<NumericValue>>,
}

/// Collects group-by results, possibly across several segments.
///
/// The seen-bucket set decides which keys may create new buckets when a limit is set; it can
/// be carried from one collector to the next with [`get_buckets`](Self::get_buckets) /
/// [`set_buckets`](Self::set_buckets).
#[derive(Debug, Clone)]
pub struct GroupByBuckets {
    functions: Vec<AggFunction>,
    bucket_limit: usize,
    seen: HashSet<BucketKey>,
    buckets: HashMap<BucketKey, BucketAggregates>,
}

impl GroupByBuckets {
    pub fn new(request: &GroupByRequest) -> Self {
        Self {
            functions: request
                .measure_operations
                .iter()
                .map(|m| m.function)
                .collect(),
            bucket_limit: request.bucket_limit,
            seen: HashSet::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn bucket_limit(&self) -> usize {
        self.bucket_limit
    }

    pub fn get_buckets(&self) -> HashSet<BucketKey> {
        self.seen.clone()
    }

    pub fn set_buckets(&mut self, seen: HashSet<BucketKey>) {
        self.seen = seen;
    }

    /// True if `key` may hold a bucket. New keys are recorded while under the limit.
    pub fn admit(&mut self, key: &BucketKey) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        if self.bucket_limit > 0 && self.seen.len() >= self.bucket_limit {
            return false;
        }
        self.seen.insert(key.clone());
        true
    }

    /// Adds partial aggregates for `key`. `measures` must follow the request's measure order.
    pub fn add(&mut self, key: BucketKey, count: u64, measures: &[Accumulator]) {
        let functions = &self.functions;
        let entry = self.buckets.entry(key).or_insert_with(|| BucketAggregates {
            count: 0,
            measures: vec![Accumulator::Empty; functions.len()],
        });
        entry.count += count;
        for ((acc, &m), &f) in entry.measures.iter_mut().zip(measures).zip(functions) {
            acc.combine(m, f);
        }
    }

    /// Folds another collector for the same request into this one, honouring this
    /// collector's limit.
    pub fn merge(&mut self, other: GroupByBuckets) {
        for (key, agg) in other.buckets {
            if self.admit(&key) {
                self.add(key, agg.count, &agg.measures);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, key: &[String]) -> Option<&BucketAggregates> {
        self.buckets.get(key)
    }

    /// Final rows sorted by key.
    pub fn into_rows(self) -> Vec<GroupByRow> {
        let functions = self.functions;
        let mut rows: Vec<GroupByRow> = self
            .buckets
            .into_iter()
            .map(|(key, agg)| GroupByRow {
                values: agg
                    .measures
                    .iter()
                    .zip(&functions)
                    .map(|(acc, &f)| acc.finish(f, agg.count))
                    .collect(),
                key,
                count: agg.count,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}
