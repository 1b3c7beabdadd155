/// Partition key values are hashed into a 32 bit keyspace, and the backing store splits that
/// keyspace into contiguous ranges. Every range is the unit of routing and of concurrency: all
/// writes for a range go through one worker, so the mapping from value to range must be stable
/// for the whole run.
///
/// Integral floats hash like the equivalent integer, so `1` and `1.0` land in the same range.
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::{ElementError, ImportError};
use crate::element::{GraphElement, ScalarValue};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: u32,
    pub max_inclusive: u32,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, min_inclusive: u32, max_inclusive: u32) -> Self {
        PartitionKeyRange {
            id: id.into(),
            min_inclusive,
            max_inclusive,
        }
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.min_inclusive <= hash && hash <= self.max_inclusive
    }

    /// Split the keyspace into `count` ranges of (nearly) equal width, with ids "0".."count-1".
    pub fn split_evenly(count: u32) -> Vec<PartitionKeyRange> {
        if count == 0 {
            return Vec::new();
        }

        let width = (u32::MAX as u64 + 1) / count as u64;
        (0..count as u64)
            .map(|i| {
                let min = i * width;
                let max = if i + 1 == count as u64 {
                    u32::MAX as u64
                } else {
                    (i + 1) * width - 1
                };
                PartitionKeyRange::new(i.to_string(), min as u32, max as u32)
            })
            .collect()
    }
}

/// Hash a partition key value into the keyspace.
pub fn effective_partition_key(value: &ScalarValue) -> Result<u32, ElementError> {
    let mut hasher = Fnv1a::default();

    match value {
        ScalarValue::String(s) => {
            hasher.write(&[0x01]);
            hasher.write(s.as_bytes());
        }
        ScalarValue::Integer(i) => {
            hasher.write(&[0x02]);
            hasher.write(&i.to_le_bytes());
        }
        ScalarValue::Float(f) if !f.is_finite() => {
            return Err(ElementError::InvalidPartitionKey(format!(
                "unsupported partition key value {f}"
            )))
        }
        ScalarValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => {
            hasher.write(&[0x02]);
            hasher.write(&(*f as i64).to_le_bytes());
        }
        ScalarValue::Float(f) => {
            hasher.write(&[0x03]);
            hasher.write(&f.to_bits().to_le_bytes());
        }
        ScalarValue::Boolean(b) => {
            hasher.write(&[0x04, u8::from(*b)]);
        }
    }

    Ok(hasher.finish())
}

struct Fnv1a(u32);

impl Default for Fnv1a {
    fn default() -> Self {
        Fnv1a(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u32::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    // FNV alone leaves the high bits poorly mixed for short keys, and ranges split on them.
    fn finish(&self) -> u32 {
        let mut h = self.0;
        h ^= h >> 16;
        h = h.wrapping_mul(0x85eb_ca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2_ae35);
        h ^= h >> 16;
        h
    }
}

#[derive(Debug, Clone)]
pub struct PartitionRouter {
    ranges: Arc<[PartitionKeyRange]>,
}

impl PartitionRouter {
    /// Ranges must tile the whole keyspace: no gaps, no overlaps, unique ids.
    pub fn new(mut ranges: Vec<PartitionKeyRange>) -> Result<Self, ImportError> {
        if ranges.is_empty() {
            return Err(ImportError::PartitionLayout(
                "no partition key ranges".to_string(),
            ));
        }

        ranges.sort_by_key(|r| r.min_inclusive);

        let mut ids = HashSet::new();
        let mut next_min = Some(0u32);
        for range in &ranges {
            if !ids.insert(range.id.as_str()) {
                return Err(ImportError::PartitionLayout(format!(
                    "duplicate range id {}",
                    range.id
                )));
            }
            if range.min_inclusive > range.max_inclusive {
                return Err(ImportError::PartitionLayout(format!(
                    "range {} is empty",
                    range.id
                )));
            }
            if next_min != Some(range.min_inclusive) {
                return Err(ImportError::PartitionLayout(format!(
                    "range {} starts at {} but the previous range ends before {:?}",
                    range.id, range.min_inclusive, next_min
                )));
            }
            next_min = range.max_inclusive.checked_add(1);
        }
        if next_min.is_some() {
            return Err(ImportError::PartitionLayout(
                "ranges do not cover the end of the keyspace".to_string(),
            ));
        }

        Ok(PartitionRouter {
            ranges: ranges.into(),
        })
    }

    /// Ranges ordered by the start of their slice of the keyspace.
    pub fn ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    pub fn route_value(&self, value: &ScalarValue) -> Result<usize, ElementError> {
        let hash = effective_partition_key(value)?;
        Ok(self.ranges.partition_point(|r| r.max_inclusive < hash))
    }

    pub fn route(
        &self,
        element: &GraphElement,
        partition_key_path: &str,
    ) -> Result<&PartitionKeyRange, ElementError> {
        let index = self.route_value(element.partition_key(partition_key_path)?)?;
        Ok(&self.ranges[index])
    }
}
