use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, info, instrument};

use crate::api::StoreError;
use crate::element::Document;
use crate::partition::{effective_partition_key, PartitionKeyRange};
use crate::store::{BackingStore, ElementStatus, StoreResponse, WriteMode};
use crate::throttle::CapacityLimiter;

pub const MAX_ID_LENGTH: usize = 1000;
pub const MAX_DOCUMENT_BYTES: usize = 2 * 1024 * 1024;

const WRITE_CHARGE_BASE: f64 = 5.0;
const WRITE_CHARGE_PER_KIB: f64 = 1.0;
const REJECTED_CHARGE: f64 = 1.0;
/// Rough charge of one full batch request. Turns provisioned throughput into a request quota.
const ESTIMATED_CHARGE_PER_REQUEST: u32 = 100;

/// A partitioned collection kept in memory. Validates documents the way a hosted document store
/// does, charges capacity units per write and throttles ranges that exceed their share of the
/// provisioned throughput.
pub struct InMemoryStore {
    ranges: Vec<PartitionKeyRange>,
    partitions: HashMap<String, Mutex<HashMap<String, Bytes>>>,
    limiter: Option<CapacityLimiter>,
}

impl InMemoryStore {
    pub fn new(partition_count: u32) -> Self {
        let ranges = PartitionKeyRange::split_evenly(partition_count);
        let partitions = ranges
            .iter()
            .map(|r| (r.id.clone(), Mutex::new(HashMap::new())))
            .collect();

        InMemoryStore {
            ranges,
            partitions,
            limiter: None,
        }
    }

    /// Spread `throughput` capacity units per second evenly over the ranges.
    pub fn with_throughput(mut self, throughput: NonZeroU32) -> Self {
        let ranges = self.ranges.len().max(1) as u32;
        let per_range = (throughput.get() / ranges / ESTIMATED_CHARGE_PER_REQUEST).max(1);
        let per_second = NonZeroU32::new(per_range).unwrap_or(NonZeroU32::MIN);
        info!(
            throughput = throughput.get(),
            requests_per_second = per_range,
            "throttling each partition key range"
        );
        self.limiter = Some(CapacityLimiter::new(per_second, per_second));
        self
    }

    pub fn with_limiter(mut self, limiter: CapacityLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Drop every stored document.
    pub fn clear(&self) {
        for partition in self.partitions.values() {
            partition
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    pub fn len(&self) -> usize {
        self.partitions
            .values()
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look a document up by id across all ranges.
    pub fn document(&self, id: &str) -> Option<serde_json::Value> {
        self.partitions.values().find_map(|p| {
            p.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .and_then(|body| serde_json::from_slice(body).ok())
        })
    }

    fn validate(range: &PartitionKeyRange, document: &Document) -> Result<(), String> {
        if document.id.is_empty() {
            return Err("id must not be empty".to_string());
        }
        if document.id.chars().count() > MAX_ID_LENGTH {
            return Err(format!(
                "id is longer than {MAX_ID_LENGTH} characters"
            ));
        }
        if document.id.contains(['/', '\\', '?', '#']) {
            return Err(format!("id {} contains a forbidden character", document.id));
        }
        if document.body.len() > MAX_DOCUMENT_BYTES {
            return Err(format!("document is larger than {MAX_DOCUMENT_BYTES} bytes"));
        }
        match effective_partition_key(&document.partition_key) {
            Ok(hash) if range.contains(hash) => Ok(()),
            Ok(_) => Err(format!("partition key does not belong to range {}", range.id)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError> {
        Ok(self.ranges.clone())
    }

    #[instrument(skip_all, fields(range = %range.id, count = documents.len()))]
    async fn write_batch(
        &self,
        range: &PartitionKeyRange,
        documents: &[Document],
        mode: WriteMode,
    ) -> Result<StoreResponse, StoreError> {
        let Some(partition) = self.partitions.get(&range.id) else {
            return Err(StoreError::Unavailable(format!(
                "unknown partition key range {}",
                range.id
            )));
        };

        if let Some(limiter) = &self.limiter {
            if let Err(retry_after) = limiter.check(&range.id) {
                debug!(?retry_after, "request rate too large");
                counter!("bulk_import_store_throttled_total", 1);
                return Err(StoreError::Throttled {
                    retry_after: Some(retry_after),
                });
            }
        }

        let mut stored = partition.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statuses = Vec::with_capacity(documents.len());
        let mut charge = 0.0;

        for document in documents {
            if let Err(reason) = Self::validate(range, document) {
                charge += REJECTED_CHARGE;
                statuses.push(ElementStatus::Malformed(reason));
                continue;
            }
            if mode == WriteMode::Insert && stored.contains_key(&document.id) {
                charge += REJECTED_CHARGE;
                statuses.push(ElementStatus::Conflict);
                continue;
            }

            charge +=
                WRITE_CHARGE_BASE + WRITE_CHARGE_PER_KIB * document.body.len() as f64 / 1024.0;
            stored.insert(document.id.clone(), document.body.clone());
            statuses.push(ElementStatus::Accepted);
        }

        Ok(StoreResponse {
            statuses,
            request_charge: charge,
            retry_after: None,
        })
    }
}
