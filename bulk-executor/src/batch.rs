use std::collections::HashSet;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::api::{BadInputElement, ElementError};
use crate::element::{Document, GraphElement};
use crate::partition::{PartitionKeyRange, PartitionRouter};

pub const DEFAULT_MAX_BATCH_COUNT: usize = 500;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_IN_MEMORY_SORTING_BATCH_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
    /// Total elements buffered across all open batches before the fullest one is sealed early.
    pub max_buffered: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        BatchLimits {
            max_count: DEFAULT_MAX_BATCH_COUNT,
            max_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_buffered: DEFAULT_MAX_IN_MEMORY_SORTING_BATCH_SIZE,
        }
    }
}

/// Documents destined for one partition key range, in append order.
#[derive(Debug)]
pub struct Batch {
    range: PartitionKeyRange,
    sequence: u64,
    documents: Vec<Document>,
    ids: HashSet<String>,
    estimated_bytes: usize,
}

impl Batch {
    pub fn new(range: PartitionKeyRange, sequence: u64, documents: Vec<Document>) -> Self {
        let estimated_bytes = documents.iter().map(Document::estimated_size).sum();
        let ids = documents.iter().map(|d| d.id.clone()).collect();
        Batch {
            range,
            sequence,
            documents,
            ids,
            estimated_bytes,
        }
    }

    pub fn range(&self) -> &PartitionKeyRange {
        &self.range
    }

    /// Position of this batch among the batches of its range.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn into_parts(self) -> (PartitionKeyRange, u64, Vec<Document>) {
        (self.range, self.sequence, self.documents)
    }

    // An empty batch always takes the document, even one larger than the byte bound.
    fn would_overflow(&self, size: usize, limits: &BatchLimits) -> bool {
        !self.is_empty()
            && (self.documents.len() + 1 > limits.max_count
                || self.estimated_bytes + size > limits.max_bytes)
    }

    /// Whether a document with this id is already part of the batch.
    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn push(&mut self, document: Document) {
        self.estimated_bytes += document.estimated_size();
        self.ids.insert(document.id.clone());
        self.documents.push(document);
    }
}

/// Groups incoming elements by partition key range into bounded batches.
pub struct BatchAssembler {
    router: PartitionRouter,
    partition_key_path: String,
    limits: BatchLimits,
    generate_ids: bool,
    open: Vec<Option<Batch>>,
    next_batch_sequence: Vec<u64>,
    next_element_sequence: u64,
    buffered: usize,
}

impl BatchAssembler {
    pub fn new(
        router: PartitionRouter,
        partition_key_path: impl Into<String>,
        limits: BatchLimits,
        generate_ids: bool,
    ) -> Self {
        let count = router.ranges().len();
        BatchAssembler {
            router,
            partition_key_path: partition_key_path.into(),
            limits,
            generate_ids,
            open: (0..count).map(|_| None).collect(),
            next_batch_sequence: vec![0; count],
            next_element_sequence: 0,
            buffered: 0,
        }
    }

    /// Number of elements sitting in open batches.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Add an element to its range's open batch, returning any batches sealed along the way.
    ///
    /// Elements that cannot be routed or serialized come back as bad input.
    pub fn append(&mut self, mut element: GraphElement) -> Result<Vec<Batch>, BadInputElement> {
        let sequence = self.next_element_sequence;
        self.next_element_sequence += 1;

        if element.id().is_empty() {
            if !self.generate_ids {
                return Err(BadInputElement {
                    sequence,
                    element,
                    cause: ElementError::MalformedElement(
                        "element has no id and automatic id generation is disabled".to_string(),
                    ),
                });
            }
            element.set_id(Uuid::new_v4().to_string());
        }

        let index = match element
            .partition_key(&self.partition_key_path)
            .and_then(|value| self.router.route_value(value))
        {
            Ok(index) => index,
            Err(cause) => {
                return Err(BadInputElement {
                    sequence,
                    element,
                    cause,
                })
            }
        };

        let document = match Document::new(sequence, element, &self.partition_key_path) {
            Ok(document) => document,
            Err((element, cause)) => {
                return Err(BadInputElement {
                    sequence,
                    element,
                    cause,
                })
            }
        };

        let mut sealed = Vec::new();
        // a repeated id starts a new batch so the store sees the writes in input order
        let overflow = match &self.open[index] {
            Some(b) => {
                b.would_overflow(document.estimated_size(), &self.limits)
                    || b.contains_id(&document.id)
            }
            None => false,
        };
        if overflow {
            sealed.extend(self.seal(index));
        }

        if self.open[index].is_none() {
            let batch_sequence = self.next_batch_sequence[index];
            self.next_batch_sequence[index] += 1;
            let range = self.router.ranges()[index].clone();
            self.open[index] = Some(Batch::new(range, batch_sequence, Vec::new()));
        }
        if let Some(batch) = self.open[index].as_mut() {
            trace!(range = %batch.range.id, id = %document.id, "appending document");
            batch.push(document);
            self.buffered += 1;
        }

        if self.buffered >= self.limits.max_buffered {
            if let Some(fullest) = self.fullest() {
                debug!(
                    buffered = self.buffered,
                    "in-memory buffer is full, sealing the largest batch"
                );
                sealed.extend(self.seal(fullest));
            }
        }

        Ok(sealed)
    }

    /// Seal every open, non-empty batch, in range order.
    pub fn flush(&mut self) -> Vec<Batch> {
        (0..self.open.len()).filter_map(|i| self.seal(i)).collect()
    }

    fn seal(&mut self, index: usize) -> Option<Batch> {
        let batch = self.open[index].take().filter(|b| !b.is_empty())?;
        self.buffered -= batch.len();
        debug!(
            range = %batch.range.id,
            sequence = batch.sequence,
            count = batch.len(),
            bytes = batch.estimated_bytes,
            "sealed batch"
        );
        Some(batch)
    }

    fn fullest(&self) -> Option<usize> {
        self.open
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i, b.len())))
            .max_by_key(|(i, len)| (*len, std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }
}
