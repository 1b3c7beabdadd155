use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::api::StoreError;
use crate::element::Document;
use crate::partition::PartitionKeyRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// A document with an existing id is rejected as a conflict.
    Insert,
    /// A document with an existing id replaces the stored one.
    Upsert,
}

/// What the store did with one document of a batch request.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementStatus {
    Accepted,
    Throttled,
    Malformed(String),
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    /// One status per document, in request order. Missing trailing statuses mean "not processed".
    pub statuses: Vec<ElementStatus>,
    pub request_charge: f64,
    pub retry_after: Option<Duration>,
}

impl StoreResponse {
    pub fn accepted(count: usize, request_charge: f64) -> Self {
        StoreResponse {
            statuses: vec![ElementStatus::Accepted; count],
            request_charge,
            retry_after: None,
        }
    }
}

/// A partitioned document store that accepts batch writes per partition key range.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackingStore {
    async fn partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError>;

    async fn write_batch(
        &self,
        range: &PartitionKeyRange,
        documents: &[Document],
        mode: WriteMode,
    ) -> Result<StoreResponse, StoreError>;
}

/// Accepts everything and logs it.
pub struct PrintStore {
    ranges: Vec<PartitionKeyRange>,
}

impl PrintStore {
    pub fn new(partition_count: u32) -> Self {
        PrintStore {
            ranges: PartitionKeyRange::split_evenly(partition_count),
        }
    }
}

#[async_trait]
impl BackingStore for PrintStore {
    async fn partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError> {
        Ok(self.ranges.clone())
    }

    async fn write_batch(
        &self,
        range: &PartitionKeyRange,
        documents: &[Document],
        mode: WriteMode,
    ) -> Result<StoreResponse, StoreError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of documents", range = %range.id);
        let _enter = span.enter();

        histogram!("bulk_import_print_batch_size", documents.len() as f64);
        for document in documents {
            info!(
                ?mode,
                "document: {}",
                String::from_utf8_lossy(&document.body)
            );
        }

        Ok(StoreResponse::accepted(documents.len(), 0.0))
    }
}

/// Scripted reply for the next call to [`MockStore::write_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    AcceptAll,
    Throttle(Option<Duration>),
    Unavailable,
    Statuses(Vec<ElementStatus>),
    /// Reject these ids as malformed, accept the rest.
    RejectIds(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub range_id: String,
    pub ids: Vec<String>,
    pub mode: WriteMode,
}

// mockall is awkward for stateful call sequences, so tests mostly use this one
#[derive(Clone)]
pub struct MockStore {
    ranges: Vec<PartitionKeyRange>,
    charge_per_document: f64,
    latency: Duration,
    cancel_on_call: Option<(usize, CancellationToken)>,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    range_fetch_failures: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockStore {
    pub fn new(partition_count: u32) -> MockStore {
        MockStore::with_ranges(PartitionKeyRange::split_evenly(partition_count))
    }

    pub fn with_ranges(ranges: Vec<PartitionKeyRange>) -> MockStore {
        MockStore {
            ranges,
            charge_per_document: 1.0,
            latency: Duration::ZERO,
            cancel_on_call: None,
            replies: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            range_fetch_failures: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replies are consumed in order; once they run out every call is accepted.
    pub fn replies(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(replies);
        self
    }

    pub fn charge_per_document(mut self, charge: f64) -> Self {
        self.charge_per_document = charge;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_range_fetches(self, failures: usize) -> Self {
        self.range_fetch_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Cancel `token` while serving call number `call` (1 based).
    pub fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackingStore for MockStore {
    async fn partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError> {
        let failed = self
            .range_fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("partition map not ready".into()));
        }
        Ok(self.ranges.clone())
    }

    #[instrument(skip_all)]
    async fn write_batch(
        &self,
        range: &PartitionKeyRange,
        documents: &[Document],
        mode: WriteMode,
    ) -> Result<StoreResponse, StoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let call_number = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(MockCall {
                range_id: range.id.clone(),
                ids: documents.iter().map(|d| d.id.clone()).collect(),
                mode,
            });
            calls.len()
        };
        if let Some((on_call, token)) = &self.cancel_on_call {
            if *on_call == call_number {
                token.cancel();
            }
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(MockReply::AcceptAll);
        counter!("bulk_import_mock_store_calls_total", 1);

        let statuses = match reply {
            MockReply::AcceptAll => vec![ElementStatus::Accepted; documents.len()],
            MockReply::Throttle(retry_after) => {
                return Err(StoreError::Throttled { retry_after })
            }
            MockReply::Unavailable => {
                return Err(StoreError::Unavailable("mock store unavailable".into()))
            }
            MockReply::Statuses(statuses) => statuses,
            MockReply::RejectIds(ids) => documents
                .iter()
                .map(|d| {
                    if ids.contains(&d.id) {
                        ElementStatus::Malformed(format!("id {} rejected", d.id))
                    } else {
                        ElementStatus::Accepted
                    }
                })
                .collect(),
        };

        let accepted = statuses
            .iter()
            .filter(|s| **s == ElementStatus::Accepted)
            .count();
        Ok(StoreResponse {
            statuses,
            request_charge: accepted as f64 * self.charge_per_document,
            retry_after: None,
        })
    }
}
