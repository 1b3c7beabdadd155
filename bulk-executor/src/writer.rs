use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::api::{BadInputElement, ElementError, RequestUnits, StoreError};
use crate::batch::Batch;
use crate::element::{Document, GraphElement};
use crate::retry::RetryPolicy;
use crate::store::{BackingStore, ElementStatus, WriteMode};

/// Lifecycle of a batch. `Succeeded`, `PartiallyFailed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Assembled,
    Dispatched,
    Retrying,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Succeeded | BatchState::PartiallyFailed | BatchState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedElement {
    pub sequence: u64,
    pub element: GraphElement,
    pub cause: ElementError,
}

/// Everything that happened to one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub partition_key_range_id: String,
    pub batch_sequence: u64,
    pub state: BatchState,
    pub succeeded: u64,
    pub request_units: RequestUnits,
    pub elapsed: Duration,
    pub retries: u32,
    pub failed: Vec<FailedElement>,
    pub bad_input: Vec<BadInputElement>,
}

impl WriteOutcome {
    pub fn new(partition_key_range_id: impl Into<String>, batch_sequence: u64) -> Self {
        WriteOutcome {
            partition_key_range_id: partition_key_range_id.into(),
            batch_sequence,
            state: BatchState::Dispatched,
            succeeded: 0,
            request_units: RequestUnits::ZERO,
            elapsed: Duration::ZERO,
            retries: 0,
            failed: Vec::new(),
            bad_input: Vec::new(),
        }
    }

    // Split a response: count accepted documents, keep failures, hand back what must be retried.
    fn absorb(&mut self, documents: Vec<Document>, statuses: Vec<ElementStatus>) -> Vec<Document> {
        let mut retry = Vec::new();
        let mut statuses = statuses.into_iter();

        for document in documents {
            match statuses.next().unwrap_or(ElementStatus::Throttled) {
                ElementStatus::Accepted => self.succeeded += 1,
                ElementStatus::Throttled => retry.push(document),
                ElementStatus::Malformed(reason) => self.bad_input.push(BadInputElement {
                    sequence: document.sequence,
                    element: document.element,
                    cause: ElementError::MalformedElement(reason),
                }),
                ElementStatus::Conflict => self.fail(document, ElementError::Conflict),
            }
        }

        retry
    }

    fn fail(&mut self, document: Document, cause: ElementError) {
        self.failed.push(FailedElement {
            sequence: document.sequence,
            element: document.element,
            cause,
        });
    }

    fn fail_all(&mut self, documents: Vec<Document>, cause: ElementError) {
        for document in documents {
            self.fail(document, cause.clone());
        }
    }

    fn terminal_state(&self) -> BatchState {
        if self.failed.is_empty() && self.bad_input.is_empty() {
            BatchState::Succeeded
        } else if self.succeeded == 0 {
            BatchState::Failed
        } else {
            BatchState::PartiallyFailed
        }
    }
}

/// Writes one batch to the store, retrying throttled and unavailable requests.
pub struct ThrottleAwareWriter {
    store: Arc<dyn BackingStore + Send + Sync>,
    policy: RetryPolicy,
    mode: WriteMode,
}

impl ThrottleAwareWriter {
    pub fn new(
        store: Arc<dyn BackingStore + Send + Sync>,
        policy: RetryPolicy,
        mode: WriteMode,
    ) -> Self {
        ThrottleAwareWriter {
            store,
            policy,
            mode,
        }
    }

    /// Write `batch` until every document is accepted, rejected, or out of retries.
    ///
    /// Cancellation stops further retries; documents still pending are failed with
    /// [`ElementError::Cancelled`]. A request already sent is always awaited.
    #[instrument(
        skip_all,
        fields(range = %batch.range().id, batch = batch.sequence(), count = batch.len())
    )]
    pub async fn write(&self, batch: Batch, cancel: &CancellationToken) -> WriteOutcome {
        let started = Instant::now();
        let (range, sequence, mut pending) = batch.into_parts();
        let mut outcome = WriteOutcome::new(range.id.clone(), sequence);
        let mut waited = Duration::ZERO;

        histogram!("bulk_import_batch_size", pending.len() as f64);

        loop {
            let result = self.store.write_batch(&range, &pending, self.mode).await;
            let (retry, retry_after, cause) = match result {
                Ok(response) => {
                    outcome.request_units += RequestUnits::from_f64(response.request_charge);
                    let retry_after = response.retry_after;
                    let retry = outcome.absorb(pending, response.statuses);
                    (retry, retry_after, ElementError::Throttled { retry_after })
                }
                Err(err) => {
                    let retry_after = err.retry_after();
                    if let StoreError::Unavailable(message) = &err {
                        warn!("store unavailable: {}", message);
                    }
                    (pending, retry_after, ElementError::from(err))
                }
            };
            pending = retry;

            if pending.is_empty() {
                break;
            }
            counter!("bulk_import_throttled_requests_total", 1);

            let delay = self.policy.delay_for(outcome.retries, retry_after);
            if !self.policy.allows(outcome.retries, waited, delay) {
                warn!(
                    retries = outcome.retries,
                    remaining = pending.len(),
                    "retry budget exhausted: {}",
                    cause
                );
                let attempts = outcome.retries + 1;
                outcome.fail_all(
                    pending,
                    ElementError::ExhaustedRetries {
                        attempts,
                        last: Box::new(cause),
                    },
                );
                break;
            }
            if cancel.is_cancelled() {
                outcome.fail_all(pending, ElementError::Cancelled);
                break;
            }

            outcome.state = BatchState::Retrying;
            debug!(
                retries = outcome.retries,
                remaining = pending.len(),
                ?delay,
                "retrying batch: {}",
                cause
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    outcome.fail_all(pending, ElementError::Cancelled);
                    break;
                }
            }
            waited += delay;
            outcome.retries += 1;
            outcome.state = BatchState::Dispatched;
        }

        outcome.elapsed = started.elapsed();
        outcome.state = outcome.terminal_state();
        counter!("bulk_import_documents_imported_total", outcome.succeeded);
        debug!(
            state = ?outcome.state,
            succeeded = outcome.succeeded,
            retries = outcome.retries,
            "batch finished"
        );

        outcome
    }
}
