use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::api::{BadInputElement, BulkImportFailure, BulkImportResponse, RequestUnits};
use crate::writer::WriteOutcome;

/// Folds write outcomes from every partition worker into one response.
///
/// Counters are atomics and lists are sorted by input position on finalize, so the result does
/// not depend on the order outcomes arrive in.
#[derive(Default)]
pub struct ResultAggregator {
    imported: AtomicU64,
    request_units: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
    failures: Mutex<Vec<BulkImportFailure>>,
    bad_input: Mutex<Vec<BadInputElement>>,
}

impl ResultAggregator {
    pub fn record(&self, outcome: WriteOutcome) {
        self.imported
            .fetch_add(outcome.succeeded, Ordering::Relaxed);
        self.request_units
            .fetch_add(outcome.request_units.as_millis(), Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.retries
            .fetch_add(outcome.retries.into(), Ordering::Relaxed);

        if !outcome.failed.is_empty() {
            // One failure entry per distinct cause within the batch.
            let mut groups: Vec<BulkImportFailure> = Vec::new();
            for failed in outcome.failed {
                match groups.iter_mut().find(|g| g.cause == failed.cause) {
                    Some(group) => group.documents_failed_to_import.push(failed.element),
                    None => groups.push(BulkImportFailure {
                        partition_key_range_id: outcome.partition_key_range_id.clone(),
                        batch_sequence: outcome.batch_sequence,
                        cause: failed.cause,
                        documents_failed_to_import: vec![failed.element],
                        first_sequence: failed.sequence,
                    }),
                }
            }
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(groups);
        }

        if !outcome.bad_input.is_empty() {
            self.bad_input
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(outcome.bad_input);
        }
    }

    pub fn record_bad_input(&self, bad: BadInputElement) {
        self.bad_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bad);
    }

    /// Build the response. Only meaningful once every worker has finished recording.
    pub fn finalize(&self, total_time_taken: Duration, cancelled: bool) -> BulkImportResponse {
        let mut failed_imports =
            std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner));
        failed_imports.sort_by_key(|f| f.first_sequence);

        let mut bad_input_documents =
            std::mem::take(&mut *self.bad_input.lock().unwrap_or_else(PoisonError::into_inner));
        bad_input_documents.sort_by_key(|b| b.sequence);

        BulkImportResponse {
            number_of_documents_imported: self.imported.load(Ordering::Acquire),
            total_request_units_consumed: RequestUnits::from_millis(
                self.request_units.load(Ordering::Acquire),
            ),
            total_time_taken,
            number_of_batches_written: self.batches.load(Ordering::Acquire),
            total_retries: self.retries.load(Ordering::Acquire),
            failed_imports,
            bad_input_documents,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ElementError;
    use crate::element::{GraphElement, Vertex};
    use crate::writer::{BatchState, FailedElement};

    fn element(id: &str) -> GraphElement {
        Vertex::new(id, "vertex").into()
    }

    fn outcomes() -> Vec<WriteOutcome> {
        let mut first = WriteOutcome::new("0", 0);
        first.succeeded = 3;
        first.request_units = RequestUnits::from_f64(0.1);
        first.state = BatchState::Succeeded;

        let mut second = WriteOutcome::new("1", 0);
        second.succeeded = 1;
        second.retries = 2;
        second.request_units = RequestUnits::from_f64(0.2);
        second.state = BatchState::PartiallyFailed;
        second.failed = vec![
            FailedElement {
                sequence: 4,
                element: element("4"),
                cause: ElementError::Conflict,
            },
            FailedElement {
                sequence: 6,
                element: element("6"),
                cause: ElementError::Conflict,
            },
        ];

        let mut third = WriteOutcome::new("0", 1);
        third.state = BatchState::Failed;
        third.request_units = RequestUnits::from_f64(0.3);
        third.failed = vec![FailedElement {
            sequence: 1,
            element: element("1"),
            cause: ElementError::Cancelled,
        }];
        third.bad_input = vec![BadInputElement {
            sequence: 2,
            element: element("2"),
            cause: ElementError::MalformedElement("bad".into()),
        }];

        vec![first, second, third]
    }

    fn fold(order: &[usize]) -> BulkImportResponse {
        let aggregator = ResultAggregator::default();
        let outcomes = outcomes();
        for &i in order {
            aggregator.record(outcomes[i].clone());
        }
        aggregator.record_bad_input(BadInputElement {
            sequence: 0,
            element: element("0"),
            cause: ElementError::InvalidPartitionKey("missing".into()),
        });
        aggregator.finalize(Duration::from_secs(1), false)
    }

    #[test]
    fn folding_is_order_independent() {
        let reference = fold(&[0, 1, 2]);
        for order in [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            assert_eq!(fold(&order), reference);
        }
    }

    #[test]
    fn totals_and_grouping() {
        let response = fold(&[2, 1, 0]);

        assert_eq!(response.number_of_documents_imported, 4);
        assert_eq!(response.total_request_units_consumed, RequestUnits::from_millis(600));
        assert_eq!(response.number_of_batches_written, 3);
        assert_eq!(response.total_retries, 2);

        assert_eq!(response.failed_imports.len(), 2);
        assert_eq!(response.failed_imports[0].cause, ElementError::Cancelled);
        assert_eq!(response.failed_imports[1].documents_failed_to_import.len(), 2);
        assert_eq!(response.number_of_failed_documents(), 3);

        let bad: Vec<u64> = response.bad_input_documents.iter().map(|b| b.sequence).collect();
        assert_eq!(bad, vec![0, 2]);
    }
}
