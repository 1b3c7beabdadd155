use std::sync::Arc;
use std::time::Instant;

use futures::{pin_mut, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::ResultAggregator;
use crate::api::{BulkImportResponse, ImportError};
use crate::batch::BatchAssembler;
use crate::config::BulkImportOptions;
use crate::element::GraphElement;
use crate::partition::{PartitionKeyRange, PartitionRouter};
use crate::retry::{retry_transient, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::store::BackingStore;
use crate::writer::ThrottleAwareWriter;

/// Imports streams of graph elements into a partitioned backing store.
///
/// Call [`BulkExecutor::initialize`] once to load the partition layout, then run any number of
/// imports. Runs are independent and only share the store handle.
pub struct BulkExecutor {
    store: Arc<dyn BackingStore + Send + Sync>,
    partition_key_path: String,
    router: Option<PartitionRouter>,
}

impl BulkExecutor {
    pub fn new(
        store: Arc<dyn BackingStore + Send + Sync>,
        partition_key_path: impl Into<String>,
    ) -> Self {
        BulkExecutor {
            store,
            partition_key_path: partition_key_path.into(),
            router: None,
        }
    }

    /// Fetch the partition key ranges, retrying transient store errors with `policy`.
    #[instrument(skip_all)]
    pub async fn initialize(&mut self, policy: &RetryPolicy) -> Result<(), ImportError> {
        let store = self.store.clone();
        let ranges = retry_transient(policy, "fetch partition key ranges", || {
            let store = store.clone();
            async move { store.partition_key_ranges().await }
        })
        .await?;

        info!(ranges = ranges.len(), "loaded partition key ranges");
        self.router = Some(PartitionRouter::new(ranges)?);
        Ok(())
    }

    pub fn partition_key_ranges(&self) -> &[PartitionKeyRange] {
        self.router.as_ref().map_or(&[], PartitionRouter::ranges)
    }

    /// Import every element of `elements`.
    ///
    /// Per-element problems never fail the run: they are reported in the response. An error
    /// yielded by the stream stops the run and is returned once in-flight writes have drained.
    /// On cancellation the response covers the batches that were already dispatched.
    #[instrument(skip_all, fields(upsert = options.enable_upsert))]
    pub async fn bulk_import<S, E>(
        &self,
        elements: S,
        options: BulkImportOptions,
        cancel: CancellationToken,
    ) -> Result<BulkImportResponse, ImportError>
    where
        S: Stream<Item = Result<GraphElement, E>>,
        E: Into<anyhow::Error>,
    {
        let router = self.router.clone().ok_or(ImportError::NotInitialized)?;
        let batch_limits = options.batch_limits()?;
        let scheduler_limits = options.scheduler_limits()?;

        let started = Instant::now();
        let aggregator = Arc::new(ResultAggregator::default());
        let writer = Arc::new(ThrottleAwareWriter::new(
            self.store.clone(),
            options.retry_policy.clone(),
            options.write_mode(),
        ));
        let scheduler = Scheduler::start(
            router.ranges(),
            writer,
            aggregator.clone(),
            scheduler_limits,
            cancel.clone(),
        );
        let mut assembler = BatchAssembler::new(
            router,
            self.partition_key_path.clone(),
            batch_limits,
            !options.disable_automatic_id_generation,
        );

        let fed = feed(elements, &mut assembler, &scheduler, &aggregator, &cancel).await;
        if fed.is_ok() && !cancel.is_cancelled() {
            for batch in assembler.flush() {
                scheduler.dispatch(batch).await;
            }
        }
        let aggregator = scheduler.finish().await;
        let consumed = fed?;

        let cancelled = cancel.is_cancelled();
        let response = aggregator.finalize(started.elapsed(), cancelled);
        info!(
            consumed,
            imported = response.number_of_documents_imported,
            failed = response.number_of_failed_documents(),
            bad_input = response.bad_input_documents.len(),
            request_units = response.total_request_units_consumed.as_f64(),
            elapsed = ?response.total_time_taken,
            cancelled,
            "bulk import finished"
        );

        Ok(response)
    }
}

// Pull elements until the stream ends, fails, or the run is cancelled.
async fn feed<S, E>(
    elements: S,
    assembler: &mut BatchAssembler,
    scheduler: &Scheduler,
    aggregator: &ResultAggregator,
    cancel: &CancellationToken,
) -> Result<u64, ImportError>
where
    S: Stream<Item = Result<GraphElement, E>>,
    E: Into<anyhow::Error>,
{
    pin_mut!(elements);
    let mut consumed = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = elements.next() => next,
        };
        let Some(item) = next else {
            break;
        };
        let element = item.map_err(|e| ImportError::Input(e.into()))?;
        consumed += 1;

        match assembler.append(element) {
            Ok(sealed) => {
                for batch in sealed {
                    scheduler.dispatch(batch).await;
                }
            }
            Err(bad) => {
                warn!(
                    sequence = bad.sequence,
                    id = bad.element.id(),
                    "rejected element: {}",
                    bad.cause
                );
                aggregator.record_bad_input(bad);
            }
        }
    }

    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::stream;

    use super::*;
    use crate::element::Vertex;
    use crate::store::MockStore;

    fn vertices(count: i64) -> impl Stream<Item = Result<GraphElement, Infallible>> {
        stream::iter((0..count).map(|i| {
            let mut v = Vertex::new(i.to_string(), "vertex");
            v.add_property("pk", i);
            Ok(GraphElement::from(v))
        }))
    }

    #[tokio::test]
    async fn import_requires_initialization() {
        let executor = BulkExecutor::new(Arc::new(MockStore::new(1)), "pk");
        let result = executor
            .bulk_import(vertices(1), BulkImportOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ImportError::NotInitialized)));
        assert!(executor.partition_key_ranges().is_empty());
    }

    #[tokio::test]
    async fn initialization_retries_transient_errors() {
        let store = MockStore::new(4).fail_range_fetches(2);
        let mut executor = BulkExecutor::new(Arc::new(store), "pk");
        let policy = RetryPolicy {
            backoff_floor: std::time::Duration::from_millis(1),
            base_delay: std::time::Duration::from_millis(1),
            ..RetryPolicy::initialization()
        };

        executor.initialize(&policy).await.unwrap();
        assert_eq!(executor.partition_key_ranges().len(), 4);
    }

    #[tokio::test]
    async fn initialization_gives_up() {
        let store = MockStore::new(4).fail_range_fetches(5);
        let mut executor = BulkExecutor::new(Arc::new(store), "pk");

        let result = executor.initialize(&RetryPolicy::no_retries()).await;
        assert!(matches!(result, Err(ImportError::Store(_))));
    }

    #[tokio::test]
    async fn invalid_options_fail_the_run() {
        let mut executor = BulkExecutor::new(Arc::new(MockStore::new(1)), "pk");
        executor.initialize(&RetryPolicy::no_retries()).await.unwrap();

        let options = BulkImportOptions {
            max_concurrency_per_partition_key_range: Some(0),
            ..BulkImportOptions::default()
        };
        let result = executor
            .bulk_import(vertices(1), options, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ImportError::InvalidConfiguration(_))));
    }
}
