use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::aggregator::ResultAggregator;
use crate::batch::Batch;
use crate::partition::PartitionKeyRange;
use crate::writer::{BatchState, ThrottleAwareWriter};

pub const DEFAULT_MAX_CONCURRENCY_PER_RANGE: usize = 4;
pub const DEFAULT_MAX_IN_FLIGHT_REQUESTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    /// Batches of one range that may be in flight at once.
    pub per_range: usize,
    /// Batches in flight across all ranges.
    pub global: usize,
    /// Sealed batches waiting per range before dispatch blocks the producer.
    pub queue_depth: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        SchedulerLimits {
            per_range: DEFAULT_MAX_CONCURRENCY_PER_RANGE,
            global: DEFAULT_MAX_IN_FLIGHT_REQUESTS,
            queue_depth: DEFAULT_MAX_CONCURRENCY_PER_RANGE * 2,
        }
    }
}

/// Runs one worker per partition key range. Each worker dispatches its batches in the order they
/// were sealed, keeps at most `per_range` of them in flight and holds a global permit for every
/// request in flight. Batches sharing an id with a write in flight wait for it to finish.
pub struct Scheduler {
    senders: Vec<mpsc::Sender<Batch>>,
    index: HashMap<String, usize>,
    workers: JoinSet<()>,
    aggregator: Arc<ResultAggregator>,
}

impl Scheduler {
    pub fn start(
        ranges: &[PartitionKeyRange],
        writer: Arc<ThrottleAwareWriter>,
        aggregator: Arc<ResultAggregator>,
        limits: SchedulerLimits,
        cancel: CancellationToken,
    ) -> Self {
        let global = Arc::new(Semaphore::new(limits.global));
        let mut senders = Vec::with_capacity(ranges.len());
        let mut index = HashMap::with_capacity(ranges.len());
        let mut workers = JoinSet::new();

        for (i, range) in ranges.iter().enumerate() {
            let (tx, rx) = mpsc::channel(limits.queue_depth);
            senders.push(tx);
            index.insert(range.id.clone(), i);

            let worker = RangeWorker {
                range_id: range.id.clone(),
                writer: writer.clone(),
                aggregator: aggregator.clone(),
                global: global.clone(),
                per_range: limits.per_range,
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run(rx));
        }

        info!(
            ranges = ranges.len(),
            per_range = limits.per_range,
            global = limits.global,
            "started partition workers"
        );

        Scheduler {
            senders,
            index,
            workers,
            aggregator,
        }
    }

    /// Queue a sealed batch on its range's worker. Waits while that worker's queue is full.
    pub async fn dispatch(&self, batch: Batch) -> bool {
        let Some(&i) = self.index.get(&batch.range().id) else {
            error!(range = %batch.range().id, "batch for unknown partition key range");
            return false;
        };
        trace!(
            range = %batch.range().id,
            sequence = batch.sequence(),
            state = ?BatchState::Assembled,
            "queueing batch"
        );
        self.senders[i].send(batch).await.is_ok()
    }

    /// Close every queue and wait until all dispatched batches reached a terminal state.
    pub async fn finish(mut self) -> Arc<ResultAggregator> {
        self.senders.clear();

        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                error!("partition worker failed: {:?}", err);
            }
        }

        self.aggregator
    }
}

struct RangeWorker {
    range_id: String,
    writer: Arc<ThrottleAwareWriter>,
    aggregator: Arc<ResultAggregator>,
    global: Arc<Semaphore>,
    per_range: usize,
    cancel: CancellationToken,
}

impl RangeWorker {
    async fn run(self, mut rx: mpsc::Receiver<Batch>) {
        let mut writes: JoinSet<Vec<String>> = JoinSet::new();
        // ids of documents in batches that are still being written
        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut dispatched = 0u64;
        let mut skipped = 0u64;

        while let Some(batch) = rx.recv().await {
            if self.cancel.is_cancelled() {
                skipped += 1;
                continue;
            }

            let ids: Vec<String> = batch.documents().iter().map(|d| d.id.clone()).collect();
            // A batch waits for earlier writes of the same ids, so a retried write can never
            // land after a later one.
            while writes.len() >= self.per_range || overlaps(&ids, &pending) {
                match writes.join_next().await {
                    Some(res) => self.completed(res, &mut pending),
                    None => break,
                }
            }

            let Ok(global) = self.global.clone().acquire_owned().await else {
                break;
            };
            // permits can take a while, check again before sending anything
            if self.cancel.is_cancelled() {
                skipped += 1;
                continue;
            }

            trace!(
                range = %self.range_id,
                sequence = batch.sequence(),
                state = ?BatchState::Dispatched,
                "dispatching batch"
            );
            dispatched += 1;
            for id in &ids {
                *pending.entry(id.clone()).or_default() += 1;
            }

            let writer = self.writer.clone();
            let aggregator = self.aggregator.clone();
            let cancel = self.cancel.clone();
            writes.spawn(async move {
                let outcome = writer.write(batch, &cancel).await;
                aggregator.record(outcome);
                drop(global);
                ids
            });
        }

        while let Some(res) = writes.join_next().await {
            self.completed(res, &mut pending);
        }

        debug!(
            range = %self.range_id,
            dispatched,
            skipped,
            "partition worker drained"
        );
    }

    fn completed(
        &self,
        res: Result<Vec<String>, JoinError>,
        pending: &mut HashMap<String, usize>,
    ) {
        let ids = match res {
            Ok(ids) => ids,
            Err(err) => {
                error!(range = %self.range_id, "batch write failed: {:?}", err);
                return;
            }
        };
        for id in ids {
            if let Entry::Occupied(mut entry) = pending.entry(id) {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
        }
    }
}

fn overlaps(ids: &[String], pending: &HashMap<String, usize>) -> bool {
    ids.iter().any(|id| pending.contains_key(id))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::element::{Document, GraphElement, Vertex};
    use crate::retry::RetryPolicy;
    use crate::store::{MockBackingStore, MockStore, StoreResponse, WriteMode};

    fn batch(range: &PartitionKeyRange, sequence: u64, ids: &[&str]) -> Batch {
        let documents = ids
            .iter()
            .map(|id| {
                let mut v = Vertex::new(*id, "vertex");
                v.add_property("pk", 1);
                Document::new(0, GraphElement::from(v), "pk").unwrap()
            })
            .collect();
        Batch::new(range.clone(), sequence, documents)
    }

    fn start(store: &MockStore, limits: SchedulerLimits, cancel: CancellationToken) -> Scheduler {
        let writer = Arc::new(ThrottleAwareWriter::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
            WriteMode::Upsert,
        ));
        let ranges = PartitionKeyRange::split_evenly(3);
        Scheduler::start(
            &ranges,
            writer,
            Arc::new(ResultAggregator::default()),
            limits,
            cancel,
        )
    }

    #[tokio::test]
    async fn batches_of_a_range_are_dispatched_in_order() {
        let store = MockStore::new(3);
        let limits = SchedulerLimits {
            per_range: 1,
            ..SchedulerLimits::default()
        };
        let scheduler = start(&store, limits, CancellationToken::new());
        let range = PartitionKeyRange::split_evenly(3).remove(1);

        for i in 0..5u64 {
            let id = i.to_string();
            assert!(scheduler.dispatch(batch(&range, i, &[id.as_str()])).await);
        }
        let response = scheduler.finish().await.finalize(Duration::ZERO, false);

        assert_eq!(response.number_of_batches_written, 5);
        let order: Vec<String> = store.calls().into_iter().map(|c| c.ids[0].clone()).collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn global_bound_holds_across_ranges() {
        let store = MockStore::new(3).latency(Duration::from_millis(20));
        let limits = SchedulerLimits {
            per_range: 4,
            global: 2,
            queue_depth: 8,
        };
        let scheduler = start(&store, limits, CancellationToken::new());
        let ranges = PartitionKeyRange::split_evenly(3);

        for i in 0..12u64 {
            let range = &ranges[(i % 3) as usize];
            let id = i.to_string();
            assert!(scheduler.dispatch(batch(range, i / 3, &[id.as_str()])).await);
        }
        let response = scheduler.finish().await.finalize(Duration::ZERO, false);

        assert_eq!(response.number_of_documents_imported, 12);
        assert!(store.max_in_flight() <= 2, "{}", store.max_in_flight());
    }

    #[tokio::test]
    async fn per_range_bound_allows_pipelining() {
        let store = MockStore::new(3).latency(Duration::from_millis(20));
        let limits = SchedulerLimits {
            per_range: 3,
            global: 10,
            queue_depth: 8,
        };
        let scheduler = start(&store, limits, CancellationToken::new());
        let range = PartitionKeyRange::split_evenly(3).remove(0);

        for i in 0..9u64 {
            let id = i.to_string();
            assert!(scheduler.dispatch(batch(&range, i, &[id.as_str()])).await);
        }
        scheduler.finish().await;

        assert!(store.max_in_flight() <= 3);
        assert!(store.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn writes_of_the_same_id_never_overlap() {
        let store = MockStore::new(3).latency(Duration::from_millis(10));
        let limits = SchedulerLimits {
            per_range: 4,
            global: 10,
            queue_depth: 8,
        };
        let scheduler = start(&store, limits, CancellationToken::new());
        let range = PartitionKeyRange::split_evenly(3).remove(0);

        for i in 0..4u64 {
            assert!(scheduler.dispatch(batch(&range, i, &["x"])).await);
        }
        let response = scheduler.finish().await.finalize(Duration::ZERO, false);

        assert_eq!(response.number_of_documents_imported, 4);
        assert_eq!(store.calls().len(), 4);
        assert_eq!(store.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn a_panicking_write_does_not_stall_the_range() {
        let mut store = MockBackingStore::new();
        store.expect_write_batch().returning(|_, docs, _| {
            if docs[0].id == "boom" {
                panic!("store blew up");
            }
            Ok(StoreResponse::accepted(docs.len(), 1.0))
        });
        let writer = Arc::new(ThrottleAwareWriter::new(
            Arc::new(store),
            RetryPolicy::default(),
            WriteMode::Upsert,
        ));
        let ranges = PartitionKeyRange::split_evenly(1);
        let scheduler = Scheduler::start(
            &ranges,
            writer,
            Arc::new(ResultAggregator::default()),
            SchedulerLimits::default(),
            CancellationToken::new(),
        );

        for (i, id) in ["boom", "boom", "ok"].into_iter().enumerate() {
            assert!(scheduler.dispatch(batch(&ranges[0], i as u64, &[id])).await);
        }
        let response = scheduler.finish().await.finalize(Duration::ZERO, false);

        assert_eq!(response.number_of_documents_imported, 1);
        assert_eq!(response.number_of_batches_written, 1);
    }

    #[tokio::test]
    async fn unknown_ranges_are_refused() {
        let store = MockStore::new(3);
        let scheduler = start(&store, SchedulerLimits::default(), CancellationToken::new());
        let stray = PartitionKeyRange::new("nope", 0, 1);

        assert!(!scheduler.dispatch(batch(&stray, 0, &["x"])).await);
        scheduler.finish().await;
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn nothing_is_dispatched_after_cancellation() {
        let store = MockStore::new(3);
        let cancel = CancellationToken::new();
        let scheduler = start(&store, SchedulerLimits::default(), cancel.clone());
        let range = PartitionKeyRange::split_evenly(3).remove(2);

        cancel.cancel();
        scheduler.dispatch(batch(&range, 0, &["x"])).await;
        let response = scheduler.finish().await.finalize(Duration::ZERO, true);

        assert!(store.calls().is_empty());
        assert_eq!(response.number_of_batches_written, 0);
    }
}
