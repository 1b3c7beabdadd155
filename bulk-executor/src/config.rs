use tokio::sync::Semaphore;

use crate::api::ImportError;
use crate::batch::{
    BatchLimits, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_COUNT,
    DEFAULT_MAX_IN_MEMORY_SORTING_BATCH_SIZE,
};
use crate::retry::RetryPolicy;
use crate::scheduler::{
    SchedulerLimits, DEFAULT_MAX_CONCURRENCY_PER_RANGE, DEFAULT_MAX_IN_FLIGHT_REQUESTS,
};
use crate::store::WriteMode;

/// Options for one `bulk_import` run. `None` means "use the engine default".
#[derive(Debug, Clone)]
pub struct BulkImportOptions {
    pub enable_upsert: bool,
    pub disable_automatic_id_generation: bool,
    pub max_concurrency_per_partition_key_range: Option<usize>,
    pub max_in_flight_requests: Option<usize>,
    pub max_in_memory_sorting_batch_size: Option<usize>,
    pub max_batch_count: Option<usize>,
    pub max_batch_bytes: Option<usize>,
    pub retry_policy: RetryPolicy,
}

impl Default for BulkImportOptions {
    fn default() -> Self {
        BulkImportOptions {
            enable_upsert: false,
            disable_automatic_id_generation: true,
            max_concurrency_per_partition_key_range: None,
            max_in_flight_requests: None,
            max_in_memory_sorting_batch_size: None,
            max_batch_count: None,
            max_batch_bytes: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

fn positive(name: &str, value: Option<usize>, default: usize) -> Result<usize, ImportError> {
    match value {
        Some(0) => Err(ImportError::InvalidConfiguration(format!(
            "{name} must be greater than zero"
        ))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

impl BulkImportOptions {
    pub fn write_mode(&self) -> WriteMode {
        if self.enable_upsert {
            WriteMode::Upsert
        } else {
            WriteMode::Insert
        }
    }

    pub fn batch_limits(&self) -> Result<BatchLimits, ImportError> {
        Ok(BatchLimits {
            max_count: positive("max_batch_count", self.max_batch_count, DEFAULT_MAX_BATCH_COUNT)?,
            max_bytes: positive("max_batch_bytes", self.max_batch_bytes, DEFAULT_MAX_BATCH_BYTES)?,
            max_buffered: positive(
                "max_in_memory_sorting_batch_size",
                self.max_in_memory_sorting_batch_size,
                DEFAULT_MAX_IN_MEMORY_SORTING_BATCH_SIZE,
            )?,
        })
    }

    pub fn scheduler_limits(&self) -> Result<SchedulerLimits, ImportError> {
        let per_range = positive(
            "max_concurrency_per_partition_key_range",
            self.max_concurrency_per_partition_key_range,
            DEFAULT_MAX_CONCURRENCY_PER_RANGE,
        )?;
        let global = positive(
            "max_in_flight_requests",
            self.max_in_flight_requests,
            DEFAULT_MAX_IN_FLIGHT_REQUESTS,
        )?;
        if global > Semaphore::MAX_PERMITS {
            return Err(ImportError::InvalidConfiguration(format!(
                "max_in_flight_requests must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(SchedulerLimits {
            per_range,
            global,
            queue_depth: per_range.saturating_mul(2).min(Semaphore::MAX_PERMITS),
        })
    }
}
