use std::ops::{Add, AddAssign};
use std::time::Duration;

use thiserror::Error;

use crate::element::GraphElement;

// Errors and result types handed back to callers of the bulk executor.

/// Errors that abort a whole import run. Everything else ends up in the response.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("bulk executor is not initialized")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid partition layout: {0}")]
    PartitionLayout(String),
    #[error("backing store error during initialization: {0}")]
    Store(#[from] StoreError),
    #[error("input stream failed: {0}")]
    Input(anyhow::Error),
}

/// Request level errors returned by a backing store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("request rate is too large")]
    Throttled { retry_after: Option<Duration> },
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Throttled { retry_after } => *retry_after,
            StoreError::Unavailable(_) => None,
        }
    }
}

impl From<StoreError> for ElementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Throttled { retry_after } => ElementError::Throttled { retry_after },
            StoreError::Unavailable(message) => ElementError::StoreUnavailable(message),
        }
    }
}

/// Why a single element was not imported.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElementError {
    #[error("invalid partition key: {0}")]
    InvalidPartitionKey(String),
    #[error("malformed element: {0}")]
    MalformedElement(String),
    #[error("request was throttled")]
    Throttled { retry_after: Option<Duration> },
    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<ElementError>,
    },
    #[error("an element with the same id already exists")]
    Conflict,
    #[error("import was cancelled")]
    Cancelled,
}

/// Capacity consumed by the backing store, kept in thousandths of a unit so
/// that sums do not depend on the order they are added in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestUnits(u64);

impl RequestUnits {
    pub const ZERO: RequestUnits = RequestUnits(0);

    pub fn from_f64(units: f64) -> Self {
        if units.is_finite() && units > 0.0 {
            RequestUnits((units * 1000.0).round() as u64)
        } else {
            RequestUnits::ZERO
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        RequestUnits(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl Add for RequestUnits {
    type Output = RequestUnits;

    fn add(self, rhs: RequestUnits) -> RequestUnits {
        RequestUnits(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for RequestUnits {
    fn add_assign(&mut self, rhs: RequestUnits) {
        *self = *self + rhs;
    }
}

/// An element that was rejected without being retried.
#[derive(Debug, Clone, PartialEq)]
pub struct BadInputElement {
    /// Position of the element in the input stream.
    pub sequence: u64,
    pub element: GraphElement,
    pub cause: ElementError,
}

/// Elements of one batch that could not be imported, grouped by cause.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkImportFailure {
    pub partition_key_range_id: String,
    pub batch_sequence: u64,
    pub cause: ElementError,
    pub documents_failed_to_import: Vec<GraphElement>,
    /// Input position of the first element in this group, used for ordering.
    pub first_sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkImportResponse {
    pub number_of_documents_imported: u64,
    pub total_request_units_consumed: RequestUnits,
    pub total_time_taken: Duration,
    pub number_of_batches_written: u64,
    pub total_retries: u64,
    pub failed_imports: Vec<BulkImportFailure>,
    pub bad_input_documents: Vec<BadInputElement>,
    pub cancelled: bool,
}

impl BulkImportResponse {
    pub fn failed_elements(&self) -> impl Iterator<Item = &GraphElement> {
        self.failed_imports
            .iter()
            .flat_map(|f| f.documents_failed_to_import.iter())
    }

    pub fn number_of_failed_documents(&self) -> usize {
        self.failed_imports
            .iter()
            .map(|f| f.documents_failed_to_import.len())
            .sum()
    }
}
