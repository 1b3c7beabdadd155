pub mod aggregator;
pub mod api;
pub mod batch;
pub mod config;
pub mod element;
pub mod executor;
pub mod memory;
pub mod partition;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod throttle;
pub mod writer;

pub use api::{
    BadInputElement, BulkImportFailure, BulkImportResponse, ElementError, ImportError,
    RequestUnits, StoreError,
};
pub use config::BulkImportOptions;
pub use element::{Edge, GraphElement, ScalarValue, Vertex};
pub use executor::BulkExecutor;
pub use partition::PartitionKeyRange;
pub use retry::RetryPolicy;
pub use store::{BackingStore, WriteMode};
