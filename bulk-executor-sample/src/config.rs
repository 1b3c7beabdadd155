use std::num::NonZeroU32;
use std::path::PathBuf;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Log documents instead of keeping them in the in-memory collection.
    #[envconfig(default = "false")]
    pub print_store: bool,
    #[envconfig(default = "graphdb")]
    pub database_name: String,
    #[envconfig(default = "graphcollection")]
    pub collection_name: String,
    #[envconfig(default = "pk")]
    pub collection_partition_key: String,
    /// Capacity units per second provisioned for the whole collection.
    #[envconfig(default = "100000")]
    pub collection_throughput: NonZeroU32,
    #[envconfig(default = "10")]
    pub partition_count: u32,
    #[envconfig(default = "1000")]
    pub number_of_documents_to_import: u64,

    #[envconfig(default = "false")]
    pub should_cleanup_on_start: bool,
    #[envconfig(default = "false")]
    pub should_cleanup_on_finish: bool,

    pub max_concurrency_per_partition_key_range: Option<usize>,
    pub max_in_memory_sorting_batch_size: Option<usize>,

    #[envconfig(default = ".")]
    pub dump_directory: PathBuf,
}
