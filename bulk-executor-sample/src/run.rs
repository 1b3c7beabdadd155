use std::sync::Arc;

use anyhow::{Context, Result};
use bulk_executor::memory::InMemoryStore;
use bulk_executor::store::PrintStore;
use bulk_executor::{BackingStore, BulkExecutor, BulkImportOptions, BulkImportResponse, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::generator::{generate_edges, generate_vertices};
use crate::report::{dump_response, Summary};

pub struct RunReport {
    pub vertices: BulkImportResponse,
    pub edges: BulkImportResponse,
    pub summary: Summary,
}

/// Import the generated vertices, then the edges between them, and dump whatever did not make it.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<RunReport> {
    info!(
        collection = %format!("{}.{}", config.database_name, config.collection_name),
        partition_key = %config.collection_partition_key,
        partitions = config.partition_count,
        print_store = config.print_store,
        "starting bulk import"
    );

    let memory = if config.print_store {
        None
    } else {
        Some(Arc::new(
            InMemoryStore::new(config.partition_count)
                .with_throughput(config.collection_throughput),
        ))
    };
    let store: Arc<dyn BackingStore + Send + Sync> = match &memory {
        Some(memory) => memory.clone(),
        None => Arc::new(PrintStore::new(config.partition_count)),
    };

    if config.should_cleanup_on_start {
        cleanup(memory.as_deref());
    }

    let mut executor = BulkExecutor::new(store, config.collection_partition_key.clone());
    executor
        .initialize(&RetryPolicy::initialization())
        .await
        .context("failed to initialize the bulk executor")?;

    let options = BulkImportOptions {
        enable_upsert: true,
        disable_automatic_id_generation: true,
        max_concurrency_per_partition_key_range: config.max_concurrency_per_partition_key_range,
        max_in_memory_sorting_batch_size: config.max_in_memory_sorting_batch_size,
        ..BulkImportOptions::default()
    };

    let vertices = executor
        .bulk_import(
            generate_vertices(
                config.number_of_documents_to_import,
                &config.collection_partition_key,
            ),
            options.clone(),
            cancel.clone(),
        )
        .await
        .context("vertex import failed")?;
    let edges = executor
        .bulk_import(
            generate_edges(config.number_of_documents_to_import),
            options,
            cancel.clone(),
        )
        .await
        .context("edge import failed")?;
    if cancel.is_cancelled() {
        warn!("import was cancelled, results are partial");
    }

    dump_response(&config.dump_directory, "Vertices", &vertices).await?;
    dump_response(&config.dump_directory, "Edges", &edges).await?;

    if config.should_cleanup_on_finish {
        cleanup(memory.as_deref());
    }

    let summary = Summary::new(&vertices, &edges);
    Ok(RunReport {
        vertices,
        edges,
        summary,
    })
}

fn cleanup(memory: Option<&InMemoryStore>) {
    match memory {
        Some(memory) => {
            info!(documents = memory.len(), "clearing collection");
            memory.clear();
        }
        None => info!("print store keeps nothing, skipping cleanup"),
    }
}
