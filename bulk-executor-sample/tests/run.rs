use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::Result;
use bulk_executor::ElementError;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use bulk_executor_sample::config::Config;
use bulk_executor_sample::generator::long_id;
use bulk_executor_sample::run::run;

static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    print_store: false,
    database_name: "graphdb".to_string(),
    collection_name: "graphcollection".to_string(),
    collection_partition_key: "pk".to_string(),
    collection_throughput: NonZeroU32::new(10_000_000).unwrap(),
    partition_count: 4,
    number_of_documents_to_import: 50,
    should_cleanup_on_start: true,
    should_cleanup_on_finish: false,
    max_concurrency_per_partition_key_range: None,
    max_in_memory_sorting_batch_size: None,
    dump_directory: PathBuf::from("."),
});

fn config(dump_directory: &tempfile::TempDir) -> Config {
    Config {
        dump_directory: dump_directory.path().to_path_buf(),
        ..DEFAULT_CONFIG.clone()
    }
}

#[tokio::test]
async fn it_imports_vertices_and_edges() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let report = run(config(&dir), CancellationToken::new()).await?;

    assert_eq!(report.vertices.number_of_documents_imported, 50);
    assert_eq!(report.edges.number_of_documents_imported, 49);
    assert_eq!(report.summary.inserted(), 99);
    assert!(report.vertices.failed_imports.is_empty());
    assert!(report.edges.failed_imports.is_empty());
    assert!(!report.vertices.cancelled);

    let bad = &report.vertices.bad_input_documents;
    assert_eq!(bad.len(), 1);
    assert_eq!(bad[0].element.id(), long_id());
    assert!(matches!(bad[0].cause, ElementError::MalformedElement(_)));

    let dumped = std::fs::read_to_string(dir.path().join("BadVertices.txt"))?;
    assert_eq!(dumped.lines().count(), 1);
    assert!(dumped.contains(&long_id()));
    assert!(!dir.path().join("FailedVertices.txt").exists());
    assert!(!dir.path().join("BadEdges.txt").exists());

    Ok(())
}

#[tokio::test]
async fn it_appends_to_existing_dumps() -> Result<()> {
    let dir = tempfile::tempdir()?;

    run(config(&dir), CancellationToken::new()).await?;
    run(config(&dir), CancellationToken::new()).await?;

    let dumped = std::fs::read_to_string(dir.path().join("BadVertices.txt"))?;
    assert_eq!(dumped.lines().count(), 2);

    Ok(())
}

#[tokio::test]
async fn it_accepts_everything_with_the_print_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        print_store: true,
        number_of_documents_to_import: 5,
        ..config(&dir)
    };

    let report = run(config, CancellationToken::new()).await?;

    assert_eq!(report.vertices.number_of_documents_imported, 6);
    assert_eq!(report.edges.number_of_documents_imported, 4);
    assert!(report.vertices.bad_input_documents.is_empty());
    assert!(!dir.path().join("BadVertices.txt").exists());

    Ok(())
}

#[tokio::test]
async fn it_stops_when_cancelled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = run(config(&dir), cancel).await?;

    assert!(report.vertices.cancelled);
    assert!(report.edges.cancelled);
    assert_eq!(report.summary.inserted(), 0);

    Ok(())
}

#[tokio::test]
async fn it_fails_without_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        partition_count: 0,
        ..config(&dir)
    };

    assert!(run(config, CancellationToken::new()).await.is_err());
}
