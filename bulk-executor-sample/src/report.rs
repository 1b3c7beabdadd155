use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bulk_executor::{BulkImportResponse, GraphElement, RequestUnits};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

const RULE: &str = "---------------------------------------------------------------------";

/// Throughput of a vertex import followed by an edge import.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub vertices: u64,
    pub edges: u64,
    pub request_units: RequestUnits,
    pub elapsed: Duration,
}

impl Summary {
    pub fn new(vertices: &BulkImportResponse, edges: &BulkImportResponse) -> Self {
        Summary {
            vertices: vertices.number_of_documents_imported,
            edges: edges.number_of_documents_imported,
            request_units: vertices.total_request_units_consumed
                + edges.total_request_units_consumed,
            elapsed: vertices.total_time_taken + edges.total_time_taken,
        }
    }

    pub fn inserted(&self) -> u64 {
        self.vertices + self.edges
    }

    pub fn writes_per_second(&self) -> f64 {
        per_second(self.inserted() as f64, self.elapsed)
    }

    pub fn request_units_per_second(&self) -> f64 {
        per_second(self.request_units.as_f64(), self.elapsed)
    }

    pub fn average_request_units_per_insert(&self) -> f64 {
        match self.inserted() {
            0 => 0.0,
            n => self.request_units.as_f64() / n as f64,
        }
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary for batch")?;
        writeln!(f, "{RULE}")?;
        writeln!(
            f,
            "Inserted {} graph elements ({} vertices, {} edges) @ {:.0} writes/s, {:.0} RU/s in {:.3} sec",
            self.inserted(),
            self.vertices,
            self.edges,
            self.writes_per_second(),
            self.request_units_per_second(),
            self.elapsed.as_secs_f64(),
        )?;
        writeln!(
            f,
            "Average RU consumption per insert: {:.3}",
            self.average_request_units_per_insert()
        )?;
        write!(f, "{RULE}")
    }
}

/// Append one JSON document per element to `path`, creating the file if needed.
pub async fn create_error_dump<'a>(
    path: &Path,
    elements: impl IntoIterator<Item = &'a GraphElement>,
) -> Result<usize> {
    let mut buf = Vec::new();
    let mut count = 0;
    for element in elements {
        serde_json::to_writer(&mut buf, element)?;
        buf.push(b'\n');
        count += 1;
    }
    if count == 0 {
        return Ok(0);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(&buf).await?;
    file.flush().await?;

    info!(path = %path.display(), count, "wrote error dump");
    Ok(count)
}

/// Dump failed and bad-input elements of one import into `directory`.
pub async fn dump_response(
    directory: &Path,
    kind: &str,
    response: &BulkImportResponse,
) -> Result<()> {
    create_error_dump(
        &directory.join(format!("Failed{kind}.txt")),
        response.failed_elements(),
    )
    .await?;
    create_error_dump(
        &directory.join(format!("Bad{kind}.txt")),
        response.bad_input_documents.iter().map(|b| &b.element),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bulk_executor::Vertex;

    use super::*;

    fn response(imported: u64, request_units: f64, secs: u64) -> BulkImportResponse {
        BulkImportResponse {
            number_of_documents_imported: imported,
            total_request_units_consumed: RequestUnits::from_f64(request_units),
            total_time_taken: Duration::from_secs(secs),
            number_of_batches_written: 1,
            total_retries: 0,
            failed_imports: Vec::new(),
            bad_input_documents: Vec::new(),
            cancelled: false,
        }
    }

    #[test]
    fn summary_rates() {
        let summary = Summary::new(&response(30, 150.0, 1), &response(10, 50.0, 1));

        assert_eq!(summary.inserted(), 40);
        assert_eq!(summary.writes_per_second(), 20.0);
        assert_eq!(summary.request_units_per_second(), 100.0);
        assert_eq!(summary.average_request_units_per_insert(), 5.0);

        let text = summary.to_string();
        assert!(text.contains(
            "Inserted 40 graph elements (30 vertices, 10 edges) @ 20 writes/s, 100 RU/s in 2.000 sec"
        ));
        assert!(text.contains("Average RU consumption per insert: 5.000"));
    }

    #[test]
    fn empty_runs_do_not_divide_by_zero() {
        let summary = Summary::new(&response(0, 0.0, 0), &response(0, 0.0, 0));
        assert_eq!(summary.writes_per_second(), 0.0);
        assert_eq!(summary.average_request_units_per_insert(), 0.0);
    }

    #[tokio::test]
    async fn dumps_append_one_line_per_element() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BadVertices.txt");
        let elements: Vec<GraphElement> = vec![
            Vertex::new("a", "vertex").into(),
            Vertex::new("b", "vertex").into(),
        ];

        assert_eq!(create_error_dump(&path, &elements).await.unwrap(), 2);
        assert_eq!(create_error_dump(&path, &elements[..1]).await.unwrap(), 1);
        assert_eq!(create_error_dump(&path, std::iter::empty()).await.unwrap(), 0);

        let text = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = text
            .lines()
            .map(|line| serde_json::from_str::<GraphElement>(line).unwrap().id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn nothing_to_dump_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        dump_response(dir.path(), "Edges", &response(1, 1.0, 1))
            .await
            .unwrap();
        assert!(!dir.path().join("FailedEdges.txt").exists());
        assert!(!dir.path().join("BadEdges.txt").exists());
    }
}
