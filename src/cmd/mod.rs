//! Command-line entry points, one per pipeline stage.

use std::sync::Arc;

use clap::Args;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::AsyncReadExt as _;
use tracing::Instrument as _;

use crate::{
    document::{DocumentContext, DocumentId},
    ledger::{DEFAULT_NAME_INDEX, DynamoLedger, Ledger, LedgerStage, LocalLedger},
    prelude::*,
    storage::{BlobLocation, BlobStore, LocalBlobStore, S3BlobStore},
};

pub mod compress;
pub mod extract_text;
pub mod lookup;
pub mod make_searchable;
pub mod process_ocr;
pub mod start_ocr;

/// Where blobs and ledger records live.
#[derive(Debug, Clone, Args)]
pub struct BackendOpts {
    /// Use this directory instead of S3 and DynamoDB. Blobs are stored as
    /// `DIR/{bucket}/{key}` and ledger records under `DIR/_ledger`.
    #[clap(long, value_name = "DIR")]
    pub local_root: Option<PathBuf>,

    /// DynamoDB table holding the document ledger.
    #[clap(long, env = "DDB_DOCUMENTS_TABLE")]
    pub ledger_table: Option<String>,

    /// Ledger index on `document_name`.
    #[clap(long, env = "DDB_DOCUMENT_NAME_INDEX", default_value = DEFAULT_NAME_INDEX)]
    pub ledger_name_index: String,
}

/// Connected storage backends.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn Ledger>,
}

impl BackendOpts {
    pub async fn connect(&self) -> Result<Backends> {
        if let Some(root) = &self.local_root {
            debug!(root = %root.display(), "Using local backends");
            return Ok(Backends {
                store: Arc::new(LocalBlobStore::new(root)),
                ledger: Arc::new(LocalLedger::new(root)),
            });
        }
        let table = self.ledger_table.as_deref().ok_or_else(|| {
            anyhow!("--ledger-table or DDB_DOCUMENTS_TABLE is required without --local-root")
        })?;
        Ok(Backends {
            store: S3BlobStore::new().await?,
            ledger: DynamoLedger::new(table, &self.ledger_name_index).await?,
        })
    }
}

/// What `process-ocr` hands to `make-searchable`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OcrResultMessage {
    pub document_id: DocumentId,
    pub document_name: String,
    pub original_document_s3: BlobLocation,
    pub textract_output_s3: BlobLocation,
}

impl OcrResultMessage {
    pub fn document(&self) -> DocumentContext {
        DocumentContext::new(self.document_id.clone(), &self.document_name)
    }
}

/// Run one stage for one document inside its stage span. If the stage
/// fails, record the failure under `failure_stage` before returning the
/// error, so no document is left without a status.
pub async fn run_stage<T, Fut>(
    ledger: &dyn Ledger,
    doc: &DocumentContext,
    stage: &'static str,
    failure_stage: LedgerStage,
    body: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let span = doc.stage_span(stage);
    let result = body.instrument(span.span().clone()).await;
    match &result {
        Ok(_) => {
            span.record_outcome("success");
            if span.is_root() {
                info!(document_id = %doc.document_id, stage, "Stage finished");
            }
        }
        Err(err) => {
            span.record_outcome("failed");
            error!(
                document_id = %doc.document_id,
                stage,
                "Stage failed: {:#}",
                err
            );
            if let Err(ledger_err) = ledger.record_failure(doc, failure_stage, err).await {
                error!(
                    document_id = %doc.document_id,
                    "Could not record failure: {:#}",
                    ledger_err
                );
            }
        }
    }
    result
}

/// Read JSON from a file, or from standard input if `path` is `None` or `-`.
pub async fn read_json_input<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let data = match path {
        Some(path) if path != Path::new("-") => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?,
        _ => {
            let mut data = vec![];
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("failed to read standard input")?;
            data
        }
    };
    serde_json::from_slice(&data).context("failed to parse JSON input")
}

/// Print a value as one line of JSON on standard output.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_stages_leave_a_record() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("stage")?;
        let ledger = LocalLedger::new(dir.path());
        let doc = DocumentContext::new("d1".parse()?, "scan.pdf");

        let result = run_stage(&ledger, &doc, "test", LedgerStage::SelectablePdf, async {
            Err::<(), _>(anyhow!("boom"))
        })
        .await;
        assert!(result.is_err());

        let entry = ledger.get(&doc).await?.unwrap();
        assert_eq!(entry.stage(LedgerStage::SelectablePdf).unwrap()["error"], "boom");

        let ok = run_stage(&ledger, &doc, "test", LedgerStage::SelectablePdf, async { Ok(5) }).await?;
        assert_eq!(ok, 5);
        Ok(())
    }

    #[tokio::test]
    async fn reads_json_files() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("json")?;
        let path = dir.path().join("message.json");
        tokio::fs::write(
            &path,
            r#"{"document_id": "d1", "document_name": "a.pdf",
                "original_document_s3": {"bucket": "in", "key": "a.pdf"},
                "textract_output_s3": {"bucket": "out", "key": "d1/textract_output_blocks.json"}}"#,
        )
        .await?;
        let message: OcrResultMessage = read_json_input(Some(&path)).await?;
        assert_eq!(message.document().document_name, "a.pdf");
        assert_eq!(message.textract_output_s3.bucket, "out");
        Ok(())
    }
}
