//! The `start-ocr` subcommand.

use clap::Args;
use serde::Serialize;
use serde_json::json;

use super::{BackendOpts, print_json, run_stage};
use crate::{
    document::{DocumentContext, DocumentId, decode_event_key, document_name_from_key},
    fields,
    ledger::{Ledger, LedgerStage},
    ocr::textract::{OcrOpts, TextractClient},
    prelude::*,
    storage::BlobLocation,
};

/// `start-ocr` command line arguments.
#[derive(Debug, Args)]
pub struct StartOcrOpts {
    /// Bucket holding the uploaded document.
    #[clap(long, env = "INPUT_BUCKET")]
    pub bucket: String,

    /// Key of the uploaded document, as it appears in the storage event
    /// (URL-encoded, with `+` for spaces).
    #[clap(long, env = "INPUT_KEY")]
    pub key: String,

    /// Who uploaded the document.
    #[clap(long, env = "USER_ID")]
    pub user_id: Option<String>,

    /// Where the upload came from.
    #[clap(long, env = "USER_IP")]
    pub user_ip: Option<String>,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// What we print once the OCR job is running.
#[derive(Debug, Serialize)]
struct StartedOcr {
    document_id: DocumentId,
    document_name: String,
    job_id: String,
}

/// Register a new document and submit it for OCR.
pub async fn start_ocr(
    ledger: &dyn Ledger,
    client: &TextractClient,
    location: &BlobLocation,
    user_id: Option<&str>,
    user_ip: Option<&str>,
) -> Result<(DocumentContext, String)> {
    let doc = DocumentContext::new(
        DocumentId::generate(),
        document_name_from_key(&location.key)?,
    );
    let job_id = run_stage(
        ledger,
        &doc,
        "start_ocr",
        LedgerStage::TextractAsyncStart,
        async {
            ledger
                .upsert_attribute(
                    &doc,
                    LedgerStage::DocumentS3.as_str(),
                    json!({ "bucket": location.bucket, "key": location.key }),
                )
                .await?;
            ledger
                .record_stage(
                    &doc,
                    LedgerStage::DocumentPutEvent,
                    fields! { "user_id" => user_id, "user_ip" => user_ip },
                )
                .await?;

            let job_id = client
                .start_job(location, doc.document_id.as_str())
                .await
                .with_context(|| format!("failed to start OCR for {location}"))?;
            info!(document_id = %doc.document_id, %job_id, "Started OCR job");

            ledger
                .record_stage(
                    &doc,
                    LedgerStage::TextractAsyncStart,
                    fields! { "job_id" => &job_id },
                )
                .await?;
            Ok(job_id)
        },
    )
    .await?;
    Ok((doc, job_id))
}

/// The `start-ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(bucket = %opts.bucket, key = %opts.key))]
pub async fn cmd_start_ocr(opts: &StartOcrOpts) -> Result<()> {
    let backends = opts.backend.connect().await?;
    let client = TextractClient::new(&opts.ocr).await?;
    let location = BlobLocation::new(&opts.bucket, decode_event_key(&opts.key)?);
    let (doc, job_id) = start_ocr(
        backends.ledger.as_ref(),
        &client,
        &location,
        opts.user_id.as_deref(),
        opts.user_ip.as_deref(),
    )
    .await?;
    print_json(&StartedOcr {
        document_id: doc.document_id,
        document_name: doc.document_name,
        job_id,
    })
}
