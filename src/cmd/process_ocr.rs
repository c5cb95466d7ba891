//! The `process-ocr` subcommand.

use clap::Args;
use serde::Deserialize;
use serde_json::Value;

use super::{BackendOpts, OcrResultMessage, print_json, read_json_input, run_stage};
use crate::{
    document::{DocumentContext, document_name_from_key},
    fields,
    ledger::{Ledger, LedgerStage},
    ocr::textract::{OcrOpts, TextractClient},
    prelude::*,
    storage::{BlobLocation, BlobMetadata, BlobStore},
};

/// `process-ocr` command line arguments.
#[derive(Debug, Args)]
pub struct ProcessOcrOpts {
    /// The job completion notification, as JSON. Reads standard input if
    /// omitted. A notification wrapped in a topic envelope is unwrapped.
    #[clap(value_name = "NOTIFICATION")]
    pub notification_path: Option<PathBuf>,

    /// Bucket for the OCR block dump.
    #[clap(long, env = "OUTPUT_BUCKET")]
    pub output_bucket: String,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// A job completion notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobNotification {
    pub job_id: String,
    pub status: String,
    /// The document id we passed when starting the job.
    pub job_tag: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub document_location: NotificationLocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationLocation {
    #[serde(rename = "S3Bucket")]
    pub bucket: String,
    #[serde(rename = "S3ObjectName")]
    pub key: String,
}

impl JobNotification {
    /// Parse a notification, unwrapping `{"Message": "..."}` and
    /// `{"Records": [{"Sns": {"Message": "..."}}]}` envelopes.
    pub fn from_value(value: Value) -> Result<Self> {
        if let Some(message) = value
            .pointer("/Records/0/Sns/Message")
            .or_else(|| value.get("Message"))
            .and_then(Value::as_str)
        {
            return serde_json::from_str(message)
                .context("failed to parse OCR notification inside envelope");
        }
        serde_json::from_value(value).context("failed to parse OCR notification")
    }

    pub fn succeeded(&self) -> bool {
        self.status == "SUCCEEDED"
    }

    pub fn document(&self) -> Result<DocumentContext> {
        Ok(DocumentContext::new(
            self.job_tag.parse()?,
            document_name_from_key(&self.document_location.key)?,
        ))
    }

    pub fn original(&self) -> BlobLocation {
        BlobLocation::new(&self.document_location.bucket, &self.document_location.key)
    }
}

/// Record a finished job, store its blocks, and build the message for the
/// next stage.
pub async fn process_ocr(
    store: &dyn BlobStore,
    ledger: &dyn Ledger,
    client: &TextractClient,
    notification: &JobNotification,
    output_bucket: &str,
) -> Result<OcrResultMessage> {
    let doc = notification.document()?;
    run_stage(
        ledger,
        &doc,
        "process_ocr",
        LedgerStage::TextractAsyncEnd,
        async {
            if !notification.succeeded() {
                return Err(anyhow!(
                    "OCR job {} finished with status {}",
                    notification.job_id,
                    notification.status
                ));
            }
            ledger
                .record_stage(
                    &doc,
                    LedgerStage::TextractAsyncEnd,
                    fields! {
                        "job_id" => &notification.job_id,
                        "status" => &notification.status,
                    },
                )
                .await?;

            let blocks = client.fetch_blocks(&notification.job_id).await?;
            let output = BlobLocation::new(output_bucket, doc.keys().ocr_blocks());
            store
                .put(
                    &output,
                    blocks.to_json()?,
                    &BlobMetadata::with_content_type("application/json"),
                )
                .await?;
            info!(
                document_id = %doc.document_id,
                blocks = blocks.len(),
                %output,
                "Stored OCR blocks"
            );

            Ok(OcrResultMessage {
                document_id: doc.document_id.clone(),
                document_name: doc.document_name.clone(),
                original_document_s3: notification.original(),
                textract_output_s3: output,
            })
        },
    )
    .await
}

/// The `process-ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process_ocr(opts: &ProcessOcrOpts) -> Result<()> {
    let value: Value = read_json_input(opts.notification_path.as_deref()).await?;
    let notification = JobNotification::from_value(value)?;
    debug!(
        job_id = %notification.job_id,
        status = %notification.status,
        finished_at_ms = ?notification.timestamp,
        "Received OCR notification"
    );
    let backends = opts.backend.connect().await?;
    let client = TextractClient::new(&opts.ocr).await?;
    let message = process_ocr(
        backends.store.as_ref(),
        backends.ledger.as_ref(),
        &client,
        &notification,
        &opts.output_bucket,
    )
    .await?;
    print_json(&message)
}
