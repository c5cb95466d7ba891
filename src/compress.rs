//! The compression stage: shrink a searchable PDF with Ghostscript and
//! publish it.
//!
//! Large scans can take far longer to compress than the stage that built
//! them is allowed to run, so this runs as its own unit of work.

use std::{error, fmt, io, sync::Arc, time::Duration};

use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{process::Command, time::Instant};

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    document::{DocumentContext, DocumentId},
    fields,
    ledger::{Ledger, LedgerStage},
    prelude::*,
    storage::{BlobLocation, BlobMetadata, BlobStore},
    workspace::Workspace,
};

/// Default limit on one Ghostscript run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Ghostscript settings: "ebook" quality, color and gray images downsampled
/// to 150 DPI as JPEG, monochrome to 300 DPI as CCITT fax.
const GHOSTSCRIPT_ARGS: &[&str] = &[
    "-sDEVICE=pdfwrite",
    "-dCompatibilityLevel=1.4",
    "-dPDFSETTINGS=/ebook",
    "-dNOPAUSE",
    "-dQUIET",
    "-dBATCH",
    "-dDownsampleColorImages=true",
    "-dColorImageDownsampleType=/Bicubic",
    "-dColorImageResolution=150",
    "-dColorImageDownsampleThreshold=2.0",
    "-dColorImageFilter=/DCTEncode",
    "-dDownsampleGrayImages=true",
    "-dGrayImageDownsampleType=/Bicubic",
    "-dGrayImageResolution=150",
    "-dGrayImageDownsampleThreshold=2.0",
    "-dGrayImageFilter=/DCTEncode",
    "-dDownsampleMonoImages=true",
    "-dMonoImageDownsampleType=/Bicubic",
    "-dMonoImageResolution=300",
    "-dMonoImageFilter=/CCITTFaxEncode",
];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// What to compress and where to put it. Read from the environment when run
/// as a task, or passed as JSON in a workflow hand-off.
#[derive(Args, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CompressionJob {
    #[clap(long, env = "DOCUMENT_ID")]
    pub document_id: DocumentId,

    #[clap(long, env = "DOCUMENT_NAME")]
    pub document_name: String,

    /// Bucket holding the uncompressed PDF.
    #[clap(long, env = "INPUT_BUCKET")]
    pub input_bucket: String,

    #[clap(long, env = "INPUT_KEY")]
    pub input_key: String,

    /// Bucket for the compressed PDF, keyed by document.
    #[clap(long, env = "OUTPUT_BUCKET")]
    pub output_bucket: String,

    #[clap(long, env = "OUTPUT_KEY")]
    pub output_key: String,

    /// Bucket for the latest version of each document, keyed by name.
    /// Defaults to the output bucket.
    #[clap(long, env = "OUTPUT_FINAL_BUCKET")]
    pub output_final_bucket: Option<String>,

    /// Defaults to the document name.
    #[clap(long, env = "OUTPUT_FINAL_KEY")]
    pub output_final_key: Option<String>,
}

impl CompressionJob {
    pub fn document(&self) -> DocumentContext {
        DocumentContext::new(self.document_id.clone(), &self.document_name)
    }

    pub fn input(&self) -> BlobLocation {
        BlobLocation::new(&self.input_bucket, &self.input_key)
    }

    pub fn output(&self) -> BlobLocation {
        BlobLocation::new(&self.output_bucket, &self.output_key)
    }

    pub fn final_output(&self) -> BlobLocation {
        BlobLocation::new(
            self.output_final_bucket
                .as_deref()
                .unwrap_or(&self.output_bucket),
            self.output_final_key
                .clone()
                .unwrap_or_else(|| self.document().keys().final_key()),
        )
    }
}

/// Where a compression run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionState {
    Pending,
    Downloading,
    Compressing,
    Uploading,
    Done,
    Failed,
}

impl CompressionState {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionState::Pending => "pending",
            CompressionState::Downloading => "downloading",
            CompressionState::Compressing => "compressing",
            CompressionState::Uploading => "uploading",
            CompressionState::Done => "done",
            CompressionState::Failed => "failed",
        }
    }
}

impl fmt::Display for CompressionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a compressor failed.
#[derive(Debug)]
pub enum CompressionError {
    /// The tool ran too long and was killed.
    Timeout { after: Duration },
    /// The tool ran but reported failure.
    ToolFailed(String),
    /// We couldn't run the tool at all.
    Io(io::Error),
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::Timeout { after } => {
                write!(f, "compression timed out after {} seconds", after.as_secs())
            }
            CompressionError::ToolFailed(msg) => write!(f, "compression failed: {}", msg),
            CompressionError::Io(err) => write!(f, "could not run compressor: {}", err),
        }
    }
}

impl error::Error for CompressionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CompressionError::Io(err) => Some(err),
            CompressionError::Timeout { .. } | CompressionError::ToolFailed(_) => None,
        }
    }
}

/// Lossy PDF compression.
#[async_trait]
pub trait PdfCompressor: Send + Sync + 'static {
    async fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressionError>;
}

/// Compresses with Ghostscript's `pdfwrite` device.
#[derive(Debug, Clone)]
pub struct GhostscriptCompressor {
    program: String,
    timeout: Duration,
}

impl GhostscriptCompressor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "gs".to_owned(),
            timeout,
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl PdfCompressor for GhostscriptCompressor {
    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(GHOSTSCRIPT_ARGS)
            .arg(format!("-sOutputFile={}", output.display()))
            .arg(input)
            // Dropping the future on timeout kills Ghostscript.
            .kill_on_drop(true);

        let outcome = with_cpu_semaphore(|| async {
            Ok(tokio::time::timeout(self.timeout, cmd.output()).await)
        })
        .await
        .map_err(|err| CompressionError::ToolFailed(format!("{err:#}")))?;
        match outcome {
            Err(_) => Err(CompressionError::Timeout {
                after: self.timeout,
            }),
            Ok(Err(err)) => Err(CompressionError::Io(err)),
            Ok(Ok(output)) => check_for_command_failure(&self.program, &output, None)
                .map_err(|err| CompressionError::ToolFailed(format!("{err:#}"))),
        }
    }
}

/// Size and timing of one compression.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompressionStats {
    pub duration_seconds: f64,
    pub input_size_mb: f64,
    pub output_size_mb: f64,
    /// Input size over output size, or 0 if the output is empty.
    pub compression_ratio: f64,
    /// May be negative: already-minimal PDFs can grow.
    pub space_saved_mb: f64,
    pub space_saved_percent: f64,
}

impl CompressionStats {
    pub fn new(input_bytes: u64, output_bytes: u64, duration: Duration) -> Self {
        let input_size_mb = input_bytes as f64 / BYTES_PER_MB;
        let output_size_mb = output_bytes as f64 / BYTES_PER_MB;
        let space_saved_mb = input_size_mb - output_size_mb;
        Self {
            duration_seconds: duration.as_secs_f64(),
            input_size_mb,
            output_size_mb,
            compression_ratio: if output_bytes == 0 {
                0.0
            } else {
                input_size_mb / output_size_mb
            },
            space_saved_mb,
            space_saved_percent: if input_bytes == 0 {
                0.0
            } else {
                space_saved_mb / input_size_mb * 100.0
            },
        }
    }
}

/// Downloads, compresses and publishes one PDF, and records the outcome.
pub struct CompressionOrchestrator {
    store: Arc<dyn BlobStore>,
    ledger: Arc<dyn Ledger>,
    compressor: Arc<dyn PdfCompressor>,
}

impl CompressionOrchestrator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        ledger: Arc<dyn Ledger>,
        compressor: Arc<dyn PdfCompressor>,
    ) -> Self {
        Self {
            store,
            ledger,
            compressor,
        }
    }

    /// Run a job to completion. The outcome is always written to the ledger,
    /// and the scratch files are always removed.
    #[instrument(level = "info", skip_all, fields(document_id = %job.document_id))]
    pub async fn run(&self, job: &CompressionJob) -> Result<CompressionStats> {
        let doc = job.document();
        let mut state = CompressionState::Pending;
        let result = match Workspace::create("compress") {
            Ok(workspace) => self.run_in(&workspace, job, &doc, &mut state).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(stats) => {
                info!(
                    ratio = stats.compression_ratio,
                    saved_mb = stats.space_saved_mb,
                    "Compression complete"
                );
                let record = fields! {
                    "status" => "success",
                    "compression_stats" => stats,
                };
                self.ledger
                    .record_stage(&doc, LedgerStage::CompressionComplete, record)
                    .await?;
                Ok(stats)
            }
            Err(err) => {
                let failed_during = state;
                error!(%failed_during, "Compression failed: {:#}", err);
                let mut record = fields! {
                    "status" => "failed",
                    "error" => format!("{err:#}"),
                };
                record.insert("failed_during".to_owned(), Value::from(failed_during.as_str()));
                if let Err(ledger_err) = self
                    .ledger
                    .record_stage(&doc, LedgerStage::CompressionComplete, record)
                    .await
                {
                    error!("Could not record compression failure: {:#}", ledger_err);
                }
                Err(err)
            }
        }
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        job: &CompressionJob,
        doc: &DocumentContext,
        state: &mut CompressionState,
    ) -> Result<CompressionStats> {
        let input_path = workspace.file("input.pdf");
        let output_path = workspace.file("compressed.pdf");

        *state = CompressionState::Downloading;
        let input = job.input();
        debug!(%state, %input, "Compression state");
        self.store.download_to(&input, &input_path).await?;
        let input_bytes = tokio::fs::metadata(&input_path).await?.len();

        *state = CompressionState::Compressing;
        debug!(%state, input_bytes, "Compression state");
        let started = Instant::now();
        self.compressor
            .compress(&input_path, &output_path)
            .await
            .with_context(|| format!("failed to compress {input}"))?;
        let duration = started.elapsed();
        let output_bytes = tokio::fs::metadata(&output_path)
            .await
            .context("compressor produced no output")?
            .len();

        *state = CompressionState::Uploading;
        debug!(%state, output_bytes, "Compression state");
        let metadata = BlobMetadata::with_content_type("application/pdf")
            .insert("document_id", &doc.document_id)
            .insert("original_size_mb", input_bytes as f64 / BYTES_PER_MB);
        for location in [job.output(), job.final_output()] {
            self.store
                .upload_from(&location, &output_path, &metadata)
                .await?;
            info!(%location, "Uploaded compressed PDF");
        }

        *state = CompressionState::Done;
        Ok(CompressionStats::new(input_bytes, output_bytes, duration))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        ledger::LocalLedger,
        storage::LocalBlobStore,
    };

    /// Writes the first half of the input, or fails the way it's told to.
    struct FakeCompressor {
        failure: Mutex<Option<CompressionError>>,
    }

    impl FakeCompressor {
        fn ok() -> Self {
            Self {
                failure: Mutex::new(None),
            }
        }

        fn failing(err: CompressionError) -> Self {
            Self {
                failure: Mutex::new(Some(err)),
            }
        }
    }

    #[async_trait]
    impl PdfCompressor for FakeCompressor {
        async fn compress(&self, input: &Path, output: &Path) -> Result<(), CompressionError> {
            if let Some(err) = self.failure.lock().unwrap().take() {
                return Err(err);
            }
            let data = tokio::fs::read(input).await.map_err(CompressionError::Io)?;
            tokio::fs::write(output, &data[..data.len() / 2])
                .await
                .map_err(CompressionError::Io)
        }
    }

    fn job() -> CompressionJob {
        CompressionJob {
            document_id: "20250101T000000-000001-abcdef12".parse().unwrap(),
            document_name: "scan.pdf".to_owned(),
            input_bucket: "processed".to_owned(),
            input_key: "20250101T000000-000001-abcdef12/uncompressed_scan.pdf".to_owned(),
            output_bucket: "processed".to_owned(),
            output_key: "20250101T000000-000001-abcdef12/scan.pdf".to_owned(),
            output_final_bucket: Some("final".to_owned()),
            output_final_key: None,
        }
    }

    async fn setup(
        root: &Path,
        compressor: FakeCompressor,
    ) -> Result<(CompressionOrchestrator, Arc<LocalLedger>, Arc<LocalBlobStore>)> {
        let store = Arc::new(LocalBlobStore::new(root));
        let ledger = Arc::new(LocalLedger::new(root));
        store
            .put(&job().input(), vec![7u8; 4 * 1024 * 1024], &BlobMetadata::default())
            .await?;
        let orchestrator =
            CompressionOrchestrator::new(store.clone(), ledger.clone(), Arc::new(compressor));
        Ok((orchestrator, ledger, store))
    }

    #[test]
    fn stats_are_consistent() {
        let stats = CompressionStats::new(4 * 1024 * 1024, 1024 * 1024, Duration::from_millis(1500));
        assert_eq!(stats.input_size_mb, 4.0);
        assert_eq!(stats.output_size_mb, 1.0);
        assert_eq!(stats.compression_ratio, 4.0);
        assert_eq!(stats.space_saved_mb, stats.input_size_mb - stats.output_size_mb);
        assert_eq!(stats.space_saved_percent, 75.0);
        assert_eq!(stats.duration_seconds, 1.5);

        let grew = CompressionStats::new(1024 * 1024, 2 * 1024 * 1024, Duration::ZERO);
        assert_eq!(grew.space_saved_mb, -1.0);
        assert_eq!(grew.space_saved_percent, -100.0);

        let empty = CompressionStats::new(0, 0, Duration::ZERO);
        assert_eq!(empty.compression_ratio, 0.0);
        assert_eq!(empty.space_saved_percent, 0.0);
    }

    #[test]
    fn final_destination_defaults() {
        let mut job = job();
        assert_eq!(job.final_output(), BlobLocation::new("final", "scan.pdf"));
        job.output_final_bucket = None;
        job.output_final_key = Some("latest/scan.pdf".to_owned());
        assert_eq!(job.final_output(), BlobLocation::new("processed", "latest/scan.pdf"));
    }

    #[tokio::test]
    async fn publishes_to_both_destinations() -> Result<()> {
        let root = tempfile::TempDir::with_prefix("compress")?;
        let (orchestrator, ledger, store) = setup(root.path(), FakeCompressor::ok()).await?;

        let stats = orchestrator.run(&job()).await?;
        assert_eq!(stats.input_size_mb, 4.0);
        assert_eq!(stats.output_size_mb, 2.0);
        assert_eq!(stats.space_saved_mb, stats.input_size_mb - stats.output_size_mb);

        assert!(store.exists(&job().output()).await?);
        assert!(store.exists(&BlobLocation::new("final", "scan.pdf")).await?);

        let entry = ledger.get(&job().document()).await?.unwrap();
        let record = entry.stage(LedgerStage::CompressionComplete).unwrap();
        assert_eq!(record["status"], "success");
        assert_eq!(record["compression_stats"]["compression_ratio"], 2.0);
        Ok(())
    }

    #[tokio::test]
    async fn timeouts_are_reported_distinctly() -> Result<()> {
        let root = tempfile::TempDir::with_prefix("compress")?;
        let timeout = CompressionError::Timeout {
            after: Duration::from_secs(3600),
        };
        let (orchestrator, ledger, store) =
            setup(root.path(), FakeCompressor::failing(timeout)).await?;

        let err = orchestrator.run(&job()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompressionError>(),
            Some(CompressionError::Timeout { .. })
        ));
        assert!(!store.exists(&job().output()).await?);

        let entry = ledger.get(&job().document()).await?.unwrap();
        let record = entry.stage(LedgerStage::CompressionComplete).unwrap();
        assert_eq!(record["status"], "failed");
        assert_eq!(record["failed_during"], "compressing");
        assert!(record["error"].as_str().unwrap().contains("timed out after 3600 seconds"));
        Ok(())
    }

    #[tokio::test]
    async fn tool_failures_are_recorded() -> Result<()> {
        let root = tempfile::TempDir::with_prefix("compress")?;
        let failure = CompressionError::ToolFailed("gs exited with code 1".to_owned());
        let (orchestrator, ledger, _) = setup(root.path(), FakeCompressor::failing(failure)).await?;

        let err = orchestrator.run(&job()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompressionError>(),
            Some(CompressionError::ToolFailed(_))
        ));
        let entry = ledger.get(&job().document()).await?.unwrap();
        assert_eq!(entry.stage(LedgerStage::CompressionComplete).unwrap()["status"], "failed");
        Ok(())
    }

    #[tokio::test]
    async fn missing_input_fails_while_downloading() -> Result<()> {
        let root = tempfile::TempDir::with_prefix("compress")?;
        let store = Arc::new(LocalBlobStore::new(root.path()));
        let ledger = Arc::new(LocalLedger::new(root.path()));
        let orchestrator =
            CompressionOrchestrator::new(store, ledger.clone(), Arc::new(FakeCompressor::ok()));

        assert!(orchestrator.run(&job()).await.is_err());
        let entry = ledger.get(&job().document()).await?.unwrap();
        let record = entry.stage(LedgerStage::CompressionComplete).unwrap();
        assert_eq!(record["failed_during"], "downloading");
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires Ghostscript"]
    async fn ghostscript_compresses_a_pdf() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("gs")?;
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");
        let pdf = crate::pdf::tests::test_pdf(&[(crate::pdf::tests::LETTER, 0, vec![])]);
        tokio::fs::write(&input, pdf).await?;
        GhostscriptCompressor::new(DEFAULT_TIMEOUT)
            .compress(&input, &output)
            .await?;
        assert!(tokio::fs::metadata(&output).await?.len() > 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_tool_is_an_io_error() {
        let dir = tempfile::TempDir::with_prefix("gs").unwrap();
        let err = GhostscriptCompressor::new(DEFAULT_TIMEOUT)
            .with_program("/nonexistent/gs")
            .compress(&dir.path().join("in.pdf"), &dir.path().join("out.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressionError::Io(_)));
    }
}
