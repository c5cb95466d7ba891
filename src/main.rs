use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod async_utils;
mod aws;
mod cmd;
mod compress;
mod cpu_limit;
mod document;
mod geometry;
mod ledger;
mod ocr;
mod pdf;
mod prelude;
mod rate_limit;
mod retry;
mod searchable;
mod storage;
mod workflow;
mod workspace;

/// Turn scanned PDFs into searchable PDFs.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Pipeline:
  start-ocr -> process-ocr -> make-searchable -> compress

Environment Variables:
  - DDB_DOCUMENTS_TABLE: Ledger table (not needed with --local-root).
  - OUTPUT_BUCKET, OUTPUT_FINAL_BUCKET: Where results are stored.
  - ADD_WORD_BBOX, SHOW_CHARACTER: Debug overlays (default false).
  - PDF_IMAGE_DPI (default 120), PDF_COLOR_SPACE (RGB or GRAY).
  - SAVE_PAGE_IMAGES (default true).
  - COMPRESSION_STATE_MACHINE_ARN, FARGATE_SUBNETS: Compression hand-off.
    Without a state machine, compression runs as a child process.
  - TEXTRACT_MODE, TEXTRACT_FEATURES, TEXTRACT_SNS_TOPIC_ARN,
    TEXTRACT_SNS_ROLE_ARN: OCR job settings.
  - TEXTRACT_START_TPS, TEXTRACT_GET_TPS, TEXTRACT_MAX_CONCURRENT_JOBS,
    TEXTRACT_MAX_RETRIES, TEXTRACT_BASE_DELAY, TEXTRACT_MAX_DELAY: OCR
    throttling.
  - COMPRESSION_TIMEOUT_SECS (default 3600).

  Standard AWS environment variables and credential files are used
  for S3, DynamoDB, Textract, CloudWatch and Step Functions.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Register an uploaded document and start OCR on it.
    StartOcr(cmd::start_ocr::StartOcrOpts),
    /// Handle an OCR completion notification and store the results.
    ProcessOcr(cmd::process_ocr::ProcessOcrOpts),
    /// Build a searchable PDF from a document and its OCR results.
    MakeSearchable(cmd::make_searchable::MakeSearchableOpts),
    /// Compress a searchable PDF and publish it.
    Compress(cmd::compress::CompressOpts),
    /// Print per-page markdown from stored OCR results.
    ExtractText(cmd::extract_text::ExtractTextOpts),
    /// Show the latest ledger records for a document name.
    Lookup(cmd::lookup::LookupOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    // Standard output is reserved for the JSON we hand to the next stage.
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    match &opts.subcmd {
        Cmd::StartOcr(opts) => cmd::start_ocr::cmd_start_ocr(opts).await,
        Cmd::ProcessOcr(opts) => cmd::process_ocr::cmd_process_ocr(opts).await,
        Cmd::MakeSearchable(opts) => cmd::make_searchable::cmd_make_searchable(opts).await,
        Cmd::Compress(opts) => cmd::compress::cmd_compress(opts).await,
        Cmd::ExtractText(opts) => cmd::extract_text::cmd_extract_text(opts).await,
        Cmd::Lookup(opts) => cmd::lookup::cmd_lookup(opts).await,
    }
}
