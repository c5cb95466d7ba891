//! The `make-searchable` subcommand.

use std::sync::Arc;

use clap::{ArgAction, Args, builder::BoolishValueParser};
use serde::Serialize;

use super::{BackendOpts, OcrResultMessage, print_json, read_json_input, run_stage};
use crate::{
    compress::CompressionJob,
    cpu_limit::cpu_permits,
    document::{DocumentContext, DocumentId},
    fields,
    ledger::{Ledger, LedgerStage},
    ocr::blocks::OcrBlocks,
    pdf::{
        overlay::OverlayOptions,
        raster::{ColorSpace, PdftocairoRenderer},
    },
    prelude::*,
    searchable::{PageImageSink, SearchablePdfBuilder, SearchablePdfOptions},
    storage::{BlobLocation, BlobMetadata, BlobStore},
    workflow::{CompressionHandoff, StepFunctionsLauncher, SubprocessLauncher, WorkflowLauncher},
    workspace::Workspace,
};

/// `make-searchable` command line arguments.
#[derive(Debug, Args)]
pub struct MakeSearchableOpts {
    /// The message printed by `process-ocr`, as JSON. Reads standard input
    /// unless the document is given with `--document-id` and friends.
    #[clap(value_name = "MESSAGE")]
    pub message_path: Option<PathBuf>,

    /// Document id, instead of a message.
    #[clap(long, requires_all = ["document_name", "original", "blocks"])]
    pub document_id: Option<DocumentId>,

    /// Document file name.
    #[clap(long, requires = "document_id")]
    pub document_name: Option<String>,

    /// Original PDF, as `s3://bucket/key`.
    #[clap(long, requires = "document_id")]
    pub original: Option<BlobLocation>,

    /// OCR block dump, as `s3://bucket/key`.
    #[clap(long, requires = "document_id")]
    pub blocks: Option<BlobLocation>,

    /// Bucket for the searchable PDF and page images.
    #[clap(long, env = "OUTPUT_BUCKET")]
    pub output_bucket: String,

    /// Bucket for the final compressed PDF. Defaults to the output bucket.
    #[clap(long, env = "OUTPUT_FINAL_BUCKET")]
    pub output_final_bucket: Option<String>,

    /// Outline each word's box, for checking OCR alignment.
    #[clap(long, env = "ADD_WORD_BBOX", value_parser = BoolishValueParser::new())]
    pub add_word_bbox: bool,

    /// Make the OCR text visible.
    #[clap(long = "show-characters", env = "SHOW_CHARACTER", value_parser = BoolishValueParser::new())]
    pub show_characters: bool,

    /// DPI for pages whose resolution cannot be estimated.
    #[clap(long, env = "PDF_IMAGE_DPI", default_value = "120")]
    pub fallback_dpi: u32,

    /// Color space for page images: RGB or GRAY.
    #[clap(long, env = "PDF_COLOR_SPACE", default_value = "GRAY")]
    pub color_space: ColorSpace,

    /// Keep each page image next to the PDF.
    #[clap(
        long,
        env = "SAVE_PAGE_IMAGES",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub save_page_images: bool,

    /// State machine that compresses the result. Without one, compression
    /// runs as a child process of this binary.
    #[clap(long, env = "COMPRESSION_STATE_MACHINE_ARN")]
    pub compression_state_machine_arn: Option<String>,

    /// Subnets for the compression task.
    #[clap(long, env = "FARGATE_SUBNETS", value_delimiter = ',')]
    pub subnets: Vec<String>,

    /// How many pages to render at once. Defaults to the number of CPUs.
    #[clap(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    #[clap(flatten)]
    pub backend: BackendOpts,
}

impl MakeSearchableOpts {
    async fn request(&self) -> Result<OcrResultMessage> {
        match (&self.document_id, &self.document_name, &self.original, &self.blocks) {
            (Some(id), Some(name), Some(original), Some(blocks)) => Ok(OcrResultMessage {
                document_id: id.clone(),
                document_name: name.clone(),
                original_document_s3: original.clone(),
                textract_output_s3: blocks.clone(),
            }),
            _ => read_json_input(self.message_path.as_deref()).await,
        }
    }

    fn options(&self) -> SearchablePdfOptions {
        SearchablePdfOptions {
            force_rasterization: true,
            overlay: OverlayOptions {
                add_word_bbox: self.add_word_bbox,
                show_characters: self.show_characters,
            },
            fallback_dpi: self.fallback_dpi,
            color_space: self.color_space,
            concurrency: self.jobs.unwrap_or_else(cpu_permits).max(1),
        }
    }
}

/// What we report once a searchable PDF exists.
#[derive(Debug, Serialize)]
pub struct MadeSearchable {
    pub document_id: DocumentId,
    pub output_s3: BlobLocation,
    pub page_count: u32,
    pub page_images_saved: u32,
    pub compression_execution_id: Option<String>,
}

/// The `make-searchable` stage, with its collaborators.
pub struct MakeSearchable {
    pub store: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn Ledger>,
    pub launcher: Arc<dyn WorkflowLauncher>,
    pub builder: SearchablePdfBuilder,
    pub options: SearchablePdfOptions,
    pub save_page_images: bool,
    pub output_bucket: String,
    pub output_final_bucket: Option<String>,
    pub subnets: Vec<String>,
}

impl MakeSearchable {
    /// Build and store the searchable PDF, then start compressing it.
    ///
    /// If building fails, the failure is recorded and nothing is written to
    /// the output key. A failed compression hand-off is only a warning.
    #[instrument(level = "info", skip_all, fields(document_id = %request.document_id))]
    pub async fn run(&self, request: &OcrResultMessage) -> Result<MadeSearchable> {
        let doc = request.document();
        let (output, page_count, page_images_saved) = run_stage(
            self.ledger.as_ref(),
            &doc,
            "make_searchable",
            LedgerStage::SelectablePdf,
            self.build(&doc, request),
        )
        .await?;
        let compression_execution_id = self.hand_off(&doc, &output).await;
        Ok(MadeSearchable {
            document_id: doc.document_id,
            output_s3: output,
            page_count,
            page_images_saved,
            compression_execution_id,
        })
    }

    async fn build(
        &self,
        doc: &DocumentContext,
        request: &OcrResultMessage,
    ) -> Result<(BlobLocation, u32, u32)> {
        let workspace = Workspace::create("searchable")?;
        let original_path = workspace.file("original.pdf");
        self.store
            .download_to(&request.original_document_s3, &original_path)
            .await?;
        let blocks = OcrBlocks::from_json(&self.store.get(&request.textract_output_s3).await?)
            .with_context(|| {
                format!("failed to load OCR blocks from {}", request.textract_output_s3)
            })?;

        let sink = self.save_page_images.then(|| PageImageSink {
            store: self.store.clone(),
            bucket: self.output_bucket.clone(),
        });
        let pdf = self
            .builder
            .build(&original_path, &blocks, &self.options, sink.as_ref(), doc)
            .await?;

        let output = BlobLocation::new(&self.output_bucket, doc.keys().uncompressed());
        self.store
            .put(&output, pdf.bytes, &BlobMetadata::with_content_type("application/pdf"))
            .await?;
        info!(%output, page_count = pdf.page_count, "Stored searchable PDF");

        self.ledger
            .record_stage(
                doc,
                LedgerStage::SelectablePdf,
                fields! {
                    "output_s3" => output.to_string(),
                    "page_count" => pdf.page_count,
                },
            )
            .await?;
        Ok((output, pdf.page_count, pdf.page_images_saved))
    }

    /// Start compression. Returns the execution id if it started.
    async fn hand_off(&self, doc: &DocumentContext, uncompressed: &BlobLocation) -> Option<String> {
        let job = CompressionJob {
            document_id: doc.document_id.clone(),
            document_name: doc.document_name.clone(),
            input_bucket: uncompressed.bucket.clone(),
            input_key: uncompressed.key.clone(),
            output_bucket: self.output_bucket.clone(),
            output_key: doc.keys().searchable(),
            output_final_bucket: self.output_final_bucket.clone(),
            output_final_key: None,
        };
        let handoff = CompressionHandoff::new(job, self.ledger.table_name(), &self.subnets);
        let execution_id = match self.launcher.start_compression(&handoff).await {
            Ok(execution_id) => execution_id,
            Err(err) => {
                warn!(document_id = %doc.document_id, "Could not start compression: {:#}", err);
                return None;
            }
        };
        info!(document_id = %doc.document_id, %execution_id, "Started compression");
        if let Err(err) = self
            .ledger
            .record_stage(
                doc,
                LedgerStage::CompressionStarted,
                fields! { "execution_id" => &execution_id },
            )
            .await
        {
            warn!(document_id = %doc.document_id, "{:#}", err);
        }
        Some(execution_id)
    }
}

/// The `make-searchable` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_make_searchable(opts: &MakeSearchableOpts) -> Result<()> {
    let request = opts.request().await?;
    let backends = opts.backend.connect().await?;
    let launcher: Arc<dyn WorkflowLauncher> = match &opts.compression_state_machine_arn {
        Some(arn) => StepFunctionsLauncher::new(arn).await?,
        None => Arc::new(SubprocessLauncher::new(opts.backend.local_root.as_deref())?),
    };
    let stage = MakeSearchable {
        store: backends.store,
        ledger: backends.ledger,
        launcher,
        builder: SearchablePdfBuilder::new(Arc::new(PdftocairoRenderer)),
        options: opts.options(),
        save_page_images: opts.save_page_images,
        output_bucket: opts.output_bucket.clone(),
        output_final_bucket: opts.output_final_bucket.clone(),
        subnets: opts.subnets.clone(),
    };
    let made = stage.run(&request).await?;
    print_json(&made)
}
