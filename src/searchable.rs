//! Building a searchable PDF from an original and its OCR blocks.
//!
//! Every page is re-rendered as an image at its estimated scan resolution,
//! and the OCR words are laid over it as text. The result looks like the
//! original but can be searched and selected.

use std::sync::Arc;

use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    document::{DocumentContext, now_timestamp},
    ocr::blocks::OcrBlocks,
    pdf::{
        PageSize, SourcePdf,
        dpi::estimate_page_dpi,
        overlay::{OverlayOptions, TextOverlayEngine},
        raster::{ColorSpace, ImagePdf, PageRaster, PageRenderer},
    },
    prelude::*,
    storage::{BlobLocation, BlobMetadata, BlobStore},
};

/// How to build a searchable PDF.
#[derive(Debug, Clone)]
pub struct SearchablePdfOptions {
    /// Rasterize every page. This is the only strategy we implement.
    pub force_rasterization: bool,
    pub overlay: OverlayOptions,
    /// DPI for pages whose estimate is unusable.
    pub fallback_dpi: u32,
    pub color_space: ColorSpace,
    /// How many pages to render at once.
    pub concurrency: usize,
}

impl Default for SearchablePdfOptions {
    fn default() -> Self {
        Self {
            force_rasterization: true,
            overlay: OverlayOptions::default(),
            fallback_dpi: 120,
            color_space: ColorSpace::Gray,
            concurrency: crate::cpu_limit::cpu_permits(),
        }
    }
}

/// Where to export page images as they are rendered.
#[derive(Clone)]
pub struct PageImageSink {
    pub store: Arc<dyn BlobStore>,
    pub bucket: String,
}

impl PageImageSink {
    /// Store one page image. Callers decide whether a failure matters.
    #[instrument(level = "debug", skip_all, fields(page = raster.page_number))]
    async fn save(&self, doc: &DocumentContext, raster: &PageRaster) -> Result<()> {
        let location = BlobLocation::new(&self.bucket, doc.keys().page_image(raster.page_number));
        let metadata = BlobMetadata::with_content_type("image/png")
            .insert("width", raster.width)
            .insert("height", raster.height)
            .insert("dpi", raster.dpi)
            .insert("created", now_timestamp());
        self.store
            .put(&location, raster.png().to_vec(), &metadata)
            .await
            .with_context(|| format!("failed to save page image to {location}"))
    }
}

/// A finished searchable PDF.
#[derive(Debug)]
pub struct SearchablePdf {
    pub bytes: Vec<u8>,
    pub page_count: u32,
    pub page_images_saved: u32,
}

/// What we decided about a page before rendering it.
#[derive(Debug, Clone, Copy)]
struct PagePlan {
    page_number: u32,
    size: PageSize,
    dpi: u32,
}

/// Turns original PDFs into searchable ones.
pub struct SearchablePdfBuilder {
    renderer: Arc<dyn PageRenderer>,
}

impl SearchablePdfBuilder {
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Self {
        Self { renderer }
    }

    /// Build a searchable version of the PDF at `original_path`.
    ///
    /// This is all or nothing: if any page fails to render or any word fails
    /// to place, we return an error and no PDF. Page image export is the
    /// exception, since a failed upload only costs us that image.
    #[instrument(level = "debug", skip_all, fields(document_id = %doc.document_id))]
    pub async fn build(
        &self,
        original_path: &Path,
        blocks: &OcrBlocks,
        options: &SearchablePdfOptions,
        page_images: Option<&PageImageSink>,
        doc: &DocumentContext,
    ) -> Result<SearchablePdf> {
        if !options.force_rasterization {
            return Err(anyhow!(
                "only the rasterizing strategy is supported; force_rasterization must be set"
            ));
        }

        let original = tokio::fs::read(original_path)
            .await
            .with_context(|| format!("failed to read {:?}", original_path.display()))?;
        if let Some(kind) = infer::get(&original)
            && kind.mime_type() != "application/pdf"
        {
            return Err(anyhow!(
                "original document is {}, not a PDF",
                kind.mime_type()
            ));
        }
        let fallback_dpi = options.fallback_dpi;
        let plans = spawn_blocking_propagating_panics(move || -> Result<Vec<PagePlan>> {
            let source = SourcePdf::from_bytes(&original)?;
            source
                .page_numbers()
                .map(|page_number| {
                    let size = source.page_size(page_number)?;
                    let estimated = estimate_page_dpi(&source, page_number);
                    let dpi = if estimated == 0 { fallback_dpi } else { estimated };
                    Ok(PagePlan {
                        page_number,
                        size,
                        dpi,
                    })
                })
                .collect()
        })
        .await
        .context("failed to read original PDF")?;
        let page_count = plans.len() as u32;
        info!(page_count, "Rasterizing pages");

        // Render concurrently, but `buffered` keeps the pages in order.
        let color_space = options.color_space;
        let rendered = stream::iter(plans)
            .map(|plan| async move {
                let png = self
                    .renderer
                    .render_page(original_path, plan.page_number, plan.dpi, color_space)
                    .await
                    .with_context(|| format!("failed to render page {}", plan.page_number))?;
                let raster =
                    PageRaster::from_png(plan.page_number, plan.dpi, color_space, png).await?;
                let saved = match page_images {
                    Some(sink) => match sink.save(doc, &raster).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(page = plan.page_number, "Skipping page image: {:#}", err);
                            false
                        }
                    },
                    None => false,
                };
                Ok::<_, anyhow::Error>((plan, raster, saved))
            })
            .buffered(options.concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        let mut pdf = ImagePdf::new();
        let mut page_images_saved = 0;
        for (plan, raster, saved) in rendered {
            page_images_saved += u32::from(saved);
            pdf.add_page(plan.size.width, plan.size.height, raster);
        }

        let engine = TextOverlayEngine::new(options.overlay);
        let words = engine
            .apply(&mut pdf, blocks)
            .context("failed to overlay OCR text")?;
        debug!(words, "Overlaid OCR text");

        let bytes = spawn_blocking_propagating_panics(move || pdf.finish()).await?;
        Ok(SearchablePdf {
            bytes,
            page_count,
            page_images_saved,
        })
    }
}
