//! The `extract-text` subcommand.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    ocr::{blocks::OcrBlocks, markdown::document_markdown},
    prelude::*,
};

/// `extract-text` command line arguments.
#[derive(Debug, Args)]
pub struct ExtractTextOpts {
    /// A stored OCR block dump (`{"Blocks": [...]}`).
    #[clap(value_name = "BLOCKS")]
    pub blocks_path: PathBuf,

    /// Document id to embed in each page.
    #[clap(long, default_value = "local")]
    pub document_id: String,

    /// Write one `page_N.md` per page into this directory, instead of
    /// printing every page to standard output.
    #[clap(short = 'o', long = "out", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

/// The `extract-text` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.blocks_path.display()))]
pub async fn cmd_extract_text(opts: &ExtractTextOpts) -> Result<()> {
    let data = tokio::fs::read(&opts.blocks_path)
        .await
        .with_context(|| format!("failed to read {:?}", opts.blocks_path.display()))?;
    let blocks = OcrBlocks::from_json(&data)?;
    let pages = document_markdown(&blocks, &opts.document_id);

    match &opts.output_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {:?}", dir.display()))?;
            for page in &pages {
                let path = dir.join(format!("page_{}.md", page.page_number));
                tokio::fs::write(&path, &page.markdown)
                    .await
                    .with_context(|| format!("failed to write {:?}", path.display()))?;
            }
            info!(pages = pages.len(), dir = %dir.display(), "Wrote page text");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            for page in &pages {
                stdout
                    .write_all(page.markdown.as_bytes())
                    .await
                    .context("failed to write page text")?;
            }
            stdout.flush().await.context("failed to flush page text")?;
        }
    }
    Ok(())
}
