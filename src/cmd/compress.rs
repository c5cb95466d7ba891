//! The `compress` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use tracing::Instrument as _;

use super::{BackendOpts, print_json};
use crate::{
    compress::{CompressionJob, CompressionOrchestrator, DEFAULT_TIMEOUT, GhostscriptCompressor},
    prelude::*,
};

/// `compress` command line arguments. Normally supplied through the
/// environment by the workflow that starts us.
#[derive(Debug, Args)]
pub struct CompressOpts {
    #[clap(flatten)]
    pub job: CompressionJob,

    /// Give up on Ghostscript after this many seconds.
    #[clap(long, env = "COMPRESSION_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// The `compress` subcommand.
pub async fn cmd_compress(opts: &CompressOpts) -> Result<()> {
    let backends = opts.backend.connect().await?;
    let compressor = GhostscriptCompressor::new(Duration::from_secs(opts.timeout_secs));
    let orchestrator =
        CompressionOrchestrator::new(backends.store, backends.ledger, Arc::new(compressor));

    let doc = opts.job.document();
    let span = doc.stage_span("compress");
    let result = orchestrator
        .run(&opts.job)
        .instrument(span.span().clone())
        .await;
    span.record_outcome(if result.is_ok() { "success" } else { "failed" });
    print_json(&result?)
}
