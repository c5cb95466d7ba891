//! The `lookup` subcommand.

use clap::Args;

use super::BackendOpts;
use crate::prelude::*;

/// `lookup` command line arguments.
#[derive(Debug, Args)]
pub struct LookupOpts {
    /// The document file name, e.g. `scan.pdf`.
    pub document_name: String,

    /// How many processings to show, newest first.
    #[clap(long, default_value = "1")]
    pub limit: usize,

    #[clap(flatten)]
    pub backend: BackendOpts,
}

/// The `lookup` subcommand.
#[instrument(level = "debug", skip_all, fields(document_name = %opts.document_name))]
pub async fn cmd_lookup(opts: &LookupOpts) -> Result<()> {
    let backends = opts.backend.connect().await?;
    let entries = backends
        .ledger
        .latest_for_name(&opts.document_name, opts.limit.max(1))
        .await?;
    debug!(found = entries.len(), "Looked up document");
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
