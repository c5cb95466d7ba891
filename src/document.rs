//! Document identity, blob key layout, and the per-document context we pass
//! through every stage.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Span, field};
use uuid::Uuid;

use crate::prelude::*;

/// Name of the block dump written next to each document.
pub const OCR_BLOCKS_FILE: &str = "textract_output_blocks.json";

/// A generated document id: a UTC timestamp with microseconds plus a random
/// suffix, e.g. `20250314T091502-123456-1f2e3d4c`. Ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now(), Uuid::new_v4())
    }

    fn generate_at(now: DateTime<Utc>, suffix: Uuid) -> Self {
        let mut suffix = suffix.simple().to_string();
        suffix.truncate(8);
        Self(format!("{}-{}", now.format("%Y%m%dT%H%M%S-%6f"), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.contains('/') {
            return Err(anyhow!("invalid document id {:?}", s));
        }
        Ok(Self(s.to_owned()))
    }
}

/// Decode an object key as delivered in storage event notifications, where
/// spaces arrive as `+` and everything else is percent-encoded.
pub fn decode_event_key(key: &str) -> Result<String> {
    let key = key.replace('+', " ");
    Ok(urlencoding::decode(&key)
        .with_context(|| format!("object key {:?} is not valid UTF-8", key))?
        .into_owned())
}

/// The human file name for an object key: its last path segment.
pub fn document_name_from_key(key: &str) -> Result<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.is_empty() {
        return Err(anyhow!("object key {:?} has no file name", key));
    }
    Ok(name.to_owned())
}

/// The current time in the format we store in the ledger.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Identity of the document a unit of work is processing. This is passed
/// explicitly to everything that logs, stores or records on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DocumentContext {
    pub document_id: DocumentId,
    pub document_name: String,
}

impl DocumentContext {
    pub fn new(document_id: DocumentId, document_name: impl Into<String>) -> Self {
        Self {
            document_id,
            document_name: document_name.into(),
        }
    }

    /// Key layout for this document.
    pub fn keys(&self) -> DocumentKeys<'_> {
        DocumentKeys { ctx: self }
    }

    /// Open a tracing span for a pipeline stage.
    ///
    /// At the top of a unit of work this is a [`StageSpan::Root`]. Inside an
    /// existing span it is a [`StageSpan::Child`]. Both carry the document
    /// identity, since a parent span may belong to another document.
    pub fn stage_span(&self, stage: &'static str) -> StageSpan {
        if Span::current().is_none() {
            StageSpan::Root(tracing::info_span!(
                "stage",
                stage,
                document_id = %self.document_id,
                document_name = %self.document_name,
                outcome = field::Empty,
            ))
        } else {
            StageSpan::Child(tracing::debug_span!(
                "step",
                stage,
                document_id = %self.document_id,
                document_name = %self.document_name,
                outcome = field::Empty,
            ))
        }
    }
}

/// A span opened by [`DocumentContext::stage_span`].
#[derive(Debug, Clone)]
pub enum StageSpan {
    Root(Span),
    Child(Span),
}

impl StageSpan {
    pub fn span(&self) -> &Span {
        match self {
            StageSpan::Root(span) | StageSpan::Child(span) => span,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, StageSpan::Root(_))
    }

    /// Record how the stage ended.
    pub fn record_outcome(&self, outcome: &str) {
        self.span().record("outcome", outcome);
    }
}

/// Blob keys for one document.
#[derive(Debug, Clone, Copy)]
pub struct DocumentKeys<'a> {
    ctx: &'a DocumentContext,
}

impl DocumentKeys<'_> {
    /// The searchable PDF: `{id}/{name}`.
    pub fn searchable(&self) -> String {
        format!("{}/{}", self.ctx.document_id, self.ctx.document_name)
    }

    /// The searchable PDF before compression: `{id}/uncompressed_{name}`.
    pub fn uncompressed(&self) -> String {
        format!("{}/uncompressed_{}", self.ctx.document_id, self.ctx.document_name)
    }

    /// The OCR block dump.
    pub fn ocr_blocks(&self) -> String {
        format!("{}/{}", self.ctx.document_id, OCR_BLOCKS_FILE)
    }

    /// Prefix for page images, without a trailing slash.
    pub fn pages_prefix(&self) -> String {
        format!("{}/pages", self.ctx.document_id)
    }

    /// One page image, 1-based.
    pub fn page_image(&self, page_number: u32) -> String {
        format!("{}/page_{page_number}.png", self.pages_prefix())
    }

    /// The "latest version" key, with no id prefix.
    pub fn final_key(&self) -> String {
        self.ctx.document_name.clone()
    }
}
