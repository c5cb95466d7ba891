//! The document ledger: per-document status records keyed by
//! `(document_id, document_name)`.
//!
//! Every write is an upsert of one top-level attribute, so re-running a stage
//! simply replaces that stage's record.

use std::{collections::HashMap, fmt, sync::Arc};

use aws_sdk_dynamodb::types::AttributeValue;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::{fs, sync::Mutex};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    aws::load_aws_config,
    document::{DocumentContext, DocumentId, now_timestamp},
    prelude::*,
};

/// Default name of the secondary index on `document_name`.
pub const DEFAULT_NAME_INDEX: &str = "document_name_index";

/// The pipeline stages that leave a record in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStage {
    /// Where the original document was stored.
    DocumentS3,
    /// The upload that triggered processing.
    DocumentPutEvent,
    TextractAsyncStart,
    TextractAsyncEnd,
    SelectablePdf,
    CompressionStarted,
    CompressionComplete,
}

impl LedgerStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStage::DocumentS3 => "document_s3",
            LedgerStage::DocumentPutEvent => "document_put_event",
            LedgerStage::TextractAsyncStart => "textract_async_start",
            LedgerStage::TextractAsyncEnd => "textract_async_end",
            LedgerStage::SelectablePdf => "selectable_pdf",
            LedgerStage::CompressionStarted => "compression_started",
            LedgerStage::CompressionComplete => "compression_complete",
        }
    }
}

impl fmt::Display for LedgerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document's ledger record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub document_id: DocumentId,
    pub document_name: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl LedgerEntry {
    pub fn stage(&self, stage: LedgerStage) -> Option<&Value> {
        self.attributes.get(stage.as_str())
    }
}

/// Ledger storage interface.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// The table name handed to later stages.
    fn table_name(&self) -> &str;

    /// Set one top-level attribute, creating the record if needed.
    async fn upsert_attribute(
        &self,
        doc: &DocumentContext,
        attribute: &str,
        value: Value,
    ) -> Result<()>;

    /// Fetch a document's record.
    async fn get(&self, doc: &DocumentContext) -> Result<Option<LedgerEntry>>;

    /// The most recent records for a document name, newest first.
    async fn latest_for_name(&self, document_name: &str, limit: usize)
    -> Result<Vec<LedgerEntry>>;

    /// Record a stage, stamping it with the current time.
    async fn record_stage(
        &self,
        doc: &DocumentContext,
        stage: LedgerStage,
        mut fields: Map<String, Value>,
    ) -> Result<()> {
        fields.insert("datetime".to_owned(), Value::String(now_timestamp()));
        debug!(document_id = %doc.document_id, %stage, "Recording ledger stage");
        self.upsert_attribute(doc, stage.as_str(), Value::Object(fields))
            .await
            .with_context(|| {
                format!("failed to record {stage} for document {}", doc.document_id)
            })
    }

    /// Record that a stage failed.
    async fn record_failure(
        &self,
        doc: &DocumentContext,
        stage: LedgerStage,
        error: &anyhow::Error,
    ) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("status".to_owned(), Value::from("failed"));
        fields.insert("error".to_owned(), Value::from(format!("{error:#}")));
        self.record_stage(doc, stage, fields).await
    }
}

/// Build a JSON object from key/value pairs.
#[macro_export]
macro_rules! fields {
    ($($key:literal => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = ::serde_json::Map::new();
        $(map.insert($key.to_owned(), ::serde_json::json!($value));)*
        map
    }};
}

/// Convert JSON into a DynamoDB attribute.
fn to_attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute_value).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute_value(v)))
                .collect(),
        ),
    }
}

/// Convert a DynamoDB attribute into JSON. Binary values are dropped.
fn from_attribute_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| n.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(items) => Value::Array(items.iter().map(from_attribute_value).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), from_attribute_value(v)))
                .collect(),
        ),
        AttributeValue::Ss(items) => items.iter().cloned().map(Value::String).collect(),
        AttributeValue::Ns(items) => items
            .iter()
            .map(|n| from_attribute_value(&AttributeValue::N(n.clone())))
            .collect(),
        _ => Value::Null,
    }
}

/// Turn a DynamoDB item into an entry.
fn entry_from_item(item: &HashMap<String, AttributeValue>) -> Result<LedgerEntry> {
    let mut attributes = item
        .iter()
        .map(|(k, v)| (k.clone(), from_attribute_value(v)))
        .collect::<Map<_, _>>();
    let mut take_string = |name: &str| -> Result<String> {
        match attributes.remove(name) {
            Some(Value::String(s)) => Ok(s),
            _ => Err(anyhow!("ledger item is missing {}", name)),
        }
    };
    let document_id = take_string("document_id")?.parse()?;
    let document_name = take_string("document_name")?;
    Ok(LedgerEntry {
        document_id,
        document_name,
        attributes,
    })
}

/// DynamoDB-backed [`Ledger`].
pub struct DynamoLedger {
    client: aws_sdk_dynamodb::Client,
    table: String,
    name_index: String,
}

impl DynamoLedger {
    pub async fn new(table: &str, name_index: &str) -> Result<Arc<dyn Ledger>> {
        let config = load_aws_config().await?;
        Ok(Arc::new(Self {
            client: aws_sdk_dynamodb::Client::new(&config),
            table: table.to_owned(),
            name_index: name_index.to_owned(),
        }))
    }
}

#[async_trait]
impl Ledger for DynamoLedger {
    fn table_name(&self) -> &str {
        &self.table
    }

    #[instrument(level = "debug", skip_all, fields(table = %self.table, document_id = %doc.document_id, %attribute))]
    async fn upsert_attribute(
        &self,
        doc: &DocumentContext,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table)
            .key("document_id", AttributeValue::S(doc.document_id.to_string()))
            .key("document_name", AttributeValue::S(doc.document_name.clone()))
            .update_expression("SET #attr = :value")
            .expression_attribute_names("#attr", attribute)
            .expression_attribute_values(":value", to_attribute_value(&value))
            .send()
            .await
            .with_context(|| format!("failed to update ledger table {}", self.table))?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(table = %self.table, document_id = %doc.document_id))]
    async fn get(&self, doc: &DocumentContext) -> Result<Option<LedgerEntry>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("document_id", AttributeValue::S(doc.document_id.to_string()))
            .key("document_name", AttributeValue::S(doc.document_name.clone()))
            .consistent_read(true)
            .send()
            .await
            .with_context(|| format!("failed to read ledger table {}", self.table))?;
        output.item().map(entry_from_item).transpose()
    }

    #[instrument(level = "debug", skip(self), fields(table = %self.table))]
    async fn latest_for_name(
        &self,
        document_name: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let output = self
            .client
            .query()
            .table_name(&self.table)
            .index_name(&self.name_index)
            .key_condition_expression("document_name = :name")
            .expression_attribute_values(":name", AttributeValue::S(document_name.to_owned()))
            .scan_index_forward(false)
            .limit(i32::try_from(limit).unwrap_or(i32::MAX))
            .send()
            .await
            .with_context(|| {
                format!("failed to query {} for {:?}", self.name_index, document_name)
            })?;
        output.items().iter().map(entry_from_item).collect()
    }
}

/// File-backed [`Ledger`] for local runs: one JSON file per document under
/// `{root}/_ledger/`.
///
/// Local runs hand compression to a child process that writes to the same
/// files, so each update holds an exclusive lock on `{id}.lock` for its
/// whole read-modify-write, and replaces the record through a uniquely named
/// temporary file.
pub struct LocalLedger {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalLedger {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("_ledger"),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, document_id: &DocumentId) -> PathBuf {
        self.dir.join(format!("{document_id}.json"))
    }

    async fn read_entry(path: &Path) -> Result<Option<LedgerEntry>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data).with_context(|| {
                format!("corrupt ledger file {}", path.display())
            })?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }
}

/// Set one attribute of a local ledger file, holding the file's lock.
fn update_locked(
    dir: &Path,
    path: &Path,
    doc: &DocumentContext,
    attribute: &str,
    value: Value,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let lock_path = path.with_extension("lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    FileExt::lock_exclusive(&lock_file)
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;

    let mut entry = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .with_context(|| format!("corrupt ledger file {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerEntry {
            document_id: doc.document_id.clone(),
            document_name: doc.document_name.clone(),
            attributes: Map::new(),
        },
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    entry.attributes.insert(attribute.to_owned(), value);

    // Write then rename, so readers never see half a file.
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, &entry)?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    // The lock is released when `lock_file` is closed.
    Ok(())
}

#[async_trait]
impl Ledger for LocalLedger {
    fn table_name(&self) -> &str {
        "local"
    }

    async fn upsert_attribute(
        &self,
        doc: &DocumentContext,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.dir.clone();
        let path = self.path_for(&doc.document_id);
        let doc = doc.clone();
        let attribute = attribute.to_owned();
        spawn_blocking_propagating_panics(move || {
            update_locked(&dir, &path, &doc, &attribute, value)
        })
        .await
    }

    async fn get(&self, doc: &DocumentContext) -> Result<Option<LedgerEntry>> {
        Ok(Self::read_entry(&self.path_for(&doc.document_id))
            .await?
            .filter(|entry| entry.document_name == doc.document_name))
    }

    async fn latest_for_name(
        &self,
        document_name: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.dir.display()));
            }
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path).await?
                && entry.document_name == document_name
            {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.document_id.cmp(&a.document_id));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(id: &str, name: &str) -> DocumentContext {
        DocumentContext::new(id.parse().unwrap(), name)
    }

    #[tokio::test]
    async fn rerunning_a_stage_overwrites_its_record() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ledger")?;
        let ledger = LocalLedger::new(dir.path());
        let doc = ctx("20250101T000000-000001-aaaaaaaa", "scan.pdf");

        ledger
            .record_stage(&doc, LedgerStage::SelectablePdf, fields! { "page_count" => 3 })
            .await?;
        ledger
            .record_stage(&doc, LedgerStage::SelectablePdf, fields! { "page_count" => 4 })
            .await?;

        let entry = ledger.get(&doc).await?.expect("entry should exist");
        assert_eq!(entry.attributes.len(), 1);
        let record = entry.stage(LedgerStage::SelectablePdf).unwrap();
        assert_eq!(record["page_count"], 4);
        assert!(record["datetime"].is_string());
        assert_eq!(ledger.latest_for_name("scan.pdf", 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failures_carry_the_error() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ledger")?;
        let ledger = LocalLedger::new(dir.path());
        let doc = ctx("d1", "scan.pdf");
        let err = anyhow!("disk full").context("could not render page 2");
        ledger
            .record_failure(&doc, LedgerStage::SelectablePdf, &err)
            .await?;
        let entry = ledger.get(&doc).await?.unwrap();
        let record = entry.stage(LedgerStage::SelectablePdf).unwrap();
        assert_eq!(record["status"], "failed");
        assert_eq!(record["error"], "could not render page 2: disk full");
        Ok(())
    }

    #[tokio::test]
    async fn latest_for_name_is_newest_first() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ledger")?;
        let ledger = LocalLedger::new(dir.path());
        for id in ["20250101T000000-000001-a", "20250301T000000-000001-c", "20250201T000000-000001-b"] {
            ledger
                .record_stage(&ctx(id, "scan.pdf"), LedgerStage::DocumentPutEvent, fields! {})
                .await?;
        }
        ledger
            .record_stage(&ctx("20250401T000000-000001-d", "other.pdf"), LedgerStage::DocumentPutEvent, fields! {})
            .await?;

        let latest = ledger.latest_for_name("scan.pdf", 2).await?;
        let ids = latest
            .iter()
            .map(|entry| entry.document_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["20250301T000000-000001-c", "20250201T000000-000001-b"]);
        assert!(ledger.latest_for_name("missing.pdf", 5).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writers_sharing_a_root_keep_each_others_attributes() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ledger")?;
        // Two instances stand in for the parent and the compression child.
        let parent = Arc::new(LocalLedger::new(dir.path()));
        let child = Arc::new(LocalLedger::new(dir.path()));
        for round in 0..50 {
            let doc = ctx(&format!("20250101T000000-{round:06}-a"), "scan.pdf");
            let started = tokio::spawn({
                let (ledger, doc) = (parent.clone(), doc.clone());
                async move {
                    ledger
                        .record_stage(&doc, LedgerStage::CompressionStarted, fields! {})
                        .await
                }
            });
            let complete = tokio::spawn({
                let (ledger, doc) = (child.clone(), doc.clone());
                async move {
                    ledger
                        .record_stage(&doc, LedgerStage::CompressionComplete, fields! {})
                        .await
                }
            });
            started.await??;
            complete.await??;

            let entry = parent.get(&doc).await?.unwrap();
            assert!(entry.stage(LedgerStage::CompressionStarted).is_some(), "round {round}");
            assert!(entry.stage(LedgerStage::CompressionComplete).is_some(), "round {round}");
        }
        Ok(())
    }

    #[test]
    fn attribute_values_convert_both_ways() {
        let value = json!({
            "status": "success",
            "compression_stats": {"input_size_mb": 12.5, "pages": 40, "ok": true},
            "subnets": ["a", "b"],
            "error": null,
        });
        assert_eq!(from_attribute_value(&to_attribute_value(&value)), value);
    }

    #[test]
    fn items_become_entries() {
        let item = HashMap::from([
            ("document_id".to_owned(), AttributeValue::S("d1".to_owned())),
            ("document_name".to_owned(), AttributeValue::S("a.pdf".to_owned())),
            ("selectable_pdf".to_owned(), to_attribute_value(&json!({"datetime": "x"}))),
        ]);
        let entry = entry_from_item(&item).unwrap();
        assert_eq!(entry.document_name, "a.pdf");
        assert!(entry.stage(LedgerStage::SelectablePdf).is_some());
        assert!(entry_from_item(&HashMap::new()).is_err());
    }
}
