//! Handing documents off to the compression stage.

use std::{process::Stdio, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{aws::load_aws_config, compress::CompressionJob, prelude::*};

/// Everything the compression stage needs, as sent to the workflow.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompressionHandoff {
    #[serde(flatten)]
    pub job: CompressionJob,
    /// Ledger table the compression stage should update.
    pub ddb_table: String,
    /// Subnets to run the compression task in.
    pub subnets: Vec<String>,
}

impl CompressionHandoff {
    pub fn new(job: CompressionJob, ddb_table: &str, subnets: &[String]) -> Self {
        Self {
            job,
            ddb_table: ddb_table.to_owned(),
            subnets: clean_subnets(subnets),
        }
    }

    /// The execution name: one per document.
    pub fn execution_name(&self) -> String {
        format!("compress-{}", self.job.document_id)
    }
}

/// Trim subnet ids and drop empty ones, as left by `"a, b,"`.
fn clean_subnets(subnets: &[String]) -> Vec<String> {
    subnets
        .iter()
        .map(|subnet| subnet.trim())
        .filter(|subnet| !subnet.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Starts compression without waiting for it.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync + 'static {
    /// Start compressing. Returns an id for the started execution.
    async fn start_compression(&self, handoff: &CompressionHandoff) -> Result<String>;
}

/// Starts a Step Functions state machine that runs the compression task.
pub struct StepFunctionsLauncher {
    client: aws_sdk_sfn::Client,
    state_machine_arn: String,
}

impl StepFunctionsLauncher {
    pub async fn new(state_machine_arn: &str) -> Result<Arc<dyn WorkflowLauncher>> {
        let config = load_aws_config().await?;
        Ok(Arc::new(Self {
            client: aws_sdk_sfn::Client::new(&config),
            state_machine_arn: state_machine_arn.to_owned(),
        }))
    }
}

#[async_trait]
impl WorkflowLauncher for StepFunctionsLauncher {
    #[instrument(level = "debug", skip_all, fields(document_id = %handoff.job.document_id))]
    async fn start_compression(&self, handoff: &CompressionHandoff) -> Result<String> {
        let input = serde_json::to_string(handoff)?;
        let output = self
            .client
            .start_execution()
            .state_machine_arn(&self.state_machine_arn)
            .name(handoff.execution_name())
            .input(input)
            .send()
            .await
            .with_context(|| {
                format!("failed to start {} for {}", self.state_machine_arn, handoff.job.document_id)
            })?;
        Ok(output.execution_arn().to_owned())
    }
}

/// Runs compression as a detached child process of this binary. Used for
/// local runs, and when no state machine is configured.
pub struct SubprocessLauncher {
    program: PathBuf,
    local_root: Option<PathBuf>,
}

impl SubprocessLauncher {
    /// Launch `compress` on the currently running executable.
    pub fn new(local_root: Option<&Path>) -> Result<Self> {
        let program = std::env::current_exe().context("cannot find our own executable")?;
        Ok(Self::with_program(program, local_root))
    }

    pub fn with_program(program: impl Into<PathBuf>, local_root: Option<&Path>) -> Self {
        Self {
            program: program.into(),
            local_root: local_root.map(Path::to_owned),
        }
    }
}

#[async_trait]
impl WorkflowLauncher for SubprocessLauncher {
    #[instrument(level = "debug", skip_all, fields(document_id = %handoff.job.document_id))]
    async fn start_compression(&self, handoff: &CompressionHandoff) -> Result<String> {
        let job = &handoff.job;
        let mut cmd = Command::new(&self.program);
        cmd.arg("compress");
        if let Some(root) = &self.local_root {
            cmd.arg("--local-root").arg(root);
        }
        cmd.env("DOCUMENT_ID", job.document_id.as_str())
            .env("DOCUMENT_NAME", &job.document_name)
            .env("INPUT_BUCKET", &job.input_bucket)
            .env("INPUT_KEY", &job.input_key)
            .env("OUTPUT_BUCKET", &job.output_bucket)
            .env("OUTPUT_KEY", &job.output_key)
            .env("DDB_DOCUMENTS_TABLE", &handoff.ddb_table)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if let Some(bucket) = &job.output_final_bucket {
            cmd.env("OUTPUT_FINAL_BUCKET", bucket);
        }
        if let Some(key) = &job.output_final_key {
            cmd.env("OUTPUT_FINAL_KEY", key);
        }

        // We never wait on the child; it outlives us if need be.
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to run {:?}", self.program.display()))?;
        let id = child
            .id()
            .map_or_else(|| handoff.execution_name(), |pid| format!("local-{pid}"));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn handoff() -> CompressionHandoff {
        let job = CompressionJob {
            document_id: "20250101T000000-000001-abcdef12".parse().unwrap(),
            document_name: "scan.pdf".to_owned(),
            input_bucket: "processed".to_owned(),
            input_key: "20250101T000000-000001-abcdef12/uncompressed_scan.pdf".to_owned(),
            output_bucket: "processed".to_owned(),
            output_key: "20250101T000000-000001-abcdef12/scan.pdf".to_owned(),
            output_final_bucket: Some("final".to_owned()),
            output_final_key: Some("scan.pdf".to_owned()),
        };
        let subnets = vec!["subnet-a".to_owned(), " subnet-b ".to_owned(), "".to_owned()];
        CompressionHandoff::new(job, "documents", &subnets)
    }

    #[test]
    fn handoff_is_flat_json() {
        let handoff = handoff();
        assert_eq!(handoff.execution_name(), "compress-20250101T000000-000001-abcdef12");
        assert_eq!(
            serde_json::to_value(&handoff).unwrap(),
            json!({
                "document_id": "20250101T000000-000001-abcdef12",
                "document_name": "scan.pdf",
                "input_bucket": "processed",
                "input_key": "20250101T000000-000001-abcdef12/uncompressed_scan.pdf",
                "output_bucket": "processed",
                "output_key": "20250101T000000-000001-abcdef12/scan.pdf",
                "output_final_bucket": "final",
                "output_final_key": "scan.pdf",
                "ddb_table": "documents",
                "subnets": ["subnet-a", "subnet-b"],
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_launch_does_not_wait() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("launch")?;
        let launcher = SubprocessLauncher::with_program("true", Some(dir.path()));
        let id = launcher.start_compression(&handoff()).await?;
        assert!(id.starts_with("local-") || id.starts_with("compress-"));

        let missing = SubprocessLauncher::with_program("/nonexistent/binary", None);
        assert!(missing.start_compression(&handoff()).await.is_err());
        Ok(())
    }
}
