//! Async OCR jobs on AWS Textract.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use aws_sdk_textract::types::{
    Block, DocumentLocation, FeatureType, JobStatus, NotificationChannel, S3Object,
};
use clap::Args;

use super::{
    blocks::{BlockGeometry, OcrBlock, OcrBlocks, Relationship},
    throttle::{CloudWatchJobMetrics, OcrJobThrottler, OcrOperation, ThrottleOpts},
};
use crate::{aws::load_aws_config, geometry::NormalizedBox, prelude::*, storage::BlobLocation};

/// Analysis features we know how to request.
const SUPPORTED_FEATURES: &[&str] = &["TABLES", "FORMS", "LAYOUT"];

/// How long job submission may wait for a free concurrency slot.
const JOB_SLOT_MAX_WAIT: Duration = Duration::from_secs(120);

/// How often we re-check for a free slot.
const JOB_SLOT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Which OCR API family to use. Submission and result retrieval must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrMode {
    /// Plain text detection.
    Text,
    /// Document analysis with tables, forms or layout.
    Analyze,
}

impl FromStr for OcrMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TEXT" => Ok(OcrMode::Text),
            "ANALYZE" => Ok(OcrMode::Analyze),
            _ => Err(anyhow!("unknown OCR mode {:?} (expected TEXT or ANALYZE)", s)),
        }
    }
}

impl fmt::Display for OcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrMode::Text => write!(f, "TEXT"),
            OcrMode::Analyze => write!(f, "ANALYZE"),
        }
    }
}

/// OCR service options.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// OCR mode: TEXT or ANALYZE.
    #[clap(long = "ocr-mode", env = "TEXTRACT_MODE", default_value = "TEXT")]
    pub mode: OcrMode,

    /// Comma-separated analysis features (TABLES, FORMS, LAYOUT). Only used
    /// in ANALYZE mode.
    #[clap(
        long = "ocr-features",
        env = "TEXTRACT_FEATURES",
        default_value = "TABLES",
        value_delimiter = ','
    )]
    pub features: Vec<String>,

    /// Topic that receives job completion notifications.
    #[clap(long, env = "TEXTRACT_SNS_TOPIC_ARN")]
    pub sns_topic_arn: Option<String>,

    /// Role the OCR service assumes to publish to the topic.
    #[clap(long, env = "TEXTRACT_SNS_ROLE_ARN")]
    pub sns_role_arn: Option<String>,

    #[clap(flatten)]
    pub throttle: ThrottleOpts,
}

impl OcrOpts {
    /// Requested features, uppercased and filtered to those we support.
    pub fn feature_types(&self) -> Vec<FeatureType> {
        let mut features = self
            .features
            .iter()
            .map(|feature| feature.trim().to_ascii_uppercase())
            .filter(|feature| {
                let supported = SUPPORTED_FEATURES.contains(&feature.as_str());
                if !supported && !feature.is_empty() {
                    warn!("Ignoring unsupported OCR feature {:?}", feature);
                }
                supported
            })
            .collect::<Vec<_>>();
        features.dedup();
        if features.is_empty() {
            features.push("TABLES".to_owned());
        }
        features
            .iter()
            .map(|feature| FeatureType::from(feature.as_str()))
            .collect()
    }
}

/// A page of job results.
struct ResultPage {
    blocks: Vec<OcrBlock>,
    next_token: Option<String>,
    status: Option<JobStatus>,
    status_message: Option<String>,
}

/// Textract client wrapped in our throttle.
pub struct TextractClient {
    client: aws_sdk_textract::Client,
    throttler: Arc<OcrJobThrottler>,
    opts: OcrOpts,
}

impl TextractClient {
    /// Create a client with CloudWatch-based concurrency estimation.
    pub async fn new(opts: &OcrOpts) -> Result<Self> {
        let config = load_aws_config().await?;
        let metrics = Arc::new(CloudWatchJobMetrics::new().await?);
        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
            throttler: Arc::new(OcrJobThrottler::new(opts.throttle.clone(), metrics)),
            opts: opts.clone(),
        })
    }

    pub fn mode(&self) -> OcrMode {
        self.opts.mode
    }

    /// The completion notification channel, if configured.
    fn notification_channel(&self) -> Result<Option<NotificationChannel>> {
        match (&self.opts.sns_topic_arn, &self.opts.sns_role_arn) {
            (Some(topic), Some(role)) => Ok(Some(
                NotificationChannel::builder()
                    .sns_topic_arn(topic)
                    .role_arn(role)
                    .build()
                    .context("invalid OCR notification channel")?,
            )),
            (None, None) => Ok(None),
            _ => Err(anyhow!(
                "TEXTRACT_SNS_TOPIC_ARN and TEXTRACT_SNS_ROLE_ARN must be set together"
            )),
        }
    }

    /// Submit an async OCR job for a stored document. `job_tag` comes back in
    /// the completion notification.
    #[instrument(level = "debug", skip_all, fields(%location, %job_tag, mode = %self.opts.mode))]
    pub async fn start_job(&self, location: &BlobLocation, job_tag: &str) -> Result<String> {
        self.throttler
            .wait_for_job_slot(JOB_SLOT_MAX_WAIT, JOB_SLOT_CHECK_INTERVAL)
            .await?;

        let document = DocumentLocation::builder()
            .s3_object(
                S3Object::builder()
                    .bucket(&location.bucket)
                    .name(&location.key)
                    .build(),
            )
            .build();
        let channel = self.notification_channel()?;

        let job_id = match self.opts.mode {
            OcrMode::Text => self
                .throttler
                .call(OcrOperation::StartJob, || {
                    self.client
                        .start_document_text_detection()
                        .document_location(document.clone())
                        .job_tag(job_tag)
                        .set_notification_channel(channel.clone())
                        .send()
                })
                .await?
                .job_id()
                .map(str::to_owned),
            OcrMode::Analyze => {
                let features = self.opts.feature_types();
                self.throttler
                    .call(OcrOperation::StartJob, || {
                        self.client
                            .start_document_analysis()
                            .document_location(document.clone())
                            .set_feature_types(Some(features.clone()))
                            .job_tag(job_tag)
                            .set_notification_channel(channel.clone())
                            .send()
                    })
                    .await?
                    .job_id()
                    .map(str::to_owned)
            }
        };
        let job_id = job_id.ok_or_else(|| anyhow!("OCR service returned no job id"))?;
        info!(%job_id, "Started OCR job");
        Ok(job_id)
    }

    /// Fetch one page of results.
    async fn fetch_result_page(
        &self,
        job_id: &str,
        next_token: Option<String>,
    ) -> Result<ResultPage> {
        match self.opts.mode {
            OcrMode::Text => {
                let output = self
                    .throttler
                    .call(OcrOperation::GetResults, || {
                        self.client
                            .get_document_text_detection()
                            .job_id(job_id)
                            .set_next_token(next_token.clone())
                            .send()
                    })
                    .await?;
                Ok(ResultPage {
                    blocks: output.blocks().iter().map(block_from_sdk).collect(),
                    next_token: output.next_token().map(str::to_owned),
                    status: output.job_status().cloned(),
                    status_message: output.status_message().map(str::to_owned),
                })
            }
            OcrMode::Analyze => {
                let output = self
                    .throttler
                    .call(OcrOperation::GetResults, || {
                        self.client
                            .get_document_analysis()
                            .job_id(job_id)
                            .set_next_token(next_token.clone())
                            .send()
                    })
                    .await?;
                Ok(ResultPage {
                    blocks: output.blocks().iter().map(block_from_sdk).collect(),
                    next_token: output.next_token().map(str::to_owned),
                    status: output.job_status().cloned(),
                    status_message: output.status_message().map(str::to_owned),
                })
            }
        }
    }

    /// Fetch every block produced by a finished job.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_blocks(&self, job_id: &str) -> Result<OcrBlocks> {
        let mut blocks = Vec::new();
        let mut next_token = None;
        let mut pages = 0;
        loop {
            let page = self.fetch_result_page(job_id, next_token.take()).await?;
            pages += 1;
            match page.status {
                Some(JobStatus::Succeeded) | None => {}
                Some(JobStatus::PartialSuccess) => {
                    warn!(%job_id, message = ?page.status_message, "OCR job partially succeeded");
                }
                Some(status) => {
                    return Err(anyhow!(
                        "OCR job {} has status {}: {}",
                        job_id,
                        status.as_str(),
                        page.status_message.as_deref().unwrap_or("no message")
                    ));
                }
            }
            blocks.extend(page.blocks);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        debug!(blocks = blocks.len(), pages, "Fetched OCR results");
        Ok(OcrBlocks::new(blocks))
    }
}

/// Convert an SDK block into our serializable form.
fn block_from_sdk(block: &Block) -> OcrBlock {
    let geometry = block
        .geometry()
        .and_then(|geometry| geometry.bounding_box())
        .map(|bbox| BlockGeometry {
            bounding_box: NormalizedBox {
                left: f64::from(bbox.left()),
                top: f64::from(bbox.top()),
                width: f64::from(bbox.width()),
                height: f64::from(bbox.height()),
            },
        });
    let relationships = block
        .relationships()
        .iter()
        .filter_map(|rel| {
            Some(Relationship {
                kind: rel.r#type()?.as_str().to_owned(),
                ids: rel.ids().to_vec(),
            })
        })
        .collect();
    OcrBlock {
        id: block.id().unwrap_or_default().to_owned(),
        block_type: block
            .block_type()
            .map(|kind| kind.as_str().to_owned())
            .unwrap_or_default()
            .into(),
        page: block.page().and_then(|page| u32::try_from(page).ok()),
        geometry,
        text: block.text().map(str::to_owned),
        relationships,
        confidence: block.confidence().map(f64::from),
        row_index: block.row_index().and_then(|row| u32::try_from(row).ok()),
        column_index: block.column_index().and_then(|col| u32::try_from(col).ok()),
    }
}
