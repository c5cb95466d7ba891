//! Rate and concurrency governor in front of the OCR service.
//!
//! The service enforces account-wide quotas on both request rate and the
//! number of in-flight async jobs. We space out calls per operation, retry
//! throttling errors with backoff, and refuse to start jobs while the
//! estimated number of running jobs is at the cap.

use std::{
    collections::HashMap,
    error, fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use aws_sdk_cloudwatch::{
    primitives::DateTime,
    types::{Dimension, Statistic},
};
use clap::Args;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use rand::Rng as _;
use tokio::{
    sync::Mutex,
    time::{self, Instant},
};

use crate::{
    aws::load_aws_config,
    prelude::*,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, retry_result_ok, try_potentially_transient},
};

/// Upper bound on the random delay added after waiting on a rate limiter.
const RATE_LIMIT_JITTER_MILLIS: u64 = 100;

/// How far back we look when counting requests.
const METRICS_WINDOW: Duration = Duration::from_secs(300);

/// Rough number of status polls a job receives during its life.
const ASSUMED_POLLS_PER_JOB: f64 = 10.0;

/// Multiplier applied to the raw estimate, since jobs run longer than the
/// metrics window suggests.
const ESTIMATE_SAFETY_FACTOR: f64 = 1.5;

/// Operations we count as starting a job.
const START_OPERATIONS: &[&str] = &["StartDocumentTextDetection", "StartDocumentAnalysis"];

/// Operations we count as polling a job.
const POLL_OPERATIONS: &[&str] = &["GetDocumentTextDetection", "GetDocumentAnalysis"];

/// The OCR calls we throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrOperation {
    /// Submitting an async job.
    StartJob,
    /// Fetching job status or results.
    GetResults,
}

impl fmt::Display for OcrOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrOperation::StartJob => write!(f, "start"),
            OcrOperation::GetResults => write!(f, "get"),
        }
    }
}

/// Throttle settings. The defaults sit a little under the service's
/// published quotas.
#[derive(Args, Clone, Debug)]
pub struct ThrottleOpts {
    /// Max job submissions per second.
    #[clap(long, env = "TEXTRACT_START_TPS", default_value = "1.8")]
    pub start_tps: RateLimit,

    /// Max result fetches per second.
    #[clap(long, env = "TEXTRACT_GET_TPS", default_value = "4.5")]
    pub get_tps: RateLimit,

    /// Refuse to start jobs when this many are estimated to be running.
    #[clap(long, env = "TEXTRACT_MAX_CONCURRENT_JOBS", default_value = "90")]
    pub max_concurrent_jobs: usize,

    /// Retries for throttled calls.
    #[clap(long, env = "TEXTRACT_MAX_RETRIES", default_value = "5")]
    pub max_retries: u8,

    /// First backoff delay, in seconds.
    #[clap(long, env = "TEXTRACT_BASE_DELAY", default_value = "1.0")]
    pub base_delay: f64,

    /// Longest backoff delay, in seconds.
    #[clap(long, env = "TEXTRACT_MAX_DELAY", default_value = "60.0")]
    pub max_delay: f64,
}

impl Default for ThrottleOpts {
    fn default() -> Self {
        Self {
            start_tps: RateLimit {
                max_requests: 1.8,
                per_period: crate::rate_limit::RateLimitPeriod::Second,
            },
            get_tps: RateLimit {
                max_requests: 4.5,
                per_period: crate::rate_limit::RateLimitPeriod::Second,
            },
            max_concurrent_jobs: 90,
            max_retries: 5,
            base_delay: 1.0,
            max_delay: 60.0,
        }
    }
}

impl ThrottleOpts {
    /// Backoff range for [`ExponentialJitter::FromBackoffRange`].
    ///
    /// The delays grow geometrically from the low end to the high end over
    /// `max_retries` attempts, so we pick the high end that makes each delay
    /// double the previous one, capped at `max_delay`.
    fn backoff_range_millis(&self) -> std::ops::RangeInclusive<u32> {
        let base = (self.base_delay * 1000.0).max(1.0);
        let max = (self.max_delay * 1000.0).max(base);
        let doublings = f64::from(self.max_retries.saturating_sub(1));
        let high = (base * 2f64.powf(doublings)).min(max);
        (base as u32)..=(high as u32)
    }
}

/// Request volume seen by the OCR service over a recent window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestCounts {
    /// Job submissions.
    pub started: f64,
    /// Status and result fetches.
    pub polled: f64,
}

/// Source of recent OCR request counts.
#[async_trait]
pub trait JobMetrics: Send + Sync + 'static {
    /// Count requests over the last `window`.
    async fn request_counts(&self, window: Duration) -> Result<RequestCounts>;
}

/// [`JobMetrics`] backed by the service's CloudWatch usage metrics.
pub struct CloudWatchJobMetrics {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchJobMetrics {
    pub async fn new() -> Result<Self> {
        let config = load_aws_config().await?;
        Ok(Self {
            client: aws_sdk_cloudwatch::Client::new(&config),
        })
    }

    /// Sum `UserRequestCount` for one operation.
    #[instrument(level = "trace", skip(self))]
    async fn sum_requests(
        &self,
        operation: &str,
        start: SystemTime,
        end: SystemTime,
        period: Duration,
    ) -> Result<f64> {
        let output = self
            .client
            .get_metric_statistics()
            .namespace("AWS/Textract")
            .metric_name("UserRequestCount")
            .dimensions(
                Dimension::builder()
                    .name("Operation")
                    .value(operation)
                    .build(),
            )
            .start_time(DateTime::from(start))
            .end_time(DateTime::from(end))
            .period(i32::try_from(period.as_secs()).unwrap_or(i32::MAX))
            .statistics(Statistic::Sum)
            .send()
            .await
            .with_context(|| format!("could not read request metrics for {operation}"))?;
        Ok(output
            .datapoints()
            .iter()
            .filter_map(|point| point.sum())
            .sum())
    }
}

#[async_trait]
impl JobMetrics for CloudWatchJobMetrics {
    async fn request_counts(&self, window: Duration) -> Result<RequestCounts> {
        let end = SystemTime::now();
        let start = end - window;
        let mut counts = RequestCounts::default();
        for operation in START_OPERATIONS {
            counts.started += self.sum_requests(operation, start, end, window).await?;
        }
        for operation in POLL_OPERATIONS {
            counts.polled += self.sum_requests(operation, start, end, window).await?;
        }
        Ok(counts)
    }
}

/// Estimate in-flight jobs from request volume.
///
/// Each job is submitted once and polled roughly [`ASSUMED_POLLS_PER_JOB`]
/// times, so jobs that have been polled that often are probably done. This is
/// a tunable approximation, rounded down.
pub fn estimate_concurrent_jobs(counts: RequestCounts) -> usize {
    let estimate = (counts.started - counts.polled / ASSUMED_POLLS_PER_JOB).max(0.0);
    let estimate = (estimate * ESTIMATE_SAFETY_FACTOR).min(counts.started.max(0.0));
    estimate.floor() as usize
}

/// We gave up waiting for a job slot.
#[derive(Debug)]
pub enum SlotWaitError {
    TimedOut {
        waited: Duration,
        current: usize,
        max: usize,
    },
}

impl fmt::Display for SlotWaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotWaitError::TimedOut {
                waited,
                current,
                max,
            } => write!(
                f,
                "no OCR job slot after {:.0}s ({current} of {max} jobs in flight)",
                waited.as_secs_f64()
            ),
        }
    }
}

impl error::Error for SlotWaitError {}

/// A cached concurrency estimate.
#[derive(Debug, Clone, Copy)]
struct CachedEstimate {
    at: Instant,
    jobs: usize,
}

/// Rate and concurrency governor for OCR calls.
pub struct OcrJobThrottler {
    opts: ThrottleOpts,
    limiters: HashMap<OcrOperation, RateLimiter>,
    metrics: Arc<dyn JobMetrics>,
    cache_ttl: Duration,
    cached: Mutex<Option<CachedEstimate>>,
}

impl OcrJobThrottler {
    /// Create a new throttler.
    pub fn new(opts: ThrottleOpts, metrics: Arc<dyn JobMetrics>) -> Self {
        let limiters = HashMap::from([
            (OcrOperation::StartJob, opts.start_tps.to_rate_limiter()),
            (OcrOperation::GetResults, opts.get_tps.to_rate_limiter()),
        ]);
        Self {
            opts,
            limiters,
            metrics,
            cache_ttl: Duration::from_secs(60),
            cached: Mutex::new(None),
        }
    }

    /// Override how long a concurrency estimate is reused.
    #[cfg(test)]
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// The configured concurrency cap.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.opts.max_concurrent_jobs
    }

    /// Wait until `operation` may be called again.
    ///
    /// Callers that had to wait also sleep for a short random jitter, so that
    /// parallel workers released together don't hit the service in lockstep.
    pub async fn wait_for_rate_limit(&self, operation: OcrOperation) {
        let Some(limiter) = self.limiters.get(&operation) else {
            return;
        };
        if limiter.try_acquire(1) {
            return;
        }
        limiter.acquire_one().await;
        let jitter =
            Duration::from_millis(rand::rng().random_range(0..=RATE_LIMIT_JITTER_MILLIS));
        trace!(%operation, ?jitter, "Rate limited OCR call");
        time::sleep(jitter).await;
    }

    /// One rate-limited attempt.
    async fn attempt<T, E, F, Fut>(
        &self,
        operation: OcrOperation,
        f: &F,
    ) -> RetryResult<(), (), T, anyhow::Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsKnownTransient + error::Error + Send + Sync + 'static,
    {
        self.wait_for_rate_limit(operation).await;
        let output = try_potentially_transient!(f().await);
        retry_result_ok(output)
    }

    /// Call the OCR service, respecting rate limits and retrying throttling
    /// errors with exponential backoff. Other errors are returned at once.
    #[instrument(level = "debug", skip_all, fields(%operation))]
    pub async fn call<T, E, F, Fut>(&self, operation: OcrOperation, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsKnownTransient + error::Error + Send + Sync + 'static,
    {
        let first_attempt = self.attempt(operation, &f).await;
        if self.opts.max_retries == 0 {
            return match first_attempt {
                RetryResult::Ok { output, .. } => Ok(output),
                RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                    Err(error)
                }
            };
        }

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: self.opts.backoff_range_millis(),
            re_attempts: self.opts.max_retries,
            jitter_ratio: 0.5,
        };
        let result = first_attempt
            .retry_with_async(|_| self.attempt(operation, &f))
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "OCR {operation} succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "OCR {operation} FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error
                .context(format!("OCR {operation} still throttled after retries"))),
        }
    }

    /// Estimate how many OCR jobs are running.
    ///
    /// Estimates are cached briefly. If the metrics query fails, we fall
    /// back to a conservative guess rather than blocking the pipeline.
    pub async fn current_concurrent_jobs(&self) -> usize {
        let mut cached = self.cached.lock().await;
        if let Some(estimate) = *cached
            && estimate.at.elapsed() < self.cache_ttl
        {
            return estimate.jobs;
        }

        let jobs = match self.metrics.request_counts(METRICS_WINDOW).await {
            Ok(counts) => {
                let jobs = estimate_concurrent_jobs(counts);
                debug!(?counts, jobs, "Estimated concurrent OCR jobs");
                jobs
            }
            Err(err) => {
                let fallback = 10.min(self.opts.max_concurrent_jobs / 4);
                warn!(
                    "Could not estimate concurrent OCR jobs, assuming {}: {:?}",
                    fallback, err
                );
                fallback
            }
        };
        *cached = Some(CachedEstimate {
            at: Instant::now(),
            jobs,
        });
        jobs
    }

    /// May we start another job right now?
    pub async fn can_start_new_job(&self) -> bool {
        let current = self.current_concurrent_jobs().await;
        let allowed = current < self.opts.max_concurrent_jobs;
        if !allowed {
            warn!(
                current,
                max = self.opts.max_concurrent_jobs,
                "OCR concurrency limit reached"
            );
        }
        allowed
    }

    /// Wait until a job slot is free, checking every `check_interval`, for at
    /// most `max_wait`.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait_for_job_slot(
        &self,
        max_wait: Duration,
        check_interval: Duration,
    ) -> Result<(), SlotWaitError> {
        let started = Instant::now();
        loop {
            if self.can_start_new_job().await {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(SlotWaitError::TimedOut {
                    waited,
                    current: self.current_concurrent_jobs().await,
                    max: self.opts.max_concurrent_jobs,
                });
            }
            let pause = check_interval.min(max_wait - waited);
            info!(
                "Waiting {:.1}s for an OCR job slot ({:.0}s elapsed)",
                pause.as_secs_f64(),
                waited.as_secs_f64()
            );
            time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Metrics that always report the same counts.
    struct FixedMetrics {
        counts: Option<RequestCounts>,
        queries: AtomicUsize,
    }

    impl FixedMetrics {
        fn started(started: f64) -> Arc<Self> {
            Arc::new(Self {
                counts: Some(RequestCounts {
                    started,
                    polled: 0.0,
                }),
                queries: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                counts: None,
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobMetrics for FixedMetrics {
        async fn request_counts(&self, _window: Duration) -> Result<RequestCounts> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.counts.ok_or_else(|| anyhow!("metrics unavailable"))
        }
    }

    #[derive(Debug)]
    struct FakeServiceError(&'static str);

    impl fmt::Display for FakeServiceError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl error::Error for FakeServiceError {}

    impl IsKnownTransient for FakeServiceError {
        fn is_known_transient(&self) -> bool {
            crate::retry::is_throttling_code(Some(self.0))
        }
    }

    fn fast_opts() -> ThrottleOpts {
        ThrottleOpts {
            start_tps: RateLimit::per_second(1000.0).unwrap(),
            get_tps: RateLimit::per_second(1000.0).unwrap(),
            max_retries: 3,
            base_delay: 0.001,
            max_delay: 0.004,
            ..ThrottleOpts::default()
        }
    }

    #[test]
    fn estimate_discounts_polls_and_caps_at_started() {
        let counts = |started, polled| RequestCounts { started, polled };
        assert_eq!(estimate_concurrent_jobs(counts(100.0, 0.0)), 100);
        assert_eq!(estimate_concurrent_jobs(counts(40.0, 200.0)), 30);
        assert_eq!(estimate_concurrent_jobs(counts(5.0, 500.0)), 0);
        assert_eq!(estimate_concurrent_jobs(counts(0.0, 0.0)), 0);
        // 2.5 jobs after discounting, 3.75 with the safety factor.
        assert_eq!(estimate_concurrent_jobs(counts(10.0, 75.0)), 3);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let opts = ThrottleOpts::default();
        assert_eq!(opts.backoff_range_millis(), 1000..=16_000);
        let opts = ThrottleOpts {
            max_retries: 10,
            ..ThrottleOpts::default()
        };
        assert_eq!(opts.backoff_range_millis(), 1000..=60_000);
    }

    #[tokio::test]
    async fn three_calls_at_one_tps_take_two_seconds() {
        let started = Instant::now();
        let opts = ThrottleOpts {
            start_tps: RateLimit::per_second(1.0).unwrap(),
            ..ThrottleOpts::default()
        };
        let throttler = OcrJobThrottler::new(opts, FixedMetrics::started(0.0));
        for _ in 0..3 {
            throttler.wait_for_rate_limit(OcrOperation::StartJob).await;
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_at_or_above_max() {
        let full = OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::started(100.0));
        assert!(full.current_concurrent_jobs().await >= 90);
        assert!(!full.can_start_new_job().await);

        let exactly_full =
            OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::started(90.0));
        assert!(!exactly_full.can_start_new_job().await);

        let room = OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::started(89.0));
        assert_eq!(room.current_concurrent_jobs().await, 89);
        assert!(room.can_start_new_job().await);
    }

    #[tokio::test]
    async fn metrics_failure_fails_open() {
        let throttler = OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::failing());
        assert_eq!(throttler.current_concurrent_jobs().await, 10);
        assert!(throttler.can_start_new_job().await);
    }

    #[tokio::test]
    async fn estimates_are_cached() {
        let metrics = FixedMetrics::started(3.0);
        let throttler = OcrJobThrottler::new(ThrottleOpts::default(), metrics.clone());
        throttler.current_concurrent_jobs().await;
        throttler.current_concurrent_jobs().await;
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 1);

        let throttler = OcrJobThrottler::new(ThrottleOpts::default(), metrics.clone())
            .with_cache_ttl(Duration::ZERO);
        throttler.current_concurrent_jobs().await;
        throttler.current_concurrent_jobs().await;
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slot_wait_times_out() {
        let throttler = OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::started(500.0));
        let result = throttler
            .wait_for_job_slot(Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(SlotWaitError::TimedOut { max: 90, .. })));

        let throttler = OcrJobThrottler::new(ThrottleOpts::default(), FixedMetrics::started(1.0));
        throttler
            .wait_for_job_slot(Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn throttling_errors_are_retried() -> Result<()> {
        let throttler = OcrJobThrottler::new(fast_opts(), FixedMetrics::started(0.0));
        let calls = AtomicUsize::new(0);
        let value = throttler
            .call(OcrOperation::GetResults, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeServiceError("ThrottlingException"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await?;
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let throttler = OcrJobThrottler::new(fast_opts(), FixedMetrics::started(0.0));
        let calls = AtomicUsize::new(0);
        let result = throttler
            .call(OcrOperation::StartJob, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FakeServiceError("InvalidParameterException")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
