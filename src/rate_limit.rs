//! Support for specifying rate limits for calling various APIs.
//!
//! OCR quotas are published as fractional transactions per second, so unlike
//! a simple "N requests per window" bucket, we space out individual calls.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a [`Duration`].
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an API, possibly fractional (`"1.8/s"`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: f64,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    pub fn new(max_requests: f64, per_period: RateLimitPeriod) -> Result<Self> {
        if !max_requests.is_finite() || max_requests <= 0.0 {
            return Err(anyhow!(
                "rate limit must be a positive number, got {}",
                max_requests
            ));
        }
        Ok(Self {
            max_requests,
            per_period,
        })
    }

    /// A limit expressed in transactions per second.
    #[cfg(test)]
    pub fn per_second(tps: f64) -> Result<Self> {
        Self::new(tps, RateLimitPeriod::Second)
    }

    /// The minimum spacing between two consecutive calls.
    pub fn min_interval(&self) -> Duration {
        self.per_period.to_duration().div_f64(self.max_requests)
    }

    /// Create a [`RateLimiter`] for this rate limit.
    ///
    /// The bucket holds a single token, so a burst of callers is released one
    /// at a time, [`Self::min_interval`] apart.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(1)
            .refill(1)
            .max(1)
            .interval(self.min_interval())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let mut parts = s.splitn(2, '/');
            let max_requests = parts
                .next()
                .ok_or_else(|| anyhow!("Missing max requests"))?
                .parse::<f64>()?;
            let per_period = parts
                .next()
                .unwrap_or("s")
                .parse::<RateLimitPeriod>()?;
            Self::new(max_requests, per_period)
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
