//! The query collaborator seam, plus the retry and pacing decorators that sit
//! between the stitching fold and a rate-limited service.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{RawSeries, Window};

/// One window's answer, keyed by series identifier.
pub type WindowResponse = BTreeMap<String, RawSeries>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("quota exhausted: {0}")]
    TooManyRequests(String),
    #[error("request rejected: {0}")]
    Response(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("collaborator I/O failure: {0}")]
    Io(String),
}

impl FetchError {
    /// Quota and transport failures may clear up on their own; a rejected
    /// request or a local I/O error will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TooManyRequests(_) | FetchError::Transport(_))
    }
}

/// Issues one bounded query for every identifier in `keys`.
pub trait Fetch {
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError>;
}

impl<F> Fetch for F
where
    F: FnMut(&Window, &[String]) -> Result<WindowResponse, FetchError>,
{
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError> {
        self(window, keys)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Seconds; the n-th retry waits `backoff_factor * 2^(n-1)`.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_factor: 0.0,
        }
    }
}

/// Longest single backoff sleep, in seconds.
pub const MAX_BACKOFF_SECS: f64 = 120.0;

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_factor.is_finite() && self.backoff_factor >= 0.0 {
            Ok(())
        } else {
            Err(format!(
                "backoff_factor must be a non-negative number, got {}",
                self.backoff_factor
            ))
        }
    }

    /// Sleep before retry number `retry`, capped at [`MAX_BACKOFF_SECS`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || !(self.backoff_factor > 0.0) {
            return Duration::ZERO;
        }
        let exp = 2f64.powi(retry.saturating_sub(1).min(30) as i32);
        let secs = self.backoff_factor * exp;
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
        } else {
            Duration::from_secs_f64(MAX_BACKOFF_SECS)
        }
    }
}

pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: Fetch> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Fetch> Fetch for RetryingFetcher<F> {
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError> {
        let mut retry = 0;
        loop {
            match self.inner.fetch(window, keys) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && retry < self.policy.retries => {
                    retry += 1;
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        "Fetch of {} failed ({}); retry {}/{} in {:.1}s",
                        window.timeframe(),
                        err,
                        retry,
                        self.policy.retries,
                        delay.as_secs_f64()
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Keeps at least `interval` between the starts of consecutive queries.
pub struct PacedFetcher<F> {
    inner: F,
    interval: Duration,
    last_call: Option<Instant>,
}

impl<F: Fetch> PacedFetcher<F> {
    pub fn new(inner: F, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_call: None,
        }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Fetch> Fetch for PacedFetcher<F> {
    fn fetch(&mut self, window: &Window, keys: &[String]) -> Result<WindowResponse, FetchError> {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                let wait = self.interval - elapsed;
                debug!("Pacing: sleeping {:.0} ms", wait.as_secs_f64() * 1000.0);
                thread::sleep(wait);
            }
        }
        self.last_call = Some(Instant::now());
        self.inner.fetch(window, keys)
    }
}
