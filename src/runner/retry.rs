use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;
use crate::ratelimit::{self, RateLimitInfo, UNPARSEABLE_WAIT};
use crate::runner::AiRunner;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_rate_limit_waits: u32,
    /// Resume offsets: start at the k-th non-rate-limit attempt with delay
    /// `base · 2^k`.
    pub start_attempt: u32,
    pub start_delay_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 5,
            max_rate_limit_waits: 3,
            start_attempt: 0,
            start_delay_secs: None,
        }
    }
}

impl RetryPolicy {
    pub fn resuming_from(mut self, attempt: u32, delay_secs: u64) -> Self {
        self.start_attempt = attempt;
        self.start_delay_secs = if delay_secs > 0 { Some(delay_secs) } else { None };
        self
    }

    fn initial_delay(&self) -> u64 {
        self.start_delay_secs.unwrap_or_else(|| {
            self.base_delay_secs
                .saturating_mul(1u64 << self.start_attempt.min(32))
        })
    }
}

/// Hooks invoked from inside the retry loop, used by the orchestrator to
/// checkpoint the session between attempts.
pub trait RetryObserver: Send {
    fn on_retry(&mut self, _attempt: u32, _delay_secs: u64) {}
    fn on_rate_limit(&mut self, _waits: u32, _info: &RateLimitInfo) {}
}

pub struct NoopObserver;

impl RetryObserver for NoopObserver {}

/// Exponential-backoff retry with a distinguished rate-limit path.
///
/// Non-rate-limit errors consume attempts and double the delay
/// (`base, 2·base, 4·base, …`). Rate-limit errors consume a separate
/// waits budget instead: the loop sleeps until the parsed reset (or a
/// fixed fallback when unparseable) and retries without touching the
/// attempt counter or the delay, so the backoff sequence stays
/// deterministic regardless of rate-limit interruptions.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    observer: &mut dyn RetryObserver,
    mut op: F,
) -> Result<T, LoopError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LoopError>>,
{
    let mut attempt = policy.start_attempt;
    let mut delay_secs = policy.initial_delay();
    let mut rate_limit_waits: u32 = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if err.is_cancelled() {
            return Err(err);
        }

        if let LoopError::RateLimited { info, .. } = &err {
            let info = info.clone();
            rate_limit_waits += 1;
            if rate_limit_waits >= policy.max_rate_limit_waits {
                return Err(LoopError::MaxRateLimitWaits(
                    policy.max_rate_limit_waits,
                    Box::new(err),
                ));
            }
            observer.on_rate_limit(rate_limit_waits, &info);
            if info.parseable {
                ratelimit::wait_for_reset(&info, cancel).await?;
            } else {
                tracing::warn!(
                    wait_secs = UNPARSEABLE_WAIT.as_secs(),
                    "rate limited with no parseable reset; using fallback wait"
                );
                sleep_cancellable(UNPARSEABLE_WAIT, cancel).await?;
            }
            continue;
        }

        if attempt >= policy.max_retries {
            return Err(LoopError::MaxRetries(policy.max_retries, Box::new(err)));
        }
        tracing::warn!(attempt, delay_secs, error = %err, "attempt failed; backing off");
        observer.on_retry(attempt, delay_secs);
        sleep_cancellable(Duration::from_secs(delay_secs), cancel).await?;
        delay_secs = delay_secs.saturating_mul(2);
        attempt += 1;
    }
}

/// Sleep that returns `Cancelled` the moment the token fires.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), LoopError> {
    tokio::select! {
        () = cancel.cancelled() => Err(LoopError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Decorator composing any runner with [`run_with_retry`].
pub struct RetryRunner<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R> RetryRunner<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<R: AiRunner> AiRunner for RetryRunner<R> {
    async fn run(
        &self,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError> {
        run_with_retry(&self.policy, cancel, &mut NoopObserver, || {
            self.inner.run(prompt, output_path, cancel)
        })
        .await
    }
}
