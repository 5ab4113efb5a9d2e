use thiserror::Error;

use crate::ratelimit::RateLimitInfo;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("rate limited (resets {})", .info.reset_human)]
    RateLimited {
        info: RateLimitInfo,
        /// The subprocess error that accompanied the rate limit, if any.
        /// A CLI can report a rate limit and still exit zero.
        source: Option<Box<LoopError>>,
    },

    #[error("command failed with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("create output file {path}: {source}")]
    CreateOutputFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("max retries ({0}) exceeded")]
    MaxRetries(u32, #[source] Box<LoopError>),

    #[error("max rate limit waits ({0}) exceeded")]
    MaxRateLimitWaits(u32, #[source] Box<LoopError>),

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported state schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error(
        "tasks file changed since session start (hash mismatch); rerun with --resume-force to override"
    )]
    HashMismatch,

    #[error("no session found in {0}")]
    NoSession(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not parse reset time: {0}")]
    ResetParse(String),

    #[error("no verdict block found in validator output")]
    NoVerdict,

    #[error("output parse error: {0}")]
    OutputParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LoopError {
    /// True for errors the retry wrapper routes down the distinguished
    /// rate-limit path rather than the normal backoff path.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// True when the error is (or wraps) a cancellation. Cancellation is
    /// propagated unchanged and mapped to Interrupted at the orchestrator
    /// boundary, never retried.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::MaxRetries(_, inner) | Self::MaxRateLimitWaits(_, inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::RateLimited { info, .. } => Some(info),
            _ => None,
        }
    }
}
