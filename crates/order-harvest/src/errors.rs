//! Error taxonomy with retry classification.
//!
//! Every error raised by a pipeline stage or external adapter is represented
//! here. Retry loops query `retry_category()` instead of matching on strings.
//!
//! ## Retry categories
//!
//! | Category     | Retriable | Typical source                          |
//! |--------------|-----------|-----------------------------------------|
//! | Timeout      | yes       | LLM call exceeded its per-call timeout  |
//! | RateLimit    | yes       | HTTP 429 / 529 from the LLM service     |
//! | Transient    | yes       | any other transport or backend failure  |
//! | ParseFailure | yes       | reply does not honour the output contract |
//! | Terminal     | no        | configuration, checkpoint I/O           |

use std::fmt;

use thiserror::Error;

/// Classification used by `RetryPolicy` to pick a backoff tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCategory {
    /// The call did not answer within its timeout.
    Timeout,
    /// The service asked us to slow down.
    RateLimit,
    /// Network or backend error with no more specific class.
    Transient,
    /// The model answered, but not in the expected shape.
    ParseFailure,
    /// Not worth retrying.
    Terminal,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        !matches!(self, Self::Terminal)
    }

    /// Classify an error that only exists as text.
    ///
    /// Matches the case-folded message against "timeout" / "timed out" and
    /// "rate"; everything else is transient.
    pub fn from_error_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("rate") {
            Self::RateLimit
        } else {
            Self::Transient
        }
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Transient => write!(f, "transient"),
            Self::ParseFailure => write!(f, "parse_failure"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Unified error type for the harvesting pipeline.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ── Retriable ─────────────────────────────────────────────────────────
    /// The LLM call exceeded its timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Rate limit or overload response.
    #[error("Rate limit: {0}")]
    RateLimit(String),

    /// Transport failure or non-success status.
    #[error("Request failed: {0}")]
    Request(String),

    /// The reply could not be interpreted under the stage's output contract.
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    /// The message gateway returned something unusable.
    #[error("Message source error: {0}")]
    Source(String),

    // ── Non-retriable ─────────────────────────────────────────────────────
    /// Reading or writing the checkpoint file failed.
    #[error("Checkpoint I/O error: {0}")]
    Checkpoint(#[from] std::io::Error),

    /// Configuration is invalid or missing required fields.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A retry loop gave up.
    #[error("{label} failed after {attempts} attempts: {last}")]
    Exhausted {
        label: String,
        attempts: u32,
        last: Box<HarvestError>,
    },
}

impl HarvestError {
    /// Classify this error for retry logic.
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Timeout(_) => RetryCategory::Timeout,
            Self::RateLimit(_) => RetryCategory::RateLimit,
            Self::Request(msg) | Self::Source(msg) => match RetryCategory::from_error_text(msg) {
                RetryCategory::Timeout => RetryCategory::Timeout,
                RetryCategory::RateLimit => RetryCategory::RateLimit,
                _ => RetryCategory::Transient,
            },
            Self::ParseFailure(_) => RetryCategory::ParseFailure,
            Self::Checkpoint(_) | Self::Configuration(_) | Self::Exhausted { .. } => {
                RetryCategory::Terminal
            }
        }
    }

    /// Returns `true` if a retry loop may try again after this error.
    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// Error text cut to `max_chars` characters, for log lines.
    pub fn truncated(&self, max_chars: usize) -> String {
        truncate_chars(&self.to_string(), max_chars)
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            Self::RateLimit(err.to_string())
        } else if err.is_decode() {
            Self::ParseFailure(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Cut `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
