//! Error types for the integration crate.

use std::fmt;

/// Errors from invoking an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocationError {
    /// The user has not authorized the tool yet.
    ///
    /// Not a failure of the tool itself: the caller completes the
    /// authorization out of band and then retries.
    AuthRequired {
        tool: String,
        authorization_url: Option<String>,
        authorization_id: Option<String>,
    },
    /// Connection to the tool provider failed.
    ConnectionFailed { reason: String },
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Timeout waiting for the provider.
    Timeout,
    /// The provider answered with an error status.
    ServiceError { status: u16, reason: String },
    /// The tool rejected its input.
    InvalidInput { tool: String, reason: String },
    /// The tool ran and reported a failure.
    Failed { tool: String, reason: String },
    /// The invoker cannot serve this kind of tool target.
    Unsupported { target: String },
}

impl ToolInvocationError {
    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::RateLimited { .. } | Self::Timeout => true,
            Self::ServiceError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Builds an error from a reqwest transport failure.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailed {
                reason: err.to_string(),
            }
        }
    }
}

impl fmt::Display for ToolInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRequired {
                tool,
                authorization_url,
                ..
            } => match authorization_url {
                Some(url) => write!(f, "tool '{tool}' requires authorization: {url}"),
                None => write!(f, "tool '{tool}' requires authorization"),
            },
            Self::ConnectionFailed { reason } => write!(f, "connection failed: {reason}"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::Timeout => write!(f, "tool invocation timed out"),
            Self::ServiceError { status, reason } => {
                write!(f, "tool provider returned {status}: {reason}")
            }
            Self::InvalidInput { tool, reason } => {
                write!(f, "invalid input for tool '{tool}': {reason}")
            }
            Self::Failed { tool, reason } => write!(f, "tool '{tool}' failed: {reason}"),
            Self::Unsupported { target } => write!(f, "unsupported tool target: {target}"),
        }
    }
}

impl std::error::Error for ToolInvocationError {}
