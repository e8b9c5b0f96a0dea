//! Error types for the activation client
//!
//! Every failure that crosses the network carries the [`Stage`] it happened in and,
//! where the provider answered, the HTTP status and a short snippet of the body.
//! That is enough to tell a provider-side policy change apart from a transport error.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, KindlepassError>;

/// Maximum number of body characters kept in an error
pub const BODY_SNIPPET_LEN: usize = 200;

/// Step of the activation exchange an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoginPage,
    Credentials,
    Challenge,
    Registration,
    Activation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LoginPage => "login page",
            Stage::Credentials => "credential submission",
            Stage::Challenge => "challenge submission",
            Stage::Registration => "device registration",
            Stage::Activation => "activation request",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum KindlepassError {
    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------
    #[error("invalid credentials: {message}")]
    InvalidCredentials { message: String },

    #[error("unsupported challenge during {stage}: {detail}")]
    UnsupportedChallenge { stage: Stage, detail: String },

    #[error("transient network error during {stage} (attempt {attempt}): {message}")]
    TransientNetwork {
        stage: Stage,
        attempt: u32,
        message: String,
    },

    #[error("{stage} failed{}: {message}", status_suffix(.status))]
    RetrievalFailed {
        stage: Stage,
        status: Option<u16>,
        message: String,
        body_snippet: Option<String>,
    },

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------
    #[error("malformed activation blob at offset {offset}: {reason}")]
    MalformedBlob { offset: usize, reason: String },

    #[error("activation blob has no activation key group")]
    MissingActivationGroup,

    // ------------------------------------------------------------------
    // Devices and files
    // ------------------------------------------------------------------
    #[error("failed to write license to {path:?}: {source}")]
    DeviceWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no device matches {0:?}")]
    DeviceNotFound(String),

    // ------------------------------------------------------------------
    // General
    // ------------------------------------------------------------------
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("activation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KindlepassError {
    /// Build a retrieval failure from a provider response
    pub fn retrieval(stage: Stage, status: Option<u16>, message: impl Into<String>, body: &str) -> Self {
        KindlepassError::RetrievalFailed {
            stage,
            status,
            message: message.into(),
            body_snippet: snippet(body),
        }
    }

    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        KindlepassError::MalformedBlob {
            offset,
            reason: reason.into(),
        }
    }

    /// Errors that end the current attempt and must not be retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KindlepassError::InvalidCredentials { .. }
                | KindlepassError::UnsupportedChallenge { .. }
                | KindlepassError::MalformedBlob { .. }
                | KindlepassError::MissingActivationGroup
        )
    }

    /// Errors worth retrying locally
    pub fn is_transient(&self) -> bool {
        match self {
            KindlepassError::TransientNetwork { .. } => true,
            KindlepassError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Stage of the exchange the error belongs to, when known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            KindlepassError::UnsupportedChallenge { stage, .. }
            | KindlepassError::TransientNetwork { stage, .. }
            | KindlepassError::RetrievalFailed { stage, .. } => Some(*stage),
            KindlepassError::InvalidCredentials { .. } => Some(Stage::Credentials),
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {}", s)).unwrap_or_default()
}

/// Trim a response body for inclusion in an error
pub fn snippet(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(BODY_SNIPPET_LEN).collect())
}
