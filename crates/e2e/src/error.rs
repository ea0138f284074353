//! Error types for browser-driven verification

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Navigation failed: {0}")]
    TransientNetwork(String),

    #[error("Rate limited after {attempts} attempt(s): {url}")]
    RateLimited { url: String, attempts: u32 },

    #[error("Interaction blocked: {0}")]
    InteractionBlocked(String),

    #[error("Cannot decode image {}: {source}", path.display())]
    DecodeFailure {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Refresh delegate failed: {0}")]
    DelegateFailure(String),

    #[error("Cannot create isolated browser context: {0}")]
    ContextUnavailable(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Playwright bridge closed")]
    BridgeClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Common(#[from] cartcheck_common::Error),
}

/// Failure classes the verification pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    InteractionBlocked,
    DiffFailure,
    DelegateFailure,
    ResourceAcquisition,
    Internal,
}

impl E2eError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            E2eError::TransientNetwork(_) | E2eError::Timeout(_) => ErrorKind::TransientNetwork,
            E2eError::RateLimited { .. } => ErrorKind::RateLimited,
            E2eError::InteractionBlocked(_) => ErrorKind::InteractionBlocked,
            E2eError::DecodeFailure { .. } | E2eError::Image(_) => ErrorKind::DiffFailure,
            E2eError::DelegateFailure(_) => ErrorKind::DelegateFailure,
            E2eError::ContextUnavailable(_)
            | E2eError::PlaywrightNotFound
            | E2eError::BridgeClosed => ErrorKind::ResourceAcquisition,
            E2eError::Playwright(_)
            | E2eError::Io(_)
            | E2eError::Json(_)
            | E2eError::Common(_) => ErrorKind::Internal,
        }
    }

    /// Whether a navigation retry may help.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientNetwork | ErrorKind::RateLimited)
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
