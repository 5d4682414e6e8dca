//! Error taxonomy for the transfer pipeline.
//!
//! Every fallible pipeline operation returns [`TransferError`]. Callers that
//! need to branch on the failure class (the CLI exit path, the poller) use
//! [`TransferError::kind`] rather than matching variants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-correctable input problem. Transfer state is unchanged.
    Validation,
    /// The gateway answered an init/finish/status call with a failure.
    RemoteProtocol,
    /// A single chunk PUT failed. Parts already uploaded stay uploaded.
    ChunkUpload,
    /// A status check could not be completed and the transfer was declined.
    PollDecline,
    /// Local plumbing failure (disk, database, crypto primitives).
    Internal,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0}")]
    Validation(String),

    #[error("{endpoint} failed with HTTP {status}: {body}")]
    RemoteProtocol {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("gateway did not issue an upload slot for {0}")]
    MissingUploadSlot(String),

    #[error("error uploading file {file}: {message}")]
    ChunkUpload { file: String, message: String },

    #[error("status check failed, transfer declined: {0}")]
    PollDecline(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed gateway payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("transfer {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TransferError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) => ErrorKind::Validation,
            Self::RemoteProtocol { .. }
            | Self::MissingUploadSlot(_)
            | Self::Transport(_)
            | Self::Payload(_) => ErrorKind::RemoteProtocol,
            Self::ChunkUpload { .. } => ErrorKind::ChunkUpload,
            Self::PollDecline(_) => ErrorKind::PollDecline,
            Self::Crypto(_) | Self::Archive(_) | Self::Io(_) | Self::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Text recorded as a transfer's error description when a remote call
    /// fails: the raw response body when there was one.
    pub fn response_text(&self) -> String {
        match self {
            Self::RemoteProtocol { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}
