use thiserror::Error;
use uuid::Uuid;

/// Why a container or token was refused.
///
/// Rejections are local, typed outcomes: none of them carry plaintext, and
/// none of them modify the container on disk.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("password does not match the container key hash")]
    BadPassword,

    #[error("payload authentication failed (tampered header or wrong allow-list state)")]
    TamperedOrWrongState,

    #[error("token was issued for a different file")]
    WrongFile,

    #[error("token has expired")]
    Expired,

    #[error("token signature does not verify against the owner key")]
    BadSignature,
}

#[derive(Error, Debug)]
pub enum SmaError {
    #[error("Invalid magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("Unsupported container version: {0}")]
    BadVersion(u8),

    #[error("Malformed container: {0}")]
    Malformed(String),

    #[error("Owner header signature verification failed")]
    BadHeaderSignature,

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Unexpected end of payload stream: expected {expected} bytes, read {read}")]
    UnexpectedEndOfStream { expected: u64, read: u64 },

    #[error("Content hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Key error: {0}")]
    Key(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown layer or actor: {0}")]
    UnknownLayer(Uuid),

    #[error("Layer {0} is still referenced by an actor")]
    LayerInUse(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SmaError {
    /// The rejection reason, if this error is a rejection.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            SmaError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SmaError>;
