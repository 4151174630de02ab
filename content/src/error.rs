//! Error types shared by every content target.

use std::fmt;
use std::io;

use crate::digest::Digest;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for content operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while moving, storing or verifying content.
///
/// Local stores and remote registries report failures with the same type, so
/// the copy engine can reason about them without knowing the backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Content did not hash to the digest it was advertised under.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Content length did not match the descriptor.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected size in bytes
        expected: u64,
        /// Actual size in bytes (a lower bound when the stream overran)
        actual: u64,
    },

    /// The blob, manifest or tag does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Manifest content violates the manifest schema.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// An upload chunk does not start where the accepted bytes end.
    #[error("range conflict: {accepted} bytes accepted, chunk starts at {offset}")]
    RangeConflict {
        /// Bytes already accepted by the session
        accepted: u64,
        /// Offset the rejected chunk started at
        offset: u64,
    },

    /// The registry rejected our credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The registry could not be reached or answered with a server error.
    #[error("registry unavailable: {message}")]
    RegistryUnavailable {
        /// What was being attempted
        message: String,
        /// Underlying transport error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// A network operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An API was used out of order, or a peer broke the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A reference resolved to more than one descriptor.
    #[error("ambiguous reference {reference}: {candidates:?}")]
    Ambiguous {
        /// The reference being resolved
        reference: String,
        /// The distinct digests it resolved to
        candidates: Vec<Digest>,
    },

    /// A string could not be parsed as a digest.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A string could not be parsed as a tag or reference.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// The registry refused the request with a client error.
    #[error("registry rejected request ({status}): {code}: {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// OCI error code, e.g. `MANIFEST_INVALID`
        code: String,
        /// Error message from the registry
        message: String,
    },

    /// The operation observed a cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// Local I/O failed.
    #[error("io: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    /// Create a [`Error::RegistryUnavailable`] from a transport error.
    pub fn unavailable<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::RegistryUnavailable {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The semantic category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Error::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::MalformedManifest(_) => ErrorKind::MalformedManifest,
            Error::RangeConflict { .. } => ErrorKind::RangeConflict,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::RegistryUnavailable { .. } => ErrorKind::RegistryUnavailable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::Ambiguous { .. } => ErrorKind::Ambiguous,
            Error::InvalidDigest(_) | Error::InvalidReference(_) => ErrorKind::InvalidInput,
            Error::Rejected { .. } => ErrorKind::Rejected,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Wrap this error in an [`io::Error`] so it can travel through
    /// `AsyncRead`/`AsyncWrite` implementations.
    pub fn into_io(self) -> io::Error {
        match self {
            Error::Io(error) => error,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<io::Error> for Error {
    /// Recovers a content error that was smuggled through an I/O stream.
    fn from(error: io::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(inner) => inner,
            Err(error) => Error::Io(error),
        }
    }
}

/// Categorizes content errors by their meaning, so callers can pick a
/// recovery strategy without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Content hashed to a different digest.
    ///
    /// **Retryable:** No. Indicates corruption or a registry bug.
    DigestMismatch,

    /// Content had a different length than advertised.
    ///
    /// **Retryable:** No.
    SizeMismatch,

    /// The requested item does not exist.
    ///
    /// **Retryable:** No.
    NotFound,

    /// Manifest failed schema validation.
    ///
    /// **Retryable:** No.
    MalformedManifest,

    /// An upload chunk overlapped, duplicated or skipped accepted bytes.
    ///
    /// **Retryable:** No, not with the same offset.
    RangeConflict,

    /// Credentials were refused.
    ///
    /// **Retryable:** Once, after refreshing credentials.
    Unauthorized,

    /// The registry is unreachable or failing.
    ///
    /// **Retryable:** Yes, with backoff.
    RegistryUnavailable,

    /// A deadline expired.
    ///
    /// **Retryable:** Yes, with backoff.
    Timeout,

    /// An API contract was broken.
    ///
    /// **Retryable:** No.
    ProtocolViolation,

    /// A reference resolved to several candidates.
    ///
    /// **Retryable:** No.
    Ambiguous,

    /// A digest, tag or reference failed to parse.
    ///
    /// **Retryable:** No.
    InvalidInput,

    /// The registry refused the request.
    ///
    /// **Retryable:** No.
    Rejected,

    /// The caller cancelled the operation.
    ///
    /// **Retryable:** No.
    Cancelled,

    /// Local I/O failed.
    ///
    /// **Retryable:** Maybe, depending on the cause.
    Io,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RegistryUnavailable | ErrorKind::Timeout)
    }

    /// Whether this kind means the content itself cannot be trusted.
    ///
    /// Integrity failures are never retried automatically.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ErrorKind::DigestMismatch | ErrorKind::SizeMismatch | ErrorKind::MalformedManifest
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DigestMismatch => write!(f, "digest mismatch"),
            ErrorKind::SizeMismatch => write!(f, "size mismatch"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::MalformedManifest => write!(f, "malformed manifest"),
            ErrorKind::RangeConflict => write!(f, "range conflict"),
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::RegistryUnavailable => write!(f, "registry unavailable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ProtocolViolation => write!(f, "protocol violation"),
            ErrorKind::Ambiguous => write!(f, "ambiguous"),
            ErrorKind::InvalidInput => write!(f, "invalid input"),
            ErrorKind::Rejected => write!(f, "rejected"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Io => write!(f, "I/O error"),
        }
    }
}
