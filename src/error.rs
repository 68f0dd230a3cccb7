use std::{error, fmt, io, result};

pub type Result<T> = result::Result<T, Error>;

/// The kind of a security layer error. Enables the caller to inspect the error
/// and decide on a recovery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No mechanism provider is registered under the requested identifier.
    UnknownMechanism,
    /// The mechanism provider refused the supplied identity material.
    IdentityRejected,
    /// A provider-level resource could not be allocated.
    ResourceExhausted,
    /// The supplied token is truncated. Retryable: the caller is expected to
    /// buffer `bytes_needed` more transport bytes and retry the same step.
    IncompleteToken { bytes_needed: usize },
    /// The peer (or the caller) violated the mechanism's state machine. Fatal
    /// for the context.
    ProtocolViolation,
    /// The integrity check of a protected message failed.
    MessageAltered,
    /// The embedded sequence number does not match the expected one. May
    /// indicate reordering or a dropped/duplicated message.
    OutOfSequence,
    /// The operation is not offered by the negotiated flags or the mechanism.
    UnsupportedOperation,
    /// Use of a released or never-initialized handle.
    InvalidHandle,
    /// The requested value is only meaningful once the context is established.
    NotYetAvailable,
    /// The credential is still referenced by one or more live contexts.
    CredentialInUse,
    /// A malformed argument supplied by the caller.
    InvalidParameter,
    /// May correspond to any internal error (I/O error, conversion error, etc.).
    InternalError,
}

/// Holds the [`ErrorKind`] and the description of the error.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
}

impl Error {
    /// Allows to fill a new error easily, supplying it with a coherent description.
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Whether the caller may retry the failed call after supplying more input.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::IncompleteToken { .. })
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::InternalError, format!("IO error: {:?}", err))
    }
}

impl From<rand::Error> for Error {
    fn from(err: rand::Error) -> Self {
        Self::new(ErrorKind::InternalError, format!("rand error: {:?}", err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, format!("{:?}: {}", err.kind, err.description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_token_is_retryable() {
        let err = Error::new(ErrorKind::IncompleteToken { bytes_needed: 12 }, "short read");
        assert!(err.is_retryable());

        let err = Error::new(ErrorKind::MessageAltered, "bad checksum");
        assert!(!err.is_retryable());
    }
}
