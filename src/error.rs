use std::io;
use thiserror::Error;

/// Wire-level framing defects in a DDC/CI reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Reply length byte does not have the high bit set.
    #[error("missing DDC/CI length bit")]
    MissingLengthBit,
    /// Declared payload length exceeds the bytes actually read,
    /// or lies outside the protocol bounds.
    #[error("invalid DDC/CI packet length {0}")]
    InvalidLength(usize),
    /// XOR checksum over the reply did not match the trailing byte.
    #[error("DDC/CI checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    ChecksumMismatch { expected: u8, actual: u8 },
    /// Fewer bytes on the wire than the smallest legal frame.
    #[error("truncated DDC/CI reply ({0} bytes)")]
    Truncated(usize),
}

/// Well-formed replies that nonetheless refuse or defer the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemanticError {
    /// Zero-length reply: the monitor is busy and asks to be retried.
    #[error("null reply (monitor busy)")]
    NullReply,
    /// Reply opcode does not match the request.
    #[error("unexpected reply opcode {0:#04x}")]
    UnexpectedOpcode(u8),
    /// The monitor reported the VCP feature as unsupported.
    #[error("unsupported VCP code {0:#04x}")]
    UnsupportedVcpCode(u8),
    /// A value in the reply payload is outside its legal range.
    #[error("reply payload out of range: {0}")]
    OutOfRange(String),
    /// Fragment offset of a multi-part reply did not advance as expected.
    #[error("fragment offset mismatch (expected {expected}, got {actual})")]
    FragmentOffset { expected: u16, actual: u16 },
}

/// The closed set of errors surfaced by this crate.
///
/// Transport-level errno is carried verbatim in [`Error::Transport`] and is
/// never conflated with DDC-layer failures. The packet layer wraps a
/// transport error exactly once, classifies it retryable or fatal, and
/// either consumes it through retry or surfaces it.
#[derive(Debug, Error)]
pub enum Error {
    /// I2C/transport failure, errno preserved.
    #[error("I2C transport error")]
    Transport(#[source] io::Error),
    /// The reply could not be parsed as a DDC/CI frame.
    #[error("protocol framing error")]
    Framing(#[source] FramingError),
    /// The reply parsed but refused or deferred the request.
    #[error("protocol error")]
    Semantics(#[source] SemanticError),
    /// A retryable failure persisted beyond the configured try count.
    #[error("giving up after {tries} tries")]
    RetryExhausted {
        tries: u8,
        #[source]
        last: Box<Error>,
    },
    /// The operation discovered that the monitor is gone.
    #[error("display disconnected")]
    Disconnected,
    /// The bus lacks kernel functionality required for the operation.
    #[error("bus lacks required I2C functionality")]
    Unsupported,
    /// The watcher or client signalled cancellation mid-operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Invariant violation; not observed externally in correct use.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}

impl From<SemanticError> for Error {
    fn from(e: SemanticError) -> Self {
        Error::Semantics(e)
    }
}

impl Error {
    /// Whether the packet layer should try the exchange again.
    ///
    /// Null replies, framing corruption, and transient errno (EBUSY,
    /// EAGAIN, EIO) are retryable. An unsupported-opcode reply, a fatal
    /// errno (ENXIO, ENODEV), and everything above the packet layer are
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Framing(_) => true,
            Error::Semantics(SemanticError::NullReply) => true,
            Error::Transport(e) => matches!(
                e.raw_os_error(),
                Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EIO)
            ),
            _ => false,
        }
    }

    /// Stable short name used by the statistics counters.
    pub fn stat_key(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Framing(FramingError::MissingLengthBit) => "missing-length-bit",
            Error::Framing(FramingError::InvalidLength(_)) => "invalid-length",
            Error::Framing(FramingError::ChecksumMismatch { .. }) => "checksum-mismatch",
            Error::Framing(FramingError::Truncated(_)) => "truncated",
            Error::Semantics(SemanticError::NullReply) => "null-reply",
            Error::Semantics(SemanticError::UnexpectedOpcode(_)) => "unexpected-opcode",
            Error::Semantics(SemanticError::UnsupportedVcpCode(_)) => "unsupported-vcp-code",
            Error::Semantics(SemanticError::OutOfRange(_)) => "out-of-range",
            Error::Semantics(SemanticError::FragmentOffset { .. }) => "fragment-offset",
            Error::RetryExhausted { .. } => "retry-exhausted",
            Error::Disconnected => "disconnected",
            Error::Unsupported => "unsupported",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a transport error indicates the device itself vanished.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Transport(e) => matches!(
                e.raw_os_error(),
                Some(libc::ENXIO) | Some(libc::ENODEV)
            ),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errno_is_retryable() {
        for errno in [libc::EBUSY, libc::EAGAIN, libc::EIO] {
            let e = Error::Transport(io::Error::from_raw_os_error(errno));
            assert!(e.is_retryable(), "errno {} should be retryable", errno);
        }
    }

    #[test]
    fn fatal_errno_is_not_retryable() {
        for errno in [libc::ENXIO, libc::ENODEV, libc::EACCES] {
            let e = Error::Transport(io::Error::from_raw_os_error(errno));
            assert!(!e.is_retryable(), "errno {} should be fatal", errno);
        }
        let e = Error::Transport(io::Error::from_raw_os_error(libc::ENODEV));
        assert!(e.is_disconnect());
    }

    #[test]
    fn protocol_classification() {
        assert!(Error::Framing(FramingError::ChecksumMismatch { expected: 1, actual: 2 }).is_retryable());
        assert!(Error::Semantics(SemanticError::NullReply).is_retryable());
        assert!(!Error::Semantics(SemanticError::UnsupportedVcpCode(0x10)).is_retryable());
        assert!(!Error::Disconnected.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
