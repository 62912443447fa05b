//! Protocol decoding errors.

use thiserror::Error;

/// Errors raised while decoding envelope payloads or stdio frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The `data` field was not valid standard base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// A stdio frame header named a stream other than stdout or stderr.
    #[error("invalid stdio frame stream id: {0}")]
    InvalidStream(u8),

    /// A payload does not fit in the 32-bit frame length field.
    #[error("stdio frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Underlying I/O failure while framing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
