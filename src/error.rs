use std::io;

/// Errors that end one of the relay's loops.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The peer closed the connection cleanly.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection I/O error: {0}")]
    ConnectionIo(#[from] io::Error),
    /// The game sent a malformed frame header. The connection is dropped.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// A second remote bring-up was attempted while the first was still pending.
    /// Fatal to the whole relay.
    #[error("remote bring-up still pending when the game reconnected")]
    ReentrancyFault,
    /// An outbound message matched the forbidden marker pattern.
    #[error("outbound message of {len} bytes carries the forbidden marker")]
    ProtocolHardFault { len: usize },
}

/// Malformed `<length>>payload` header from the game.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("no '>' delimiter within the first {0} header bytes")]
    HeaderTooLong(usize),
    #[error("invalid frame length {0:?}")]
    InvalidLength(String),
    #[error("frame length of {0} exceeds maximum allowed")]
    FrameTooLarge(usize),
}
