// ABOUTME: Error code space and crate-wide error type for muxado sessions
// ABOUTME: Wire codes travel in RST and GOAWAY frames; Error covers local failures too

use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::io;
use thiserror::Error;

/// Wire-level error codes carried by RST and GOAWAY frames.
///
/// Values 0-15 are reserved by the protocol; everything above is free for
/// applications to define, and unknown values decode losslessly into
/// [`ErrorCode::Other`].
#[derive(FromPrimitive, IntoPrimitive)]
#[repr(u32)]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Copy)]
pub enum ErrorCode {
    /// Clean termination, nothing went wrong
    NoError = 0,
    /// Peer violated the framing or session rules
    ProtocolError = 1,
    /// Unexpected internal failure (bug, panic)
    InternalError = 2,
    /// Peer sent more data than the advertised window allows
    FlowControlError = 3,
    /// The accept queue stayed full, the stream was dropped
    AcceptQueueFull = 4,
    /// Frame arrived for a stream that is already closed
    StreamClosed = 5,
    /// Stream was refused before any data was exchanged
    StreamRefused = 6,
    /// Stream was cancelled by the local endpoint
    StreamCancelled = 7,
    /// Stream was abortively reset
    StreamReset = 8,
    /// Frame length or body size violated the wire format
    FrameSizeError = 9,
    /// Peer asks the local endpoint to reduce its load
    EnhanceYourCalm = 10,
    /// Peer sent GOAWAY, no new streams will be processed
    RemoteGoneAway = 11,
    /// The 31-bit stream id space is used up
    StreamsExhausted = 12,
    /// A synchronous write missed its deadline
    WriteTimeout = 13,
    /// The session shut down
    SessionClosed = 14,
    /// The transport reached EOF
    PeerEof = 15,
    /// Application-defined code (16 and above)
    #[num_enum(catch_all)]
    Other(u32),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "application error {code}"),
            known => write!(f, "{known:?} ({})", u32::from(*known)),
        }
    }
}

/// Error returned by session and stream operations.
///
/// Terminal conditions are handed to every operation blocked on a dead
/// session or stream, so the type is `Clone`; transport I/O errors are
/// captured as kind + message for that reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("flow control window exceeded")]
    FlowControl,

    #[error("accept queue full")]
    AcceptQueueFull,

    #[error("stream closed")]
    StreamClosed,

    #[error("stream refused")]
    StreamRefused,

    #[error("stream cancelled")]
    StreamCancelled,

    #[error("stream reset by peer: {0}")]
    StreamReset(ErrorCode),

    #[error("frame size violation: {0}")]
    FrameSize(String),

    #[error("peer requested reduced load")]
    EnhanceYourCalm,

    #[error("remote endpoint has gone away")]
    RemoteGoneAway,

    #[error("stream ids exhausted")]
    StreamsExhausted,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("session closed")]
    SessionClosed,

    #[error("transport closed by peer")]
    PeerEof,

    /// Read deadline expired. Local condition, never put on the wire.
    #[error("read deadline exceeded")]
    DeadlineExceeded,

    /// The inbound buffer cap was exceeded. Converted into an
    /// RST(`FlowControlError`) before the peer sees it.
    #[error("inbound buffer full")]
    BufferFull,

    #[error("transport error: {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },
}

impl Error {
    /// The wire code used when this error is reported to the peer in an
    /// RST or GOAWAY frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::Internal(_) => ErrorCode::InternalError,
            Error::FlowControl | Error::BufferFull => ErrorCode::FlowControlError,
            Error::AcceptQueueFull => ErrorCode::AcceptQueueFull,
            Error::StreamClosed => ErrorCode::StreamClosed,
            Error::StreamRefused => ErrorCode::StreamRefused,
            Error::StreamCancelled | Error::DeadlineExceeded => ErrorCode::StreamCancelled,
            Error::StreamReset(_) => ErrorCode::StreamReset,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::EnhanceYourCalm => ErrorCode::EnhanceYourCalm,
            Error::RemoteGoneAway => ErrorCode::RemoteGoneAway,
            Error::StreamsExhausted => ErrorCode::StreamsExhausted,
            Error::WriteTimeout => ErrorCode::WriteTimeout,
            Error::SessionClosed => ErrorCode::SessionClosed,
            Error::PeerEof => ErrorCode::PeerEof,
            Error::Io { .. } => ErrorCode::InternalError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // A clean EOF from the transport has its own code so that wait()
        // can distinguish "peer hung up" from a genuine I/O failure.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::PeerEof
        } else {
            Error::Io {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }
}

/// A specialized `Result` type for muxado operations.
pub type Result<T> = std::result::Result<T, Error>;
