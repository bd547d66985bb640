use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("Unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("Bad control message")]
    BadMessage(#[from] bincode::Error),
    #[error("Stream ended after {got} of {want} bytes")]
    ShortStream { want: u64, got: u64 },
    #[error("Invalid stream size {0}")]
    BadStreamSize(i64),
    #[error("Handshake rejected")]
    HandshakeFailed,
    #[error("Peer rejected")]
    PeerRejected,
    #[error("Invalid segment length {0}")]
    BadSegmentLen(usize),
    #[error("Not found")]
    NotFound,
    #[error("No stream pending on peer")]
    NoStream,
    #[error("Transport already consumed")]
    AlreadyConsumed,
    #[error("IOError")]
    Disconnect(#[from] io::Error),
}

impl StashError {
    /// Whether this error came from the remote end going away rather
    /// than a local fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            StashError::Disconnect(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
