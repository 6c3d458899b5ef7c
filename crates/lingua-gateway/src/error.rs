use thiserror::Error;

use crate::stomp::FrameError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("no CONNECTED frame within the handshake timeout")]
    HandshakeTimeout,
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("peer silent for {0} heart-beat periods")]
    HeartbeatTimeout(u32),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
