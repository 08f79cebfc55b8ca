use std::{io, time::Duration};

use thiserror::Error;

use crate::shadowlink::tunnel::{protocol::ProtocolError, transport::TransportError};

/// Failures of the tunnel data plane.
///
/// `Authentication` and `Protocol` are fatal to the physical connection they
/// occur on. `PoolExhausted` is returned to whoever asked for a stream and is
/// never retried internally.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("authentication failed: {0}")]
    Authentication(&'static str),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("no connection available within {0:?}")]
    PoolExhausted(Duration),
    #[error("connection lost")]
    ConnectionLost,
    #[error("stream reset")]
    StreamReset,
    #[error("io: {0}")]
    Io(io::Error),
}

impl TunnelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TunnelError::Protocol(msg.into())
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, TunnelError::Authentication(_))
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            TunnelError::Handshake(_) | TunnelError::Transport(TransportError::Handshake(_))
        )
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        // Logical streams carry their own cause inside the io::Error.
        match err.get_ref().and_then(|e| e.downcast_ref::<TunnelError>()) {
            Some(TunnelError::StreamReset) => return TunnelError::StreamReset,
            Some(TunnelError::ConnectionLost) => return TunnelError::ConnectionLost,
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TunnelError::ConnectionLost,
            _ => TunnelError::Io(err),
        }
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => err.into(),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

impl TunnelError {
    /// Normal ways for a relayed stream to end: the peer went away or reset.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TunnelError::ConnectionLost | TunnelError::StreamReset)
    }
}
