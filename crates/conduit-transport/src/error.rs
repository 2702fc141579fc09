use conduit_core::codec::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("frame of {actual} bytes exceeds the configured maximum of {max} bytes")]
    FrameTooLarge { actual: u32, max: u32 },
    #[error("handshake did not complete within the configured timeout")]
    HandshakeTimeout,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("peer connection is gone")]
    PeerGone,
    #[error("no reply received from context `{0}`")]
    DiscoveryEmpty(String),
}
