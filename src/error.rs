#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer reports file not found")]
    FileNotFound,

    #[error("dispatcher reset the session, sign {0} is in use by another peer")]
    SignCollision(u16),

    #[error("handshake aborted after {0} consecutive timeouts")]
    HandshakeTimeout(u32),

    #[error("sender aborted after {0} consecutive ACK timeouts")]
    SenderTimeout(u32),

    #[error("receiver aborted after {0} consecutive idle timeouts")]
    ReceiverTimeout(u32),

    #[error("malformed handshake payload: {0}")]
    MalformedHandshake(String),

    #[error("unexpected handshake token: {0}")]
    UnexpectedToken(String),

    #[error("no free dispatcher port available")]
    PortsExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
