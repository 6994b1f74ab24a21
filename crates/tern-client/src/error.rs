// Error taxonomy for the connection engine.
//
// Variants are the stable contract; message wording is not. Every variant is
// cloneable so one failure can fan out to all of the one-shot waiters that
// observe it.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every candidate server failed during connect.
    #[error("unable to connect to any server: {0}")]
    Connect(String),
    /// The socket opened but the INFO/CONNECT/PONG exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The server sent a frame the parser refuses.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The server rejected our credentials; fatal for the current socket.
    #[error("authorization rejected: {0}")]
    Auth(String),
    /// A socket write failed; every command in the failing flush gets this.
    #[error("socket write failed: {0}")]
    WriteFailed(String),
    /// The connection dropped while the operation was pending.
    #[error("connection lost")]
    ConnectionLost,
    /// The connection was disposed.
    #[error("connection disposed")]
    Disposed,
    /// A seed or advertised URL could not be parsed.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    /// Configuration file or TLS material could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
    /// The payload is larger than the configured maximum.
    #[error("payload exceeds maximum of {0} bytes")]
    MaxPayloadExceeded(usize),
}

impl From<tern_wire::Error> for Error {
    fn from(err: tern_wire::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
