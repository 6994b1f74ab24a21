// Wire codec for the NATS client protocol: text control lines with CRLF
// terminators, binary payload bodies for MSG/HMSG, JSON arguments to
// CONNECT/INFO.
pub use headers::HeaderMap;
pub use info::{ConnectInfo, ServerInfo};
pub use parser::{Parser, ServerOp};

pub mod headers;
pub mod info;
mod parser;
pub mod write;

/// Longest control line the parser will buffer before giving up.
///
/// Subjects and INFO payloads are small in practice; anything past this is a
/// misbehaving peer and refusing early caps memory growth.
pub const MAX_CONTROL_LINE: usize = 4096;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed control line: {0}")]
    BadControlLine(String),
    #[error("control line exceeds {MAX_CONTROL_LINE} bytes")]
    ControlLineTooLong,
    #[error("unknown protocol verb: {0}")]
    UnknownVerb(String),
    #[error("invalid INFO payload: {0}")]
    BadInfo(String),
    #[error("malformed header block: {0}")]
    BadHeaders(String),
    #[error("payload length {length} exceeds cap {cap}")]
    PayloadTooLarge { length: usize, cap: usize },
}
