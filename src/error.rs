use std::io;
use thiserror::Error;

/// Errors produced on the per-connection path.
///
/// Each variant maps to exactly one client-visible reply: the SOCKS5
/// frontend answers with the protocol's status bytes, the HTTP frontend
/// with a status line. Errors never cross session boundaries.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client presented no credentials, or credentials that could not
    /// be decoded.
    #[error("no usable credentials presented")]
    AuthRequired,

    /// Credentials were present but the identity is not in the route table.
    #[error("unknown identity for user {0:?}")]
    AuthRejected(String),

    /// The inbound framing is invalid.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The client asked for something the gateway does not speak.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// The TCP dial to the upstream (or first chain hop) failed.
    #[error("upstream dial failed: {0}")]
    UpstreamDialFailed(String),

    /// The upstream proxy declined the CONNECT, answered garbage, or died
    /// mid-handshake.
    #[error("upstream rejected tunnel: {0}")]
    UpstreamRejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
