use std::io;

use tapwire_archive::ArchiveError;
use tapwire_net::{ParseError, SocksError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed http message: {0}")]
    Parse(#[from] ParseError),
    #[error("malformed socks5 message: {0}")]
    Socks(#[from] SocksError),
    #[error("tls handshake with client for {host} failed: {message}")]
    TlsHandshake { host: String, message: String },
    #[error("client closed the connection")]
    ClientClosed,
    #[error("upstream error: {0}")]
    Pool(#[from] PoolError),
    #[error("rule action failed: {0}")]
    Action(#[from] ActionError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("proxy is shutting down")]
    Cancelled,
}

impl ProxyError {
    /// Errors that end a connection without indicating anything went wrong
    /// on the proxy side.
    pub fn is_benign(&self) -> bool {
        match self {
            ProxyError::ClientClosed | ProxyError::Cancelled => true,
            ProxyError::Io(err) => is_disconnect(err),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pooled connection was closed concurrently with reuse")]
    ConnectionClosedConcurrently,
    #[error("upstream unavailable: {0}")]
    Terminal(String),
    #[error("connect to {authority} failed: {message}")]
    Connect { authority: String, message: String },
    #[error("tls handshake with {authority} failed: {message}")]
    Tls { authority: String, message: String },
    #[error("upstream io error: {0}")]
    Io(#[from] io::Error),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("gave up after racing closed connections for {0:?}")]
    RaceTimeout(std::time::Duration),
    #[error("upstream send cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{action} requires an exchange")]
    MissingExchange { action: &'static str },
    #[error("failed to read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid action input: {0}")]
    Invalid(String),
}
