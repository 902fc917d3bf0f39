//! Errors surfaced by the service facade and the network loops.

use std::io;
use std::net::SocketAddr;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::transfer::{TransferError, TransferState};
use crate::wire::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("{0} has no usable file name")]
    InvalidPath(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("chunk at offset {offset} ({len} bytes) does not follow {expected}")]
    BadChunk { expected: u64, offset: u64, len: usize },
    #[error("source file ended after {read} of {expected} bytes")]
    SourceShrank { expected: u64, read: u64 },
    #[error("peer ended the transfer with state {0}")]
    RemoteStatus(TransferState),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("no stored identity; create the service first")]
    NoIdentity,
    #[error("cannot start runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("blocking call made from inside the service runtime; call it from a host thread")]
    InsideRuntime,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
