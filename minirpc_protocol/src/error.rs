use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// all failures surfaced by the framework; the display texts of the
/// rpc-prefixed variants are part of the wire contract and stable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection is shut down")]
    Shutdown,

    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: request timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    #[error("rpc server: service already defined: {0}")]
    ServiceAlreadyDefined(String),

    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    #[error("rpc server: {0} is not a valid method name")]
    InvalidMethodName(String),

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    #[error("rpc client: wrong address format {0:?}, expect protocol@addr")]
    BadAddress(String),

    #[error("unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(String),

    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("rpc discovery: not supported select mode")]
    NotSupportedSelectMode,

    #[error("rpc registry: {0}")]
    Registry(String),

    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// error text stamped into a response header by the server, verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("rpc codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// true for the quiet end-of-stream cases that terminate a read loop
    /// without being worth a log line.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

// terminate_calls stamps one read error into every pending call, so the
// error must be duplicable; io errors are rebuilt from kind + text.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Shutdown => Error::Shutdown,
            Error::IllFormedServiceMethod(s) => Error::IllFormedServiceMethod(s.clone()),
            Error::ServiceNotFound(s) => Error::ServiceNotFound(s.clone()),
            Error::MethodNotFound(s) => Error::MethodNotFound(s.clone()),
            Error::HandleTimeout(d) => Error::HandleTimeout(*d),
            Error::ServiceAlreadyDefined(s) => Error::ServiceAlreadyDefined(s.clone()),
            Error::InvalidServiceName(s) => Error::InvalidServiceName(s.clone()),
            Error::InvalidMethodName(s) => Error::InvalidMethodName(s.clone()),
            Error::ConnectTimeout(d) => Error::ConnectTimeout(*d),
            Error::CallFailed(s) => Error::CallFailed(s.clone()),
            Error::BadAddress(s) => Error::BadAddress(s.clone()),
            Error::UnexpectedHttpResponse(s) => Error::UnexpectedHttpResponse(s.clone()),
            Error::NoAvailableServers => Error::NoAvailableServers,
            Error::NotSupportedSelectMode => Error::NotSupportedSelectMode,
            Error::Registry(s) => Error::Registry(s.clone()),
            Error::InvalidCodec(s) => Error::InvalidCodec(s.clone()),
            Error::InvalidMagic(m) => Error::InvalidMagic(*m),
            Error::Remote(s) => Error::Remote(s.clone()),
            Error::Codec(s) => Error::Codec(s.clone()),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        match e.io_error_kind() {
            Some(kind) => Error::Io(io::Error::new(kind, e.to_string())),
            None => Error::Codec(e.to_string()),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        use rmp_serde::decode::Error::*;
        match e {
            InvalidMarkerRead(io) | InvalidDataRead(io) => Error::Io(io),
            other => Error::Codec(other.to_string()),
        }
    }
}

// encode failures close the codec regardless of kind, so no io
// distinction is needed on the write side
impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_error_texts() {
        assert_eq!(Error::Shutdown.to_string(), "connection is shut down");
        assert_eq!(
            Error::NoAvailableServers.to_string(),
            "rpc discovery: no available servers"
        );
        assert_eq!(
            Error::MethodNotFound("Missing".to_owned()).to_string(),
            "rpc server: can't find method Missing"
        );
        assert_eq!(
            Error::HandleTimeout(Duration::from_millis(500)).to_string(),
            "rpc server: request timeout: expect within 500ms"
        );
    }

    #[test]
    fn eof_detection() {
        let eof = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_eof());
        assert!(!Error::Shutdown.is_eof());
    }

    #[test]
    fn clone_keeps_io_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        match err.clone() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected clone: {:?}", other),
        }
    }
}
