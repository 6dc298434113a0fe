//! Error types shared across the library.

use thiserror::Error;

use crate::value::Value;

/// Library error. Variants follow the failure classes surfaced by the
/// object model, the type registry, the dispatch core and the transports.
#[derive(Debug, Error)]
pub enum Error {
    /// Shape or typing failure: malformed pack/unpack format, a value
    /// that does not match its declared type, a bad declaration string.
    #[error("invalid input: {0}")]
    Invalid(String),
    /// Missing instance, interface, method or type.
    #[error("not found: {0}")]
    NotFound(String),
    /// Bad framing, unknown `%type` tag, malformed frame payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// I/O failure surfaced by a transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Error response produced by a remote (or local) handler.
    #[error("remote error: {0}")]
    Remote(Value),
    /// Reply-state misuse, e.g. responding twice to the same call.
    #[error("call state error: {0}")]
    CallState(&'static str),
    /// The caller cancelled the in-flight call.
    #[error("call aborted")]
    Aborted,
    /// The connection went away while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Classic errno code carried by error values built from this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::Invalid(_) => libc::EINVAL,
            Error::NotFound(_) => libc::ENOENT,
            Error::Protocol(_) => libc::EPROTO,
            Error::Transport(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Remote(v) => v.error_code().unwrap_or(libc::EIO),
            Error::CallState(_) => libc::EBUSY,
            Error::Aborted => libc::ECANCELED,
            Error::ConnectionClosed => libc::ECONNRESET,
        }
    }

    /// Renders this error as an error value suitable for a reply frame.
    pub fn to_value(&self) -> Value {
        match self {
            Error::Remote(v) => v.clone(),
            other => Value::error(other.code(), &other.to_string(), Value::null()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Invalid("x".into()).code(), libc::EINVAL);
        assert_eq!(Error::NotFound("x".into()).code(), libc::ENOENT);
        assert_eq!(Error::Aborted.code(), libc::ECANCELED);
    }

    #[test]
    fn test_error_to_value_round_trip() {
        let err = Error::NotFound("no such method".into());
        let v = err.to_value();
        assert_eq!(v.error_code(), Some(libc::ENOENT));
        assert!(v.error_message().unwrap().contains("no such method"));
    }
}
