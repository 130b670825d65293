//! Error types for the WebSocket gateway

use std::io;

use crate::session::ClientId;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by application hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Gateway error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Malformed frame or protocol violation
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Frame exceeds the configured maximum frame size
    #[error("frame too large")]
    FrameTooLarge,
    /// Message exceeds the configured maximum message size
    #[error("message too large")]
    MessageTooLarge,
    /// Invalid UTF-8 in a text message or close reason
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Binary message received while the gateway only accepts text
    #[error("binary messages are not accepted")]
    UnacceptableType,
    /// Compression/decompression error
    #[error("compression error: {0}")]
    Compression(String),
    /// Malformed HTTP request head
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Handshake rejected
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// No session with the given id is loaded
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    /// The session is closing and accepts no further data
    #[error("client {0} is closing")]
    ClientClosing(ClientId),
    /// The client disconnected while a message was still streaming
    #[error("client gone")]
    ClientGone,
    /// Close reason does not fit in a control frame
    #[error("close reason must not exceed 123 bytes, got {0}")]
    CloseReasonTooLong(usize),
    /// Close code that may not be sent on the wire
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// An application hook failed
    #[error("application error: {0}")]
    Application(#[source] BoxError),
    /// The gateway has been stopped
    #[error("gateway stopped")]
    GatewayStopped,
}

impl Error {
    /// RFC 6455 close code the gateway answers this error with
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => CloseCode::PROTOCOL_ERROR,
            Error::FrameTooLarge | Error::MessageTooLarge => CloseCode::MESSAGE_TOO_LARGE,
            Error::InvalidUtf8 => CloseCode::INCONSISTENT_FRAME_DATA_TYPE,
            Error::UnacceptableType => CloseCode::UNACCEPTABLE_TYPE,
            Error::Compression(_) => CloseCode::POLICY_VIOLATION,
            Error::Io(_) | Error::ClientGone => CloseCode::ABNORMAL_CLOSE,
            _ => CloseCode::UNEXPECTED_SERVER_ERROR,
        }
    }

    /// Whether this error only means the peer already went away
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            Error::ClientGone | Error::ClientClosing(_) => true,
            _ => false,
        }
    }
}

/// RFC 6455 §7.4 close codes
pub struct CloseCode;

impl CloseCode {
    /// Normal closure
    pub const NORMAL_CLOSE: u16 = 1000;
    /// Endpoint going away (server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Data type cannot be accepted
    pub const UNACCEPTABLE_TYPE: u16 = 1003;
    /// No status code was present (never sent on the wire)
    pub const NONE: u16 = 1005;
    /// Connection dropped without a close frame (never sent on the wire)
    pub const ABNORMAL_CLOSE: u16 = 1006;
    /// Payload inconsistent with message type (invalid UTF-8)
    pub const INCONSISTENT_FRAME_DATA_TYPE: u16 = 1007;
    /// Policy violation
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Client expected an extension the server did not negotiate
    pub const EXPECTED_EXTENSION_MISSING: u16 = 1010;
    /// Internal server error
    pub const UNEXPECTED_SERVER_ERROR: u16 = 1011;
    /// Service restart
    pub const SERVICE_RESTARTING: u16 = 1012;
    /// Try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Bad gateway (never accepted from a peer)
    pub const BAD_GATEWAY: u16 = 1014;
    /// TLS handshake failure (never sent on the wire)
    pub const TLS_HANDSHAKE_FAILURE: u16 = 1015;

    /// Check whether a peer may send this code in a close frame
    ///
    /// 1004–1006, 1014–2999 and anything at or above 5000 are rejected.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_close_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 1013, 3000, 4999] {
            assert!(CloseCode::is_valid(code), "{code} should be valid");
        }
        for code in [0, 999, 1004, 1005, 1006, 1014, 1015, 1016, 1999, 2000, 2999, 5000] {
            assert!(!CloseCode::is_valid(code), "{code} should be rejected");
        }
    }

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(Error::Protocol("x").close_code(), CloseCode::PROTOCOL_ERROR);
        assert_eq!(Error::FrameTooLarge.close_code(), CloseCode::MESSAGE_TOO_LARGE);
        assert_eq!(Error::MessageTooLarge.close_code(), CloseCode::MESSAGE_TOO_LARGE);
        assert_eq!(
            Error::InvalidUtf8.close_code(),
            CloseCode::INCONSISTENT_FRAME_DATA_TYPE
        );
        assert_eq!(
            Error::UnacceptableType.close_code(),
            CloseCode::UNACCEPTABLE_TYPE
        );
    }

    #[test]
    fn test_disconnect_classification() {
        let broken = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(broken.is_disconnect());
        assert!(Error::ClientGone.is_disconnect());
        assert!(!Error::Protocol("bad").is_disconnect());
    }
}
