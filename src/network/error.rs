//! Common error types for network operations

/// A common error type for network operations.
///
/// This enum covers failures of the transport itself. HTTP status codes are not
/// errors at this layer; they are returned in the [`Response`](super::http::Response)
/// and classified by the caller.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum Error {
    /// A connection attempt was refused.
    #[error("connection refused")]
    ConnectionRefused,
    /// A timeout occurred.
    #[error("request timed out")]
    Timeout,
    /// The connection was closed before a full response was received.
    #[error("connection closed")]
    ConnectionClosed,
    /// An invalid address was provided.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The request could not be built, or the response could not be decoded.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl Error {
    /// Returns `true` when the failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionRefused | Error::Timeout | Error::ConnectionClosed
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() {
            Error::ConnectionRefused
        } else if err.is_builder() {
            Error::InvalidAddress(err.to_string())
        } else if err.is_body() || err.is_request() {
            Error::ConnectionClosed
        } else {
            Error::ProtocolError(err.to_string())
        }
    }
}
