use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to callers of the client-side core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The transport could not be established.
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionError { url: String, reason: String },

    /// A send was attempted while the transport is not open.
    #[error("Not connected")]
    NotConnected,

    /// No reply arrived before the request's deadline.
    #[error("Request {0} timed out")]
    RequestTimeout(String),

    /// The server answered the request with an explicit error.
    #[error("Remote error: {0}")]
    RemoteError(String),

    /// The connection dropped while the request was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    /// A frame could not be encoded or decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The client was stopped by its owner.
    #[error("Client stopped")]
    Stopped,
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_becomes_malformed() {
        let err: ClientError = ProtocolError::Deserialization("eof".into()).into();
        assert_eq!(err, ClientError::MalformedMessage("Deserialization error: eof".into()));
    }

    #[test]
    fn test_timeout_names_request() {
        assert_eq!(
            ClientError::RequestTimeout("r-1".into()).to_string(),
            "Request r-1 timed out"
        );
    }
}
