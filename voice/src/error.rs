//! Error taxonomy for the voice connection.
//!
//! Per-packet failures (protocol, crypto, codec) are logged and dropped by
//! the background loops. Connection-level failures are classified with
//! [`VoiceError::is_recoverable`] so the reconnect policy knows whether to
//! retry.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error type for the voice transport.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Malformed datagram, discovery reply or signaling payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No mutually supported encryption mode
    #[error("encryption negotiation failed: {0}")]
    Negotiation(String),

    /// Payload failed to seal or open
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Opus encode/decode failure
    #[error("codec error: {0}")]
    Codec(String),

    /// UDP or TCP I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    /// Server rejected our credentials
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Endpoint or platform capability we cannot use
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Signaling socket closed with a code we must not retry
    #[error("voice server closed the session (code {0})")]
    SessionClosed(u16),

    /// Reconnect policy ran out of attempts
    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),

    /// Operation needs a negotiated session
    #[error("the connection is not initialized")]
    NotInitialized,

    /// Operation on a torn-down connection
    #[error("the connection has been disposed")]
    Disposed,

    /// Invalid caller-supplied value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VoiceError {
    // ---
    /// Builds a protocol error from any displayable cause.
    pub fn protocol(cause: impl std::fmt::Display) -> Self {
        Self::Protocol(format!("{cause:#}"))
    }

    /// Builds a crypto error, keeping the cause chain in the message.
    pub fn crypto(cause: anyhow::Error) -> Self {
        Self::Crypto(format!("{cause:#}"))
    }

    /// Builds a codec error, keeping the cause chain in the message.
    pub fn codec(cause: anyhow::Error) -> Self {
        Self::Codec(format!("{cause:#}"))
    }

    /// Whether the reconnect policy may retry after this error.
    pub fn is_recoverable(&self) -> bool {
        // ---
        match self {
            VoiceError::Io(_) | VoiceError::Protocol(_) => true,
            VoiceError::WebSocket(e) => websocket_is_recoverable(e),
            VoiceError::Negotiation(_)
            | VoiceError::Authentication(_)
            | VoiceError::Unsupported(_)
            | VoiceError::SessionClosed(_)
            | VoiceError::RetriesExhausted(_)
            | VoiceError::Disposed
            | VoiceError::InvalidArgument(_) => false,
            VoiceError::Crypto(_) | VoiceError::Codec(_) | VoiceError::NotInitialized => true,
        }
    }
}

impl From<tungstenite::Error> for VoiceError {
    fn from(e: tungstenite::Error) -> Self {
        // ---
        match e {
            tungstenite::Error::Http(ref resp)
                if resp.status() == 401 || resp.status() == 403 =>
            {
                VoiceError::Authentication(format!("gateway upgrade returned {}", resp.status()))
            }
            tungstenite::Error::Url(ref url) => VoiceError::Unsupported(url.to_string()),
            other => VoiceError::WebSocket(Box::new(other)),
        }
    }
}

fn websocket_is_recoverable(e: &tungstenite::Error) -> bool {
    // ---
    !matches!(
        e,
        tungstenite::Error::Url(_) | tungstenite::Error::Tls(_) | tungstenite::Error::Capacity(_)
    )
}

/// Result type for the voice transport.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn negotiation_is_fatal() {
        // ---
        assert!(!VoiceError::Negotiation("none".into()).is_recoverable());
        assert!(!VoiceError::SessionClosed(4004).is_recoverable());
    }

    #[test]
    fn transport_errors_are_retried() {
        // ---
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(VoiceError::from(io).is_recoverable());
        assert!(VoiceError::from(tungstenite::Error::ConnectionClosed).is_recoverable());
    }

    #[test]
    fn bad_url_is_unsupported() {
        // ---
        let err = VoiceError::from(tungstenite::Error::Url(
            tungstenite::error::UrlError::UnsupportedUrlScheme,
        ));
        assert!(matches!(err, VoiceError::Unsupported(_)));
        assert!(!err.is_recoverable());
    }
}
