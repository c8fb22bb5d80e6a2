//! Error types for the chat core.

use carelink_common::error::CareLinkError;
use thiserror::Error;

/// Message used for every failure that never reached a server verdict.
pub const RESULT_FAILED: &str = "msg.RESULT_FAILED";

#[derive(Debug, Error)]
pub enum ChatError {
    /// The REST envelope carried a non-zero result code.
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// An error from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame or event payload did not match the protocol.
    #[error("Protocol error on {event}: {message}")]
    Protocol { event: String, message: String },

    /// The transport was not connected.
    #[error("Transport is not connected")]
    NotConnected,

    #[error(transparent)]
    Common(#[from] CareLinkError),

    /// A generic error string.
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    pub fn protocol(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Normalized message handed to callers: `msg.<resultMsg>` for server
    /// rejections, `msg.RESULT_FAILED` for everything else.
    pub fn result_message(&self) -> String {
        match self {
            Self::Api { message, .. } => format!("msg.{message}"),
            _ => RESULT_FAILED.to_owned(),
        }
    }

    /// Whether the failure happened below the server's application layer.
    pub fn is_transport_failure(&self) -> bool {
        !matches!(self, Self::Api { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_message_normalization() {
        let rejected = ChatError::Api { code: 3, message: "NOT_MEMBER".into() };
        assert_eq!(rejected.result_message(), "msg.NOT_MEMBER");
        assert!(!rejected.is_transport_failure());

        assert_eq!(ChatError::NotConnected.result_message(), RESULT_FAILED);
        assert!(ChatError::NotConnected.is_transport_failure());
    }
}
