use std::time::Duration;

use thiserror::Error;

/// Errors produced anywhere in the relay.
///
/// Every variant is scoped to one request or one session; none of them is
/// fatal to the process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("WeCom API error {code}: {message}")]
    WeCom { code: i64, message: String },

    #[error("Chat engine responded with HTTP status {0}")]
    EngineStatus(u16),

    #[error("Chat engine error {code}: {message}")]
    Engine { code: i64, message: String },

    #[error("Malformed stream frame: {0}")]
    MalformedFrame(String),

    #[error("Session deadline of {0:?} exceeded")]
    Deadline(Duration),

    #[error("Segment receiver dropped")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// True for failures caused by the webhook signature or ciphertext.
    pub fn is_crypto(&self) -> bool {
        matches!(self, Self::Crypto(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_surfaces_vendor_message() {
        let err = RelayError::Engine {
            code: 460004,
            message: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "Chat engine error 460004: overloaded");
        assert!(!err.is_crypto());
    }

    #[test]
    fn crypto_errors_are_classified() {
        assert!(RelayError::Crypto("signature mismatch".into()).is_crypto());
        assert!(!RelayError::Config("x".into()).is_crypto());
    }
}
