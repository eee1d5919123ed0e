use std::error::Error as StdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No daemon answered: refused connection, timeout or similar.
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    #[error("{message} ({code}, HTTP {status})")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("daemon version mismatch: expected {expected}, daemon reports {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("daemon not healthy after start")]
    NotHealthy,
    #[error("decoding daemon response: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn from_transport(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        if err.is_connect() || err.is_timeout() || message_means_unavailable(&message) {
            ClientError::Unavailable(message)
        } else if err.is_decode() {
            ClientError::Decode(message)
        } else {
            ClientError::Transport(message)
        }
    }

    pub fn is_daemon_unavailable(&self) -> bool {
        match self {
            ClientError::Unavailable(_) => true,
            ClientError::Transport(message) => message_means_unavailable(message),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound(_) | ClientError::Api { status: 404, .. }
        )
    }
}

/// Transport messages that mean nothing is listening.
pub fn message_means_unavailable(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "connection refused",
        "deadline exceeded",
        "timed out",
        "error trying to connect",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
