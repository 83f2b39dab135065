//! Error type shared by every collaborator of the session.

use tokio_tungstenite::tungstenite;

use crate::types::ConversationId;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("backend is unavailable")]
    Unavailable,

    #[error("no credential available")]
    MissingCredential,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("no signed-in user")]
    NotSignedIn,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("session is closed")]
    Closed,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if err.is_decode() {
            Self::malformed("response", err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Whether a renewed access token could make the same request succeed.
    pub fn is_credential_expired(&self) -> bool {
        match self {
            Self::Unauthorized(msg) | Self::Rejected(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("jwt expire") || msg.contains("token expired")
            }
            _ => false,
        }
    }
}
