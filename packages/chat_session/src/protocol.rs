//! Event Channel Protocol
//!
//! Named events exchanged over the duplex channel. Every frame is a JSON text
//! message of the form `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::types::{ConversationId, Message, UserId};

/// Payload of `typing` / `stop_typing` in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

/// Events sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Subscribe to a conversation's room
    JoinChat(ConversationId),
    /// Unsubscribe from a conversation's room
    LeaveChat(ConversationId),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => "join_chat",
            Self::LeaveChat(_) => "leave_chat",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
        }
    }
}

/// Events sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(Message),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
}

impl ServerEvent {
    /// Parse and validate a text frame. Unknown events and payloads with
    /// missing fields are rejected here so nothing half-formed reaches the store.
    pub fn parse(frame: &str) -> Result<Self> {
        let event: ServerEvent = serde_json::from_str(frame)
            .map_err(|e| SessionError::malformed("server event", e.to_string()))?;
        if let ServerEvent::ReceiveMessage(ref msg) = event {
            msg.validate()?;
        }
        Ok(event)
    }
}
