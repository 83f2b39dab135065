//! Domain types: identifiers, conversations, messages, credentials.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Server-assigned conversation identifier.
    ConversationId
);
string_id!(
    /// User identifier.
    UserId
);
string_id!(
    /// Server-assigned message identifier.
    MessageId
);

/// A conversation participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MemberWire")]
pub struct Member {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Accepts `{id, name}` as well as a user document `{_id, firstName, lastName}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberWire {
    #[serde(alias = "_id")]
    id: UserId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

impl From<MemberWire> for Member {
    fn from(wire: MemberWire) -> Self {
        Self {
            id: wire.id,
            name: wire
                .name
                .or_else(|| full_name(wire.first_name, wire.last_name)),
        }
    }
}

pub(crate) fn full_name(first: Option<String>, last: Option<String>) -> Option<String> {
    match (first, last) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (first, last) => first.or(last),
    }
}

impl Member {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// A direct (two members) or group (three or more) chat thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: ConversationId,
    #[serde(default)]
    pub is_group: bool,
    pub members: Vec<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn direct(id: impl Into<ConversationId>, a: Member, b: Member) -> Self {
        Self {
            id: id.into(),
            is_group: false,
            members: vec![a, b],
            name: None,
            last_message_text: None,
            updated_at: Utc::now(),
        }
    }

    pub fn group(
        id: impl Into<ConversationId>,
        name: impl Into<String>,
        members: Vec<Member>,
    ) -> Self {
        Self {
            id: id.into(),
            is_group: true,
            members,
            name: Some(name.into()),
            last_message_text: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// Checks the invariants a payload must satisfy before it enters the store.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(SessionError::malformed("conversation", "empty id"));
        }
        let mut seen = HashSet::with_capacity(self.members.len());
        for member in &self.members {
            if member.id.as_str().is_empty() {
                return Err(SessionError::malformed("conversation", "empty member id"));
            }
            if !seen.insert(&member.id) {
                return Err(SessionError::malformed(
                    "conversation",
                    format!("duplicate member {}", member.id),
                ));
            }
        }
        match (self.is_group, self.members.len()) {
            (false, 2) => Ok(()),
            (false, n) => Err(SessionError::malformed(
                "conversation",
                format!("direct conversation with {n} members"),
            )),
            (true, n) if n >= 3 => Ok(()),
            (true, n) => Err(SessionError::malformed(
                "conversation",
                format!("group conversation with {n} members"),
            )),
        }
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|m| &m.id == user_id)
    }

    /// Group name for groups, the other participant for direct conversations.
    pub fn display_name(&self, self_id: Option<&UserId>) -> String {
        if self.is_group {
            return self.name.clone().unwrap_or_else(|| "Unknown".to_string());
        }
        self.members
            .iter()
            .find(|m| Some(&m.id) != self_id)
            .map(|m| m.name.clone().unwrap_or_else(|| m.id.to_string()))
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// An immutable chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MessageWire")]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(SessionError::malformed("message", "empty id"));
        }
        if self.conversation_id.as_str().is_empty() {
            return Err(SessionError::malformed("message", "empty conversation id"));
        }
        if self.sender_id.as_str().is_empty() {
            return Err(SessionError::malformed("message", "empty sender id"));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageWire {
    #[serde(alias = "_id")]
    id: MessageId,
    #[serde(rename = "chatId")]
    conversation_id: ConversationId,
    sender_id: SenderRef,
    #[serde(default)]
    sender_name: Option<String>,
    text: String,
    created_at: DateTime<Utc>,
}

/// `senderId` is either the bare id or the populated sender document.
#[derive(Deserialize)]
#[serde(untagged)]
enum SenderRef {
    Id(UserId),
    Populated(Member),
}

impl From<MessageWire> for Message {
    fn from(wire: MessageWire) -> Self {
        let (sender_id, populated_name) = match wire.sender_id {
            SenderRef::Id(id) => (id, None),
            SenderRef::Populated(member) => (member.id, member.name),
        };
        Self {
            id: wire.id,
            conversation_id: wire.conversation_id,
            sender_id,
            sender_name: wire.sender_name.or(populated_name),
            text: wire.text,
            created_at: wire.created_at,
        }
    }
}

/// Outgoing message before the backend assigns an id and timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub text: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

/// Authentication token pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// The signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}
