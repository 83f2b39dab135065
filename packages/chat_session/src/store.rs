//! Conversation Store
//!
//! Read-mostly cache of conversation metadata plus the append-only message
//! history of each conversation, kept in recency order (most recently active
//! first).

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::types::{Conversation, ConversationId, Message, MessageId, UserId};

struct Entry {
    conversation: Conversation,
    history: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl Entry {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            history: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

#[derive(Default)]
pub struct ConversationStore {
    entries: HashMap<ConversationId, Entry>,
    /// Recency order, front = most recently active.
    order: Vec<ConversationId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.entries.get(id).map(|e| &e.conversation)
    }

    /// The cached direct conversation that includes `user`, if any.
    pub fn direct_with(&self, user: &UserId) -> Option<&Conversation> {
        self.list_conversations()
            .into_iter()
            .find(|c| !c.is_group && c.has_member(user))
    }

    /// Conversations, most recently active first.
    pub fn list_conversations(&self) -> Vec<&Conversation> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.conversation)
            .collect()
    }

    /// Insert a conversation if it is not cached yet. Returns `true` if inserted.
    ///
    /// New entries land after every cached conversation with an equal or newer
    /// `updated_at`, so equal timestamps keep insertion order.
    pub fn upsert_conversation(&mut self, conversation: Conversation) -> bool {
        if self.entries.contains_key(&conversation.id) {
            return false;
        }
        let position = self
            .order
            .iter()
            .position(|id| {
                self.entries
                    .get(id)
                    .is_some_and(|e| e.conversation.updated_at < conversation.updated_at)
            })
            .unwrap_or(self.order.len());
        let id = conversation.id.clone();
        self.order.insert(position, id.clone());
        self.entries.insert(id, Entry::new(conversation));
        true
    }

    /// Append a message and move its conversation to the front.
    ///
    /// Returns `false` when the conversation is unknown or the message id is
    /// already cached.
    pub fn append_message(&mut self, conversation_id: &ConversationId, message: Message) -> bool {
        let Some(entry) = self.entries.get_mut(conversation_id) else {
            warn!(
                conversation = %conversation_id,
                message = %message.id,
                "dropping message for unknown conversation"
            );
            return false;
        };
        if !entry.seen.insert(message.id.clone()) {
            debug!(conversation = %conversation_id, message = %message.id, "duplicate message ignored");
            return false;
        }

        entry.conversation.last_message_text = Some(message.text.clone());
        entry.conversation.updated_at = message.created_at;
        entry.history.push(message);

        if let Some(pos) = self.order.iter().position(|id| id == conversation_id) {
            let id = self.order.remove(pos);
            self.order.insert(0, id);
        }
        true
    }

    /// Full cached history in append order; empty if never fetched.
    pub fn get_history(&self, conversation_id: &ConversationId) -> &[Message] {
        self.entries
            .get(conversation_id)
            .map(|e| e.history.as_slice())
            .unwrap_or(&[])
    }

    /// Apply a fetched history. Cached messages missing from the fetch (they
    /// arrived live while it was in flight) are kept after the fetched ones.
    pub fn replace_history(&mut self, conversation_id: &ConversationId, fetched: Vec<Message>) -> bool {
        let Some(entry) = self.entries.get_mut(conversation_id) else {
            warn!(conversation = %conversation_id, "history for unknown conversation ignored");
            return false;
        };

        let mut seen = HashSet::with_capacity(fetched.len());
        let mut history = Vec::with_capacity(fetched.len());
        for msg in fetched {
            if seen.insert(msg.id.clone()) {
                history.push(msg);
            }
        }
        for msg in entry.history.drain(..) {
            if seen.insert(msg.id.clone()) {
                history.push(msg);
            }
        }

        entry.history = history;
        entry.seen = seen;
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
