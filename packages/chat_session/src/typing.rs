//! Presence/Typing Tracker
//!
//! Tracks who is composing a message in the active conversation and whether
//! the local user is. The tracker never talks to the channel itself: each
//! call reports what should be emitted and the session emits it.
//!
//! All entries share one quiet period. A local or remote typing mark that is
//! not refreshed within it expires; refreshes restart the period rather than
//! queueing another one.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::{ConversationId, UserId};

/// Result of [`TypingTracker::expire`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// The local quiet period elapsed: emit `stop_typing` for this conversation.
    pub local: Option<ConversationId>,
    /// Conversations whose remote typing set shrank.
    pub remote: Vec<ConversationId>,
}

pub struct TypingTracker {
    quiet_period: Duration,
    active: Option<ConversationId>,
    /// Deadline of the local quiet period; `Some` while the local user is typing.
    local_deadline: Option<Instant>,
    remote: HashMap<ConversationId, HashMap<UserId, Instant>>,
}

impl TypingTracker {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            active: None,
            local_deadline: None,
            remote: HashMap::new(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn is_local_typing(&self) -> bool {
        self.local_deadline.is_some()
    }

    /// Switch the conversation typing events apply to.
    ///
    /// Clears the departing and arriving conversation's sets and cancels the
    /// local quiet period without asking for a `stop_typing`.
    pub fn switch_to(&mut self, conversation: Option<ConversationId>) {
        if let Some(old) = self.active.take() {
            self.remote.remove(&old);
        }
        if let Some(ref new) = conversation {
            self.remote.remove(new);
        }
        if self.local_deadline.take().is_some() {
            debug!("local typing timer cancelled by conversation switch");
        }
        self.active = conversation;
    }

    /// Keystroke in the composer. Returns `true` when `typing` must be emitted.
    pub fn on_local_input_change(&mut self, now: Instant) -> bool {
        if self.active.is_none() {
            return false;
        }
        let started = self.local_deadline.is_none();
        self.local_deadline = Some(now + self.quiet_period);
        started
    }

    /// The local user sent a message. Returns `true` when `stop_typing` must be emitted.
    pub fn on_message_sent(&mut self) -> bool {
        self.local_deadline.take().is_some()
    }

    /// Returns `true` if the visible set changed.
    pub fn on_remote_typing(
        &mut self,
        conversation: &ConversationId,
        user: UserId,
        now: Instant,
    ) -> bool {
        if self.active.as_ref() != Some(conversation) {
            return false;
        }
        self.remote
            .entry(conversation.clone())
            .or_default()
            .insert(user, now + self.quiet_period)
            .is_none()
    }

    /// Returns `true` if the visible set changed.
    pub fn on_remote_stop_typing(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        let Some(users) = self.remote.get_mut(conversation) else {
            return false;
        };
        let removed = users.remove(user).is_some();
        if users.is_empty() {
            self.remote.remove(conversation);
        }
        removed
    }

    /// Users currently typing in `conversation`, sorted.
    pub fn typing_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.remote
            .get(conversation)
            .map(|users| users.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let remote = self
            .remote
            .values()
            .flat_map(|users| users.values().copied())
            .min();
        match (self.local_deadline, remote) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drop everything whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Expired {
        let mut expired = Expired::default();

        if self.local_deadline.is_some_and(|d| d <= now) {
            self.local_deadline = None;
            expired.local = self.active.clone();
        }

        self.remote.retain(|conversation, users| {
            let before = users.len();
            users.retain(|_, deadline| *deadline > now);
            if users.len() != before {
                expired.remote.push(conversation.clone());
            }
            !users.is_empty()
        });
        expired.remote.sort();

        expired
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.local_deadline = None;
        self.remote.clear();
    }
}
