//! Session Synchronizer
//!
//! Owns the active conversation and keeps the channel subscriptions, the
//! cached history and the typing state consistent with it across switches,
//! reconnects and restarts.
//!
//! Everything runs on one logical task. Fetches are spawned and their results
//! come back through an internal queue, tagged with a per-conversation token
//! so that only the latest request for the active conversation is applied.
//!
//! ```text
//!            select(id)                 history resolved
//!   Idle ───────────────▶ Switching(id) ─────────────────▶ Active(id)
//!                              ▲                               │
//!                              └────────── select(other) ──────┘
//! ```

use std::collections::HashMap;
use std::future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{ChatBackend, CreateConversation, CredentialCell};
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionState, SignalOutcome, Transport, TransportSignal};
use crate::error::{Result, SessionError};
use crate::persistence::PersistenceBridge;
use crate::protocol::{ClientEvent, ServerEvent, TypingPayload};
use crate::store::ConversationStore;
use crate::types::{Conversation, ConversationId, LocalUser, Member, Message, NewMessage, UserId};
use crate::typing::TypingTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// Selected; history not applied yet.
    Switching(ConversationId),
    Active(ConversationId),
}

impl SyncState {
    pub fn conversation(&self) -> Option<&ConversationId> {
        match self {
            Self::Idle => None,
            Self::Switching(id) | Self::Active(id) => Some(id),
        }
    }
}

/// Observable changes, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    ConversationsChanged,
    ActiveChanged(Option<ConversationId>),
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAppended(Message),
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },
    ConnectionChanged(ConnectionState),
}

/// Results of spawned work, re-entering the session loop.
#[derive(Debug)]
pub(crate) enum Internal {
    HistoryFetched {
        conversation_id: ConversationId,
        token: u64,
        result: Result<Vec<Message>>,
    },
    ConversationsFetched {
        epoch: u64,
        result: Result<Vec<Conversation>>,
    },
    ProfileFetched {
        epoch: u64,
        result: Result<LocalUser>,
    },
}

/// One unit of work for the session loop.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    Transport(TransportSignal),
    Internal(Internal),
    TypingDeadline,
    Reconnect,
}

pub struct SessionSynchronizer {
    config: SessionConfig,
    connection: ConnectionManager,
    store: ConversationStore,
    typing: TypingTracker,
    persistence: PersistenceBridge,
    backend: Arc<dyn ChatBackend>,
    credential: CredentialCell,
    me: Option<LocalUser>,
    /// Bumped by logout; list and profile results from an older epoch belong
    /// to the previous user.
    epoch: u64,
    state: SyncState,
    /// Persisted last-active id waiting for the first list fetch.
    pending_restore: Option<ConversationId>,
    next_token: u64,
    latest_fetch: HashMap<ConversationId, u64>,
    list_refresh_in_flight: bool,
    reconnect_at: Option<Instant>,
    transport_rx: mpsc::UnboundedReceiver<TransportSignal>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionSynchronizer {
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        backend: Arc<dyn ChatBackend>,
        persistence: PersistenceBridge,
        credential: CredentialCell,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            typing: TypingTracker::new(config.typing_quiet_period()),
            connection: ConnectionManager::new(transport, transport_tx),
            store: ConversationStore::new(),
            persistence,
            backend,
            credential,
            me: None,
            epoch: 0,
            state: SyncState::Idle,
            pending_restore: None,
            next_token: 0,
            latest_fetch: HashMap::new(),
            list_refresh_in_flight: false,
            reconnect_at: None,
            transport_rx,
            internal_tx,
            internal_rx,
            updates,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn update_sender(&self) -> broadcast::Sender<SessionUpdate> {
        self.updates.clone()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.state.conversation()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn local_user(&self) -> Option<&LocalUser> {
        self.me.as_ref()
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.active_conversation()
            .map(|id| self.typing.typing_users(id))
            .unwrap_or_default()
    }

    /// Load persisted state, open the channel and fetch the conversation list.
    ///
    /// The persisted last-active conversation is selected once the list
    /// arrives, if it is part of it.
    pub async fn start(&mut self) {
        if self.me.is_none() {
            self.me = self.persistence.load_local_user().await;
        }
        if self.credential.get().await.is_none() {
            if let Some(credential) = self.persistence.load_credential().await {
                self.credential.set(credential).await;
            }
        }
        self.pending_restore = self.persistence.load_active_conversation().await;
        if let Some(ref id) = self.pending_restore {
            debug!(conversation = %id, "restore pending until conversation list arrives");
        }

        self.connect().await;
        self.refresh_conversations();
        if self.credential.get().await.is_some() {
            self.request_profile();
        }
    }

    pub async fn set_local_user(&mut self, user: LocalUser) {
        self.persistence.save_local_user(&user).await;
        self.me = Some(user);
    }

    /// Open the channel with the current credential. Returns `true` when
    /// connected afterwards.
    pub async fn connect(&mut self) -> bool {
        self.reconnect_at = None;
        if self.connection.state() != ConnectionState::Disconnected {
            return self.connection.is_connected();
        }
        let credential = self.credential.get().await;
        if self.connection.connect(credential.as_ref()).await {
            self.on_connected();
            return true;
        }
        if credential.is_some() {
            self.schedule_reconnect();
        }
        false
    }

    /// Close the channel and cancel any scheduled reconnect.
    pub fn disconnect(&mut self) {
        self.reconnect_at = None;
        if self.connection.state() != ConnectionState::Disconnected {
            self.connection.disconnect();
            self.publish(SessionUpdate::ConnectionChanged(ConnectionState::Disconnected));
        }
    }

    /// Make `id` the active conversation.
    ///
    /// Reselecting the active conversation does nothing. An explicit
    /// selection cancels a pending restore.
    pub async fn select_conversation(&mut self, id: ConversationId) -> Result<()> {
        if let Some(restore) = self.pending_restore.take() {
            debug!(conversation = %restore, "pending restore cancelled by selection");
        }
        self.switch_to(id).await
    }

    async fn switch_to(&mut self, id: ConversationId) -> Result<()> {
        if self.active_conversation() == Some(&id) {
            debug!(conversation = %id, "already selected");
            return Ok(());
        }
        if !self.store.contains(&id) {
            return Err(SessionError::UnknownConversation(id));
        }

        let connected = self.connection.is_connected();
        if connected {
            if let Some(previous) = self.active_conversation().cloned() {
                self.connection.emit(ClientEvent::LeaveChat(previous));
            }
        }

        info!(conversation = %id, "switching conversation");
        self.state = SyncState::Switching(id.clone());
        self.typing.switch_to(Some(id.clone()));
        self.persistence.save_active_conversation(&id).await;
        self.publish(SessionUpdate::ActiveChanged(Some(id.clone())));

        if connected {
            self.connection.emit(ClientEvent::JoinChat(id.clone()));
            self.request_history(id);
        } else {
            debug!(conversation = %id, "not connected, join and history deferred");
        }
        Ok(())
    }

    /// Fetch the conversation list. At most one fetch is in flight.
    pub fn refresh_conversations(&mut self) {
        if self.list_refresh_in_flight {
            debug!("conversation list refresh already in flight");
            return;
        }
        self.list_refresh_in_flight = true;

        let epoch = self.epoch;
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_conversations().await;
            let _ = tx.send(Internal::ConversationsFetched { epoch, result });
        });
    }

    /// Users the local user has no direct conversation with yet.
    pub async fn list_new_contacts(&self) -> Result<Vec<Member>> {
        let users = self.backend.list_users().await?;
        Ok(users
            .into_iter()
            .filter(|u| !self.is_me(&u.id) && self.store.direct_with(&u.id).is_none())
            .collect())
    }

    /// Select the direct conversation with `user`, creating it if needed.
    pub async fn open_direct(&mut self, user: UserId) -> Result<ConversationId> {
        if self.me.as_ref().is_some_and(|me| me.id == user) {
            return Err(SessionError::Rejected(
                "cannot open a conversation with yourself".to_string(),
            ));
        }

        let existing = self.store.direct_with(&user).map(|c| c.id.clone());

        let id = match existing {
            Some(id) => id,
            None => {
                let conversation = self
                    .backend
                    .create_conversation(&CreateConversation::direct(user))
                    .await?;
                conversation.validate()?;
                let id = conversation.id.clone();
                if self.store.upsert_conversation(conversation) {
                    self.publish(SessionUpdate::ConversationsChanged);
                }
                id
            }
        };

        self.select_conversation(id.clone()).await?;
        Ok(id)
    }

    /// Send `text` to the active conversation and append the stored message.
    pub async fn send_message(&mut self, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let conversation_id = self
            .active_conversation()
            .cloned()
            .ok_or(SessionError::NoActiveConversation)?;
        let me = self.me.clone().ok_or(SessionError::NotSignedIn)?;

        let outgoing = NewMessage {
            conversation_id: conversation_id.clone(),
            text: text.to_string(),
            sender_id: me.id.clone(),
            sender_name: me.display_name.clone(),
        };
        let message = self.backend.send_message(&outgoing).await?;
        message.validate()?;

        if self.typing.on_message_sent() {
            self.connection.emit(ClientEvent::StopTyping(TypingPayload {
                conversation_id: conversation_id.clone(),
                user_id: me.id,
            }));
        }
        if self.store.append_message(&message.conversation_id, message.clone()) {
            self.publish(SessionUpdate::MessageAppended(message.clone()));
        }
        Ok(message)
    }

    /// Keystroke in the composer of the active conversation.
    pub fn on_local_input_change(&mut self) {
        let Some(conversation_id) = self.active_conversation().cloned() else {
            return;
        };
        if !self.typing.on_local_input_change(Instant::now()) {
            return;
        }
        match self.me {
            Some(ref me) => {
                let payload = TypingPayload {
                    conversation_id,
                    user_id: me.id.clone(),
                };
                self.connection.emit(ClientEvent::Typing(payload));
            }
            None => debug!("no local user, typing not announced"),
        }
    }

    /// Forget the user: credential, persisted state, cache, connection.
    pub async fn logout(&mut self) {
        if self.connection.is_connected() {
            if let Some(id) = self.active_conversation().cloned() {
                self.connection.emit(ClientEvent::LeaveChat(id));
            }
        }
        self.disconnect();

        self.credential.clear().await;
        self.persistence.clear_credential().await;
        self.persistence.clear_active_conversation().await;
        self.persistence.clear_local_user().await;

        self.me = None;
        self.epoch += 1;
        self.list_refresh_in_flight = false;
        self.state = SyncState::Idle;
        self.pending_restore = None;
        self.latest_fetch.clear();
        self.typing.clear();
        self.store.clear();

        info!("logged out");
        self.publish(SessionUpdate::ActiveChanged(None));
        self.publish(SessionUpdate::ConversationsChanged);
    }

    /// Wait for and handle the next transport signal, fetch result or timer.
    pub async fn process_next(&mut self) {
        let event = self.next_event().await;
        self.handle_event(event).await;
    }

    /// Cancel-safe half of [`process_next`](Self::process_next).
    pub(crate) async fn next_event(&mut self) -> LoopEvent {
        let typing_deadline = self.typing.next_deadline();
        let reconnect_at = self.reconnect_at;
        tokio::select! {
            Some(signal) = self.transport_rx.recv() => LoopEvent::Transport(signal),
            Some(internal) = self.internal_rx.recv() => LoopEvent::Internal(internal),
            _ = sleep_until(typing_deadline) => LoopEvent::TypingDeadline,
            _ = sleep_until(reconnect_at) => LoopEvent::Reconnect,
        }
    }

    pub(crate) async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Transport(signal) => self.on_transport_signal(signal),
            LoopEvent::Internal(Internal::HistoryFetched {
                conversation_id,
                token,
                result,
            }) => self.on_history_fetched(conversation_id, token, result),
            LoopEvent::Internal(Internal::ConversationsFetched { epoch, result }) => {
                if epoch == self.epoch {
                    self.on_conversations_fetched(result).await
                } else {
                    debug!(epoch, current = self.epoch, "discarding conversation list from before logout");
                }
            }
            LoopEvent::Internal(Internal::ProfileFetched { epoch, result }) => {
                if epoch == self.epoch {
                    self.on_profile_fetched(result).await
                } else {
                    debug!(epoch, current = self.epoch, "discarding profile from before logout");
                }
            }
            LoopEvent::TypingDeadline => self.on_typing_deadline(),
            LoopEvent::Reconnect => {
                info!("reconnecting");
                self.connect().await;
            }
        }
    }

    fn on_connected(&mut self) {
        self.publish(SessionUpdate::ConnectionChanged(ConnectionState::Connected));
        let Some(id) = self.active_conversation().cloned() else {
            return;
        };
        self.connection.emit(ClientEvent::JoinChat(id.clone()));
        if matches!(self.state, SyncState::Switching(_)) {
            self.request_history(id);
        }
    }

    fn schedule_reconnect(&mut self) {
        if let Some(delay) = self.config.reconnect_delay() {
            info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    fn request_profile(&self) {
        let epoch = self.epoch;
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_current_user().await;
            let _ = tx.send(Internal::ProfileFetched { epoch, result });
        });
    }

    async fn on_profile_fetched(&mut self, result: Result<LocalUser>) {
        match result {
            Ok(user) if self.me.as_ref() != Some(&user) => {
                info!(user = %user.id, "local user refreshed");
                self.set_local_user(user).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "profile fetch failed, keeping stored user"),
        }
    }

    fn request_history(&mut self, id: ConversationId) {
        self.next_token += 1;
        let token = self.next_token;
        self.latest_fetch.insert(id.clone(), token);
        debug!(conversation = %id, token, "requesting history");

        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_messages(&id).await;
            let _ = tx.send(Internal::HistoryFetched {
                conversation_id: id,
                token,
                result,
            });
        });
    }

    fn on_history_fetched(
        &mut self,
        conversation_id: ConversationId,
        token: u64,
        result: Result<Vec<Message>>,
    ) {
        let latest = self.latest_fetch.get(&conversation_id).copied();
        if latest != Some(token) || self.active_conversation() != Some(&conversation_id) {
            debug!(conversation = %conversation_id, token, ?latest, "discarding stale history");
            return;
        }
        self.latest_fetch.remove(&conversation_id);

        let fetched = result.unwrap_or_else(|e| {
            warn!(conversation = %conversation_id, error = %e, "history fetch failed");
            Vec::new()
        });
        let messages: Vec<Message> = fetched
            .into_iter()
            .filter(|m| match m.validate() {
                Ok(()) if m.conversation_id == conversation_id => true,
                Ok(()) => {
                    warn!(conversation = %conversation_id, message = %m.id, "message from another conversation in history");
                    false
                }
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "skipping malformed message");
                    false
                }
            })
            .collect();

        self.store.replace_history(&conversation_id, messages);
        let count = self.store.get_history(&conversation_id).len();
        info!(conversation = %conversation_id, count, "history loaded");
        self.state = SyncState::Active(conversation_id.clone());
        self.publish(SessionUpdate::HistoryLoaded {
            conversation_id,
            count,
        });
    }

    async fn on_conversations_fetched(&mut self, result: Result<Vec<Conversation>>) {
        self.list_refresh_in_flight = false;
        let conversations = match result {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!(error = %e, "conversation list fetch failed");
                return;
            }
        };

        let mut changed = false;
        for conversation in conversations {
            if let Err(e) = conversation.validate() {
                warn!(conversation = %conversation.id, error = %e, "skipping malformed conversation");
                continue;
            }
            changed |= self.store.upsert_conversation(conversation);
        }
        if changed {
            self.publish(SessionUpdate::ConversationsChanged);
        }

        let Some(id) = self.pending_restore.take() else {
            return;
        };
        if self.store.contains(&id) {
            info!(conversation = %id, "restoring last active conversation");
            if let Err(e) = self.switch_to(id).await {
                warn!(error = %e, "restore failed");
            }
        } else {
            info!(conversation = %id, "last active conversation no longer listed");
            self.persistence.clear_active_conversation().await;
        }
    }

    fn on_transport_signal(&mut self, signal: TransportSignal) {
        match self.connection.on_signal(signal) {
            SignalOutcome::Stale => {}
            SignalOutcome::Event(event) => self.on_server_event(event),
            SignalOutcome::Lost => {
                self.publish(SessionUpdate::ConnectionChanged(ConnectionState::Disconnected));
                self.schedule_reconnect();
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage(message) => {
                let conversation_id = message.conversation_id.clone();
                if !self.store.contains(&conversation_id) {
                    warn!(conversation = %conversation_id, "message for unknown conversation, refreshing list");
                    self.refresh_conversations();
                    return;
                }
                if self.store.append_message(&conversation_id, message.clone()) {
                    self.publish(SessionUpdate::MessageAppended(message));
                }
            }
            ServerEvent::Typing(payload) => {
                if self.is_me(&payload.user_id) {
                    return;
                }
                let conversation_id = payload.conversation_id;
                if self
                    .typing
                    .on_remote_typing(&conversation_id, payload.user_id, Instant::now())
                {
                    self.publish_typing(conversation_id);
                }
            }
            ServerEvent::StopTyping(payload) => {
                if self.is_me(&payload.user_id) {
                    return;
                }
                if self
                    .typing
                    .on_remote_stop_typing(&payload.conversation_id, &payload.user_id)
                {
                    self.publish_typing(payload.conversation_id);
                }
            }
        }
    }

    fn on_typing_deadline(&mut self) {
        let expired = self.typing.expire(Instant::now());
        if let Some(conversation_id) = expired.local {
            if let Some(user_id) = self.me.as_ref().map(|me| me.id.clone()) {
                self.connection.emit(ClientEvent::StopTyping(TypingPayload {
                    conversation_id,
                    user_id,
                }));
            }
        }
        for conversation_id in expired.remote {
            self.publish_typing(conversation_id);
        }
    }

    fn is_me(&self, user: &UserId) -> bool {
        self.me.as_ref().is_some_and(|me| &me.id == user)
    }

    fn publish_typing(&self, conversation_id: ConversationId) {
        let users = self.typing.typing_users(&conversation_id);
        self.publish(SessionUpdate::TypingChanged {
            conversation_id,
            users,
        });
    }

    fn publish(&self, update: SessionUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
