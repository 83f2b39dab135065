//! Recording fakes for the transport and the backend.
//!
//! Both fakes append to one shared [`OpLog`], so tests can assert the relative
//! order of channel emissions and history requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::{broadcast, oneshot};

use crate::backend::{ChatBackend, CreateConversation, CredentialCell};
use crate::config::SessionConfig;
use crate::connection::{Transport, TransportEvent, TransportSink};
use crate::error::{Result, SessionError};
use crate::persistence::PersistenceBridge;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::synchronizer::{SessionSynchronizer, SessionUpdate};
use crate::types::{
    Conversation, ConversationId, Credential, LocalUser, Member, Message, NewMessage,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Open,
    Emit(ClientEvent),
    ListConversations,
    CreateConversation(Vec<String>),
    FetchHistory(ConversationId),
    SendMessage(String),
    ListUsers,
    FetchProfile,
}

#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<Op>>>);

impl OpLog {
    fn push(&self, op: Op) {
        self.0.lock().unwrap().push(op);
    }

    pub fn snapshot(&self) -> Vec<Op> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn emits(&self) -> Vec<ClientEvent> {
        self.snapshot()
            .into_iter()
            .filter_map(|op| match op {
                Op::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

/// The server side of the fake channel.
#[derive(Clone, Default)]
pub struct Remote {
    sink: Arc<Mutex<Option<TransportSink>>>,
    refuse: Arc<AtomicBool>,
}

impl Remote {
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn current_sink(&self) -> Option<TransportSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn send(&self, event: ServerEvent) {
        if let Some(sink) = self.current_sink() {
            sink.deliver(TransportEvent::Event(event));
        }
    }

    pub fn drop_connection(&self) {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.deliver(TransportEvent::Closed {
                reason: "connection reset".into(),
            });
        }
    }
}

pub struct FakeTransport {
    log: OpLog,
    remote: Remote,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self, _credential: &Credential, sink: TransportSink) -> Result<()> {
        self.log.push(Op::Open);
        if self.remote.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable);
        }
        *self.remote.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn send(&mut self, event: &ClientEvent) -> Result<()> {
        self.log.push(Op::Emit(event.clone()));
        Ok(())
    }

    fn close(&mut self) {
        self.remote.sink.lock().unwrap().take();
    }
}

pub struct FakeBackend {
    log: OpLog,
    conversations: Mutex<Vec<Conversation>>,
    histories: Mutex<HashMap<ConversationId, Vec<Message>>>,
    held: Mutex<HashMap<ConversationId, VecDeque<oneshot::Receiver<()>>>>,
    users: Mutex<Vec<Member>>,
    profile: Mutex<LocalUser>,
    fail_list: AtomicBool,
    sent: AtomicUsize,
}

impl FakeBackend {
    pub fn new(log: OpLog, conversations: Vec<Conversation>) -> Self {
        Self {
            log,
            conversations: Mutex::new(conversations),
            histories: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            users: Mutex::new(Vec::new()),
            profile: Mutex::new(local_user()),
            fail_list: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn set_history(&self, id: &str, messages: Vec<Message>) {
        self.histories.lock().unwrap().insert(id.into(), messages);
    }

    pub fn set_users(&self, users: Vec<Member>) {
        *self.users.lock().unwrap() = users;
    }

    pub fn set_profile(&self, profile: LocalUser) {
        *self.profile.lock().unwrap() = profile;
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// The next history fetch for `id` waits until the returned sender fires.
    pub fn hold_history(&self, id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.held
            .lock()
            .unwrap()
            .entry(id.into())
            .or_default()
            .push_back(rx);
        tx
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.log.push(Op::ListConversations);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable);
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn create_conversation(&self, request: &CreateConversation) -> Result<Conversation> {
        self.log.push(Op::CreateConversation(
            request.members.iter().map(|m| m.to_string()).collect(),
        ));
        let mut conversations = self.conversations.lock().unwrap();
        let peer = request
            .members
            .first()
            .cloned()
            .ok_or_else(|| SessionError::Rejected("no members".into()))?;
        if let Some(existing) = conversations
            .iter()
            .find(|c| !c.is_group && c.has_member(&peer))
        {
            return Ok(existing.clone());
        }
        let created = Conversation::direct(
            format!("c-{peer}"),
            Member::named("me", "Me"),
            Member::new(peer),
        );
        conversations.push(created.clone());
        Ok(created)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| &c.id == id)
            .cloned()
            .ok_or_else(|| SessionError::Rejected("chat not found".into()))
    }

    async fn fetch_messages(&self, id: &ConversationId) -> Result<Vec<Message>> {
        self.log.push(Op::FetchHistory(id.clone()));
        let gate = self
            .held
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|queue| queue.pop_front());
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &NewMessage) -> Result<Message> {
        self.log.push(Op::SendMessage(message.text.clone()));
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: format!("sent-{n}").into(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            text: message.text.clone(),
            created_at: Utc::now(),
        })
    }

    async fn list_users(&self) -> Result<Vec<Member>> {
        self.log.push(Op::ListUsers);
        Ok(self.users.lock().unwrap().clone())
    }

    async fn fetch_current_user(&self) -> Result<LocalUser> {
        self.log.push(Op::FetchProfile);
        Ok(self.profile.lock().unwrap().clone())
    }
}

/// Direct conversation between `me` and `peer`, updated `secs` after a fixed epoch.
pub fn convo(id: &str, peer: &str, secs: i64) -> Conversation {
    Conversation::direct(id, Member::named("me", "Me"), Member::new(peer))
        .with_updated_at(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
}

pub fn message(id: &str, conversation: &str, sender: &str, secs: i64) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_id: sender.into(),
        sender_name: None,
        text: format!("text {id}"),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

pub fn local_user() -> LocalUser {
    LocalUser {
        id: "me".into(),
        display_name: Some("Me".into()),
    }
}

/// A synchronizer wired to recording fakes, with a previous login already
/// persisted (local user and, unless built `without_credential`, a credential).
pub struct Harness {
    pub sync: SessionSynchronizer,
    pub log: OpLog,
    pub backend: Arc<FakeBackend>,
    pub remote: Remote,
    pub persistence: PersistenceBridge,
    pub credential: CredentialCell,
    updates: broadcast::Receiver<SessionUpdate>,
}

impl Harness {
    pub async fn new(conversations: Vec<Conversation>) -> Self {
        let harness = Self::without_credential(conversations).await;
        harness
            .persistence
            .save_credential(&Credential::new("token").with_refresh("refresh"))
            .await;
        harness
    }

    pub async fn without_credential(conversations: Vec<Conversation>) -> Self {
        let log = OpLog::default();
        let remote = Remote::default();
        let backend = Arc::new(FakeBackend::new(log.clone(), conversations));
        let persistence = PersistenceBridge::in_memory();
        let credential = CredentialCell::default();
        persistence.save_local_user(&local_user()).await;

        let transport = FakeTransport {
            log: log.clone(),
            remote: remote.clone(),
        };
        let sync = SessionSynchronizer::new(
            SessionConfig::default(),
            Box::new(transport),
            backend.clone(),
            persistence.clone(),
            credential.clone(),
        );
        let updates = sync.subscribe();
        Self {
            sync,
            log,
            backend,
            remote,
            persistence,
            credential,
            updates,
        }
    }

    /// Handle everything that is ready, without letting timers fire.
    pub async fn settle(&mut self) {
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(1), self.sync.next_event()).await
        {
            self.sync.handle_event(event).await;
        }
    }

    /// Move the paused clock forward, then settle.
    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.settle().await;
    }

    /// Updates broadcast since the last call.
    pub fn updates(&mut self) -> Vec<SessionUpdate> {
        let mut seen = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            seen.push(update);
        }
        seen
    }
}
