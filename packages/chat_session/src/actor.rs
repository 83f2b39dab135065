//! Session actor: runs a [`SessionSynchronizer`] on its own task and accepts
//! commands through a cloneable [`SessionHandle`].

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ConnectionState;
use crate::error::{Result, SessionError};
use crate::synchronizer::{SessionSynchronizer, SessionUpdate, SyncState};
use crate::types::{Conversation, ConversationId, LocalUser, Member, Message, UserId};

/// Commands that can be sent to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    SelectConversation {
        id: ConversationId,
        respond_to: oneshot::Sender<Result<()>>,
    },
    OpenDirect {
        user: UserId,
        respond_to: oneshot::Sender<Result<ConversationId>>,
    },
    SendMessage {
        text: String,
        respond_to: oneshot::Sender<Result<Message>>,
    },
    ListNewContacts {
        respond_to: oneshot::Sender<Result<Vec<Member>>>,
    },
    InputChanged,
    RefreshConversations,
    SetLocalUser {
        user: LocalUser,
        respond_to: oneshot::Sender<()>,
    },
    Connect {
        respond_to: oneshot::Sender<bool>,
    },
    Disconnect,
    Logout {
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    History {
        id: ConversationId,
        respond_to: oneshot::Sender<Vec<Message>>,
    },
}

/// Point-in-time view of the session for display.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SyncState,
    pub connection: ConnectionState,
    /// Most recently active first.
    pub conversations: Vec<Conversation>,
    pub typing: Vec<UserId>,
    pub local_user: Option<LocalUser>,
}

/// Handle to communicate with the session actor
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    updates: broadcast::Sender<SessionUpdate>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub async fn select_conversation(&self, id: ConversationId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::SelectConversation { id, respond_to: tx }, rx)
            .await?
    }

    pub async fn open_direct(&self, user: UserId) -> Result<ConversationId> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::OpenDirect { user, respond_to: tx }, rx)
            .await?
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.request(
            SessionCommand::SendMessage {
                text: text.into(),
                respond_to: tx,
            },
            rx,
        )
        .await?
    }

    /// Registered users without a direct conversation with the local user.
    pub async fn list_new_contacts(&self) -> Result<Vec<Member>> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::ListNewContacts { respond_to: tx }, rx)
            .await?
    }

    /// Fire-and-forget: a keystroke in the composer.
    pub async fn input_changed(&self) {
        let _ = self.sender.send(SessionCommand::InputChanged).await;
    }

    pub async fn refresh_conversations(&self) {
        let _ = self.sender.send(SessionCommand::RefreshConversations).await;
    }

    pub async fn set_local_user(&self, user: LocalUser) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::SetLocalUser { user, respond_to: tx }, rx)
            .await
    }

    pub async fn connect(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::Connect { respond_to: tx }, rx)
            .await
    }

    pub async fn disconnect(&self) {
        let _ = self.sender.send(SessionCommand::Disconnect).await;
    }

    pub async fn logout(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::Logout { respond_to: tx }, rx)
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::Snapshot { respond_to: tx }, rx)
            .await
    }

    pub async fn history(&self, id: ConversationId) -> Vec<Message> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionCommand::History { id, respond_to: tx }, rx)
            .await
            .unwrap_or_default()
    }

    /// Stop the actor. Pending commands are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, command: SessionCommand, rx: oneshot::Receiver<T>) -> Result<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Start `sync` and run it on a new task.
pub fn spawn_session(sync: SessionSynchronizer) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let handle = SessionHandle {
        sender,
        updates: sync.update_sender(),
        cancel: cancel.clone(),
    };
    tokio::spawn(run(sync, receiver, cancel));
    handle
}

async fn run(
    mut sync: SessionSynchronizer,
    mut receiver: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
) {
    sync.start().await;
    debug!("session actor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = receiver.recv() => match command {
                Some(command) => handle_command(&mut sync, command).await,
                None => break,
            },
            event = sync.next_event() => sync.handle_event(event).await,
        }
    }

    sync.disconnect();
    debug!("session actor stopped");
}

async fn handle_command(sync: &mut SessionSynchronizer, command: SessionCommand) {
    match command {
        SessionCommand::SelectConversation { id, respond_to } => {
            let _ = respond_to.send(sync.select_conversation(id).await);
        }
        SessionCommand::OpenDirect { user, respond_to } => {
            let _ = respond_to.send(sync.open_direct(user).await);
        }
        SessionCommand::SendMessage { text, respond_to } => {
            let _ = respond_to.send(sync.send_message(&text).await);
        }
        SessionCommand::ListNewContacts { respond_to } => {
            let _ = respond_to.send(sync.list_new_contacts().await);
        }
        SessionCommand::InputChanged => sync.on_local_input_change(),
        SessionCommand::RefreshConversations => sync.refresh_conversations(),
        SessionCommand::SetLocalUser { user, respond_to } => {
            sync.set_local_user(user).await;
            let _ = respond_to.send(());
        }
        SessionCommand::Connect { respond_to } => {
            let _ = respond_to.send(sync.connect().await);
        }
        SessionCommand::Disconnect => sync.disconnect(),
        SessionCommand::Logout { respond_to } => {
            sync.logout().await;
            let _ = respond_to.send(());
        }
        SessionCommand::Snapshot { respond_to } => {
            let snapshot = SessionSnapshot {
                state: sync.state().clone(),
                connection: sync.connection_state(),
                conversations: sync
                    .store()
                    .list_conversations()
                    .into_iter()
                    .cloned()
                    .collect(),
                typing: sync.typing_users(),
                local_user: sync.local_user().cloned(),
            };
            let _ = respond_to.send(snapshot);
        }
        SessionCommand::History { id, respond_to } => {
            let _ = respond_to.send(sync.store().get_history(&id).to_vec());
        }
    }
}
