//! Line-oriented front-end: slash commands drive the session, anything else
//! is sent to the active conversation.

use std::sync::Arc;

use anyhow::Result;
use chat_session::{
    ConnectionState, HttpBackend, LocalUser, PersistenceBridge, SessionHandle, SessionUpdate,
    UserId,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

const HELP: &str = "\
commands:
  /login <email> <password>   sign in
  /list                       list conversations
  /open <n|id>                switch to a conversation
  /users                      people you have no conversation with yet
  /dm <user-id>               open a direct conversation
  /history                    show the active conversation
  /typing                     tell the others you are typing
  /refresh                    reload the conversation list
  /logout                     sign out and forget this device
  /quit                       exit
anything else is sent to the active conversation";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Login { email: String, password: String },
    List,
    Open(String),
    Users,
    Direct(String),
    History,
    Typing,
    Refresh,
    Logout,
    Help,
    Quit,
    Send(String),
    Empty,
    Invalid(String),
}

pub fn parse_line(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Send(line.trim_end_matches(['\r', '\n']).to_string());
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    match (name, args.as_slice()) {
        ("login", [email, password]) => Input::Login {
            email: email.to_string(),
            password: password.to_string(),
        },
        ("login", _) => Input::Invalid("usage: /login <email> <password>".into()),
        ("list" | "ls", []) => Input::List,
        ("open", [target]) => Input::Open(target.to_string()),
        ("open", _) => Input::Invalid("usage: /open <n|id>".into()),
        ("users", []) => Input::Users,
        ("dm", [user]) => Input::Direct(user.to_string()),
        ("dm", _) => Input::Invalid("usage: /dm <user-id>".into()),
        ("history", []) => Input::History,
        ("typing", []) => Input::Typing,
        ("refresh", []) => Input::Refresh,
        ("logout", []) => Input::Logout,
        ("help" | "?", _) => Input::Help,
        ("quit" | "exit" | "q", []) => Input::Quit,
        _ => Input::Invalid(format!("unknown command: /{name} (try /help)")),
    }
}

pub async fn run(
    handle: SessionHandle,
    backend: Arc<HttpBackend>,
    persistence: PersistenceBridge,
) -> Result<()> {
    let renderer = tokio::spawn(render_updates(handle.clone(), handle.subscribe()));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::Invalid(msg) => println!("{msg}"),
            Input::Login { email, password } => match sign_in(
                &handle,
                &backend,
                &persistence,
                &email,
                &password,
            )
            .await
            {
                Ok(user) => {
                    println!(
                        "signed in as {}",
                        user.display_name.as_deref().unwrap_or(user.id.as_str())
                    );
                    if !handle.connect().await? {
                        println!("event channel unavailable, retrying in the background");
                    }
                    handle.refresh_conversations().await;
                }
                Err(e) => println!("login failed: {e}"),
            },
            Input::List => print_conversations(&handle).await?,
            Input::Open(target) => {
                let id = match target.parse::<usize>() {
                    Ok(n) if n >= 1 => {
                        let snapshot = handle.snapshot().await?;
                        match snapshot.conversations.get(n - 1) {
                            Some(c) => c.id.clone(),
                            None => {
                                println!("no conversation #{n}");
                                continue;
                            }
                        }
                    }
                    _ => target.into(),
                };
                if let Err(e) = handle.select_conversation(id).await {
                    println!("{e}");
                }
            }
            Input::Users => match handle.list_new_contacts().await {
                Ok(users) if users.is_empty() => println!("no one new to talk to"),
                Ok(users) => {
                    for user in users {
                        println!("  {:<24} /dm {}", user.name.as_deref().unwrap_or("?"), user.id);
                    }
                }
                Err(e) => println!("could not list users: {e}"),
            },
            Input::Direct(user) => {
                if let Err(e) = handle.open_direct(UserId::from(user)).await {
                    println!("{e}");
                }
            }
            Input::History => {
                let snapshot = handle.snapshot().await?;
                match snapshot.state.conversation() {
                    Some(id) => print_history(&handle, id.clone()).await,
                    None => println!("no active conversation"),
                }
            }
            Input::Typing => handle.input_changed().await,
            Input::Refresh => handle.refresh_conversations().await,
            Input::Logout => {
                handle.logout().await?;
                println!("signed out");
            }
            Input::Send(text) => {
                if let Err(e) = handle.send_message(text).await {
                    println!("not sent: {e}");
                }
            }
        }
    }

    handle.shutdown();
    renderer.abort();
    Ok(())
}

/// Log in and make the result the session's user. Signing in as a different
/// account first drops the previous account's session.
pub async fn sign_in(
    handle: &SessionHandle,
    backend: &HttpBackend,
    persistence: &PersistenceBridge,
    email: &str,
    password: &str,
) -> Result<LocalUser> {
    let previous = handle.snapshot().await?.local_user;
    let (credential, user) = backend.login(email, password).await?;

    if previous.is_some_and(|p| p.id != user.id) {
        info!(user = %user.id, "switching account, clearing previous session");
        handle.logout().await?;
        // logout cleared the shared cell along with the old session
        backend.credential().set(credential.clone()).await;
    }
    persistence.save_credential(&credential).await;
    handle.set_local_user(user.clone()).await?;
    Ok(user)
}

async fn print_conversations(handle: &SessionHandle) -> Result<()> {
    let snapshot = handle.snapshot().await?;
    if snapshot.conversations.is_empty() {
        println!("no conversations");
        return Ok(());
    }
    let me = snapshot.local_user.as_ref().map(|u| &u.id);
    let active = snapshot.state.conversation();
    for (i, conversation) in snapshot.conversations.iter().enumerate() {
        let marker = if Some(&conversation.id) == active { '*' } else { ' ' };
        let last = conversation.last_message_text.as_deref().unwrap_or("");
        println!(
            "{marker}{:>3}. {:<24} {}",
            i + 1,
            conversation.display_name(me),
            last
        );
    }
    Ok(())
}

async fn print_history(handle: &SessionHandle, id: chat_session::ConversationId) {
    for message in handle.history(id).await {
        let sender = message
            .sender_name
            .as_deref()
            .unwrap_or(message.sender_id.as_str());
        println!(
            "  {} {}: {}",
            message.created_at.format("%H:%M"),
            sender,
            message.text
        );
    }
}

async fn render_updates(handle: SessionHandle, mut updates: broadcast::Receiver<SessionUpdate>) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match update {
            SessionUpdate::ActiveChanged(Some(id)) => println!("* switched to {id}"),
            SessionUpdate::ActiveChanged(None) => println!("* no active conversation"),
            SessionUpdate::HistoryLoaded { conversation_id, .. } => {
                print_history(&handle, conversation_id).await
            }
            SessionUpdate::MessageAppended(message) => {
                let sender = message
                    .sender_name
                    .as_deref()
                    .unwrap_or(message.sender_id.as_str());
                println!("[{}] {}: {}", message.conversation_id, sender, message.text);
            }
            SessionUpdate::TypingChanged { users, .. } if !users.is_empty() => {
                let names: Vec<&str> = users.iter().map(|u| u.as_str()).collect();
                println!("* {} typing...", names.join(", "));
            }
            SessionUpdate::TypingChanged { .. } | SessionUpdate::ConversationsChanged => {}
            SessionUpdate::ConnectionChanged(ConnectionState::Connected) => println!("* connected"),
            SessionUpdate::ConnectionChanged(state) => println!("* {state:?}"),
        }
    }
}
