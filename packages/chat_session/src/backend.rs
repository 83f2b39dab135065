//! REST collaborator: conversation list/create/fetch, message history/send,
//! and token renewal.
//!
//! Every response carries a `status` discriminator (`"success"` / `"error"`).
//! A request rejected for an expired access token is retried exactly once
//! after renewing the token with the refresh token; a second failure is
//! returned to the caller as [`SessionError::Unauthorized`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::persistence::PersistenceBridge;
use crate::types::{
    Conversation, ConversationId, Credential, LocalUser, Member, Message, NewMessage, UserId,
    full_name,
};

/// Shared, swappable credential. The session and the HTTP client read the
/// same token so a renewal is visible to the next reconnect.
#[derive(Clone, Default)]
pub struct CredentialCell {
    inner: Arc<RwLock<Option<Credential>>>,
}

impl CredentialCell {
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credential)),
        }
    }

    pub async fn get(&self) -> Option<Credential> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, credential: Credential) {
        *self.inner.write().await = Some(credential);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// Body of a conversation-creation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversation {
    pub members: Vec<UserId>,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CreateConversation {
    pub fn direct(with: UserId) -> Self {
        Self {
            members: vec![with],
            is_group: false,
            name: None,
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Create a conversation. A backend that answers "already exists" with the
    /// existing conversation attached yields that conversation.
    async fn create_conversation(&self, request: &CreateConversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation>;

    async fn fetch_messages(&self, id: &ConversationId) -> Result<Vec<Message>>;

    /// Persist a message; returns it with the server-assigned id and timestamp.
    async fn send_message(&self, message: &NewMessage) -> Result<Message>;

    /// Every registered user.
    async fn list_users(&self) -> Result<Vec<Member>>;

    /// Profile of the signed-in user.
    async fn fetch_current_user(&self) -> Result<LocalUser>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope<T> {
    Success(T),
    Error(ErrorBody),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    chat: Option<Conversation>,
}

#[derive(Debug, Deserialize)]
struct ChatsBody {
    chats: Vec<Conversation>,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    chat: Conversation,
}

#[derive(Debug, Deserialize)]
struct MessagesBody {
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct UsersBody {
    users: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(alias = "_id")]
    id: UserId,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

impl UserRecord {
    fn into_local_user(self) -> LocalUser {
        LocalUser {
            id: self.id,
            display_name: full_name(self.first_name, self.last_name),
        }
    }
}

fn expired_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("jwt expire") || message.contains("token expired")
}

pub struct HttpBackend {
    client: reqwest::Client,
    /// `{api_url}/api/v1`
    base_url: String,
    credential: CredentialCell,
    persistence: Option<PersistenceBridge>,
}

impl HttpBackend {
    pub fn new(api_url: &str, credential: CredentialCell) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/api/v1", api_url.trim_end_matches('/')),
            credential,
            persistence: None,
        }
    }

    /// Persist renewed access tokens through `persistence`.
    pub fn with_persistence(mut self, persistence: PersistenceBridge) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn credential(&self) -> &CredentialCell {
        &self.credential
    }

    /// Exchange email/password for a credential. The credential is installed
    /// in the shared cell; storing it is up to the caller.
    pub async fn login(&self, email: &str, password: &str) -> Result<(Credential, LocalUser)> {
        let body = serde_json::json!({ "email": email, "password": password });
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(SessionError::from_reqwest)?;

        match decode::<LoginBody>(response).await? {
            Envelope::Success(login) => {
                let credential = Credential {
                    access_token: login.access_token,
                    refresh_token: login.refresh_token,
                };
                self.credential.set(credential.clone()).await;
                let user = login.user.into_local_user();
                info!(user = %user.id, "logged in");
                Ok((credential, user))
            }
            Envelope::Error(err) => Err(SessionError::Unauthorized(err.message)),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Envelope<T>> {
        match self.call_once(method.clone(), path, body).await {
            Err(e) if e.is_credential_expired() => {
                debug!(path, "access token expired, renewing");
                self.renew_access_token().await?;
                self.call_once(method, path, body).await
            }
            other => other,
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Envelope<T>> {
        let credential = self
            .credential
            .get()
            .await
            .ok_or(SessionError::MissingCredential)?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, credential.access_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(SessionError::from_reqwest)?;

        match decode::<T>(response).await? {
            Envelope::Error(err) if expired_message(&err.message) => {
                Err(SessionError::Unauthorized(err.message))
            }
            envelope => Ok(envelope),
        }
    }

    async fn renew_access_token(&self) -> Result<()> {
        let current = self
            .credential
            .get()
            .await
            .ok_or(SessionError::MissingCredential)?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| SessionError::Unauthorized("no refresh token".to_string()))?;

        let url = format!("{}/auth/refresh-token", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, refresh_token)
            .send()
            .await
            .map_err(SessionError::from_reqwest)?;

        let renewed = match decode::<RefreshBody>(response).await {
            Ok(Envelope::Success(body)) => body.access_token,
            Ok(Envelope::Error(err)) => {
                warn!(message = %err.message, "token renewal rejected");
                return Err(SessionError::Unauthorized(format!(
                    "token renewal failed: {}",
                    err.message
                )));
            }
            Err(e) => {
                warn!(error = %e, "token renewal failed");
                return Err(SessionError::Unauthorized(format!("token renewal failed: {e}")));
            }
        };

        let credential = Credential {
            access_token: renewed,
            refresh_token: current.refresh_token,
        };
        if let Some(ref persistence) = self.persistence {
            persistence.save_credential(&credential).await;
        }
        self.credential.set(credential).await;
        info!("access token renewed");
        Ok(())
    }
}

/// Decode a response body into an envelope. Auth failures that arrive
/// without a well-formed envelope still map to `Unauthorized`.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Envelope<T>> {
    let status = response.status();
    let text = response.text().await.map_err(SessionError::from_reqwest)?;

    match serde_json::from_str::<Envelope<T>>(&text) {
        Ok(Envelope::Error(err))
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            Err(SessionError::Unauthorized(err.message))
        }
        Ok(envelope) => Ok(envelope),
        Err(_) if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
            Err(SessionError::Unauthorized(format!("HTTP {status}")))
        }
        Err(_) if !status.is_success() => Err(SessionError::Request(format!("HTTP {status}"))),
        Err(e) => Err(SessionError::malformed("response", e.to_string())),
    }
}

fn into_result<T>(envelope: Envelope<T>) -> Result<T> {
    match envelope {
        Envelope::Success(body) => Ok(body),
        Envelope::Error(err) => Err(SessionError::Rejected(err.message)),
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let body: ChatsBody = into_result(self.call(Method::GET, "/chats", None).await?)?;
        Ok(body.chats)
    }

    async fn create_conversation(&self, request: &CreateConversation) -> Result<Conversation> {
        let payload = serde_json::to_value(request)?;
        match self.call::<ChatBody>(Method::POST, "/chats", Some(&payload)).await? {
            Envelope::Success(body) => Ok(body.chat),
            Envelope::Error(ErrorBody {
                chat: Some(existing),
                message,
            }) => {
                debug!(conversation = %existing.id, message = %message, "conversation already exists");
                Ok(existing)
            }
            Envelope::Error(err) => Err(SessionError::Rejected(err.message)),
        }
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let path = format!("/chats/{id}");
        let body: ChatBody = into_result(self.call(Method::GET, &path, None).await?)?;
        Ok(body.chat)
    }

    async fn fetch_messages(&self, id: &ConversationId) -> Result<Vec<Message>> {
        let path = format!("/messages/{id}");
        let body: MessagesBody = into_result(self.call(Method::GET, &path, None).await?)?;
        Ok(body.messages)
    }

    async fn send_message(&self, message: &NewMessage) -> Result<Message> {
        let payload = serde_json::to_value(message)?;
        let body: MessageBody =
            into_result(self.call(Method::POST, "/messages", Some(&payload)).await?)?;
        Ok(body.message)
    }

    async fn list_users(&self) -> Result<Vec<Member>> {
        let body: UsersBody = into_result(self.call(Method::GET, "/user/all", None).await?)?;
        Ok(body.users)
    }

    async fn fetch_current_user(&self) -> Result<LocalUser> {
        let body: UserBody = into_result(self.call(Method::GET, "/user", None).await?)?;
        Ok(body.user.into_local_user())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Counters {
        messages: Arc<AtomicUsize>,
        refreshes: Arc<AtomicUsize>,
        /// When set, refresh requests are rejected.
        refuse_refresh: bool,
    }

    fn auth(headers: &HeaderMap) -> &str {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    async fn list_chats(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if auth(&headers).is_empty() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"status": "error", "message": "no token"})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "chats": [{
                    "_id": "c1",
                    "isGroup": false,
                    "members": [
                        {"_id": "u1", "firstName": "Ann", "lastName": "Lee"},
                        {"_id": "u2", "firstName": "Bob", "email": "bob@example.com"}
                    ],
                    "createdAt": "2024-05-01T09:00:00Z",
                    "updatedAt": "2024-05-01T10:00:00Z",
                    "__v": 0
                }]
            })),
        )
    }

    async fn messages(
        State(counters): State<Counters>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        counters.messages.fetch_add(1, Ordering::SeqCst);
        if auth(&headers) != "fresh" {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"status": "error", "message": "jwt expired"})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "messages": [{
                    "_id": "m1", "chatId": "c1",
                    "senderId": {"_id": "u2", "firstName": "Bob"},
                    "text": "hello", "createdAt": "2024-05-01T10:00:00Z"
                }]
            })),
        )
    }

    async fn refresh(
        State(counters): State<Counters>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        counters.refreshes.fetch_add(1, Ordering::SeqCst);
        if counters.refuse_refresh || auth(&headers) != "refresh-1" {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"status": "error", "message": "invalid refresh token"})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({"status": "success", "accessToken": "fresh"})),
        )
    }

    async fn create_chat(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["isGroup"], json!(false));
        Json(json!({
            "status": "error",
            "message": "chat already exists",
            "chat": {
                "id": "c1",
                "members": [{"id": "u1"}, {"id": "u2"}],
                "updatedAt": "2024-05-01T10:00:00Z"
            }
        }))
    }

    async fn all_users() -> Json<Value> {
        Json(json!({
            "status": "success",
            "users": [
                {"_id": "u1", "firstName": "Ann", "lastName": "Lee", "email": "ann@example.com"},
                {"_id": "u3", "firstName": "Cy"}
            ]
        }))
    }

    async fn current_user(headers: HeaderMap) -> Json<Value> {
        assert_eq!(auth(&headers), "fresh");
        Json(json!({
            "status": "success",
            "user": {"_id": "u1", "firstName": "Ann", "lastName": "Lee", "email": "ann@example.com"}
        }))
    }

    async fn serve(counters: Counters) -> String {
        let app = Router::new()
            .route("/api/v1/chats", get(list_chats).post(create_chat))
            .route("/api/v1/user/all", get(all_users))
            .route("/api/v1/user", get(current_user))
            .route("/api/v1/messages/{id}", get(messages))
            .route("/api/v1/auth/refresh-token", get(refresh))
            .route(
                "/api/v1/messages",
                post(|| async { Json(json!({"status": "error", "message": "chat not found"})) }),
            )
            .with_state(counters);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(url: &str, access: &str) -> HttpBackend {
        let cell = CredentialCell::new(Some(Credential::new(access).with_refresh("refresh-1")));
        HttpBackend::new(url, cell)
    }

    #[tokio::test]
    async fn list_conversations_success() {
        let url = serve(Counters::default()).await;
        let chats = backend(&url, "fresh").list_conversations().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].display_name(Some(&"u1".into())), "Bob");
    }

    #[tokio::test]
    async fn document_shaped_history_decodes() {
        let url = serve(Counters::default()).await;
        let messages = backend(&url, "fresh")
            .fetch_messages(&"c1".into())
            .await
            .unwrap();
        assert_eq!(messages[0].id.as_str(), "m1");
        assert_eq!(messages[0].sender_id.as_str(), "u2");
        assert_eq!(messages[0].sender_name.as_deref(), Some("Bob"));
        assert!(messages[0].validate().is_ok());
    }

    #[tokio::test]
    async fn user_directory_and_profile() {
        let url = serve(Counters::default()).await;
        let backend = backend(&url, "fresh");

        let users = backend.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id.as_str(), "u1");
        assert_eq!(users[0].name.as_deref(), Some("Ann Lee"));
        assert_eq!(users[1].name.as_deref(), Some("Cy"));

        let me = backend.fetch_current_user().await.unwrap();
        assert_eq!(me.id.as_str(), "u1");
        assert_eq!(me.display_name.as_deref(), Some("Ann Lee"));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_request() {
        let url = serve(Counters::default()).await;
        let backend = HttpBackend::new(&url, CredentialCell::default());
        let err = backend.list_conversations().await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredential));
    }

    #[tokio::test]
    async fn expired_token_renewed_and_retried_once() {
        let counters = Counters::default();
        let url = serve(counters.clone()).await;
        let persistence = PersistenceBridge::in_memory();
        let backend = backend(&url, "stale").with_persistence(persistence.clone());

        let messages = backend.fetch_messages(&"c1".into()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(counters.messages.load(Ordering::SeqCst), 2);
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);

        let renewed = backend.credential().get().await.unwrap();
        assert_eq!(renewed.access_token, "fresh");
        assert_eq!(renewed.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(
            persistence.load_credential().await.unwrap().access_token,
            "fresh"
        );
    }

    #[tokio::test]
    async fn failed_renewal_is_terminal_for_the_operation() {
        let counters = Counters {
            refuse_refresh: true,
            ..Default::default()
        };
        let url = serve(counters.clone()).await;
        let err = backend(&url, "stale")
            .fetch_messages(&"c1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(_)));
        assert_eq!(counters.messages.load(Ordering::SeqCst), 1);
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_returns_existing_conversation() {
        let url = serve(Counters::default()).await;
        let chat = backend(&url, "fresh")
            .create_conversation(&CreateConversation::direct("u2".into()))
            .await
            .unwrap();
        assert_eq!(chat.id.as_str(), "c1");
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let url = serve(Counters::default()).await;
        let err = backend(&url, "fresh")
            .send_message(&NewMessage {
                conversation_id: "nope".into(),
                text: "hi".into(),
                sender_id: "u1".into(),
                sender_name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Rejected(ref m) if m == "chat not found"));
    }

    #[tokio::test]
    async fn connection_refused_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = backend(&format!("http://{addr}"), "fresh")
            .list_conversations()
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unavailable));
    }
}
