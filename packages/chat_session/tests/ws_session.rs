//! End to end: real WebSocket channel and REST client against local servers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use chat_session::{
    ConnectionState, Credential, CredentialCell, HttpBackend, LocalUser, PersistenceBridge,
    SessionConfig, SessionSynchronizer, SessionUpdate, SyncState, WsTransport, spawn_session,
};

async fn serve_rest() -> String {
    let app = Router::new()
        .route(
            "/api/v1/chats",
            get(|| async {
                Json(json!({
                    "status": "success",
                    "chats": [{
                        "id": "c1",
                        "isGroup": false,
                        "members": [{"id": "me"}, {"id": "alice", "name": "Alice"}],
                        "updatedAt": "2024-05-01T10:00:00Z"
                    }]
                }))
            }),
        )
        .route(
            "/api/v1/messages/{id}",
            get(|| async {
                Json(json!({
                    "status": "success",
                    "messages": [{
                        "id": "m1", "chatId": "c1", "senderId": "alice",
                        "text": "earlier", "createdAt": "2024-05-01T09:00:00Z"
                    }]
                }))
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Accepts one channel connection. Answers every `join_chat` with a pushed
/// message for that conversation.
async fn serve_channel(auth_seen: Arc<Mutex<Option<String>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| {
            *auth_seen.lock().unwrap() = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok::<Response, ErrorResponse>(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            let Frame::Text(text) = frame else { continue };
            let event: Value = serde_json::from_str(text.as_str()).unwrap();
            if event["event"] == "join_chat" {
                let push = json!({
                    "event": "receive_message",
                    "data": {
                        "id": "m2", "chatId": event["data"], "senderId": "alice",
                        "text": "welcome back", "createdAt": "2024-05-01T10:05:00Z"
                    }
                });
                ws.send(Frame::Text(push.to_string().into())).await.unwrap();
            }
        }
    });
    format!("ws://{addr}/ws")
}

async fn wait_for(
    updates: &mut broadcast::Receiver<SessionUpdate>,
    pred: impl Fn(&SessionUpdate) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await {
                Ok(update) if pred(&update) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session closed"),
            }
        }
    })
    .await
    .expect("update not seen");
}

#[tokio::test]
async fn session_over_real_transports() {
    let auth_seen = Arc::new(Mutex::new(None));
    let api_url = serve_rest().await;
    let ws_url = serve_channel(auth_seen.clone()).await;

    let persistence = PersistenceBridge::in_memory();
    persistence
        .save_local_user(&LocalUser {
            id: "me".into(),
            display_name: None,
        })
        .await;
    let credential = CredentialCell::new(Some(Credential::new("secret")));
    let backend = Arc::new(HttpBackend::new(&api_url, credential.clone()));
    let sync = SessionSynchronizer::new(
        SessionConfig::default(),
        Box::new(WsTransport::new(ws_url)),
        backend,
        persistence.clone(),
        credential,
    );

    let mut updates = sync.subscribe();
    let handle = spawn_session(sync);
    wait_for(&mut updates, |u| *u == SessionUpdate::ConversationsChanged).await;
    assert_eq!(auth_seen.lock().unwrap().as_deref(), Some("Bearer secret"));

    handle.select_conversation("c1".into()).await.unwrap();
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::MessageAppended(m) if m.text == "welcome back")
    })
    .await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Connected);

    // history and the pushed message end up together, whichever landed first
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.snapshot().await.unwrap().state == SyncState::Active("c1".into()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let texts: Vec<String> = handle
        .history("c1".into())
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts.len(), 2);
    assert!(texts.contains(&"earlier".to_string()));
    assert!(texts.contains(&"welcome back".to_string()));
    assert_eq!(persistence.load_active_conversation().await, Some("c1".into()));

    handle.shutdown();
}
