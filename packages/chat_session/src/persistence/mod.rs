//! Persistence Bridge
//!
//! Best-effort key-value persistence for the little state that must survive
//! a restart: the last active conversation, the signed-in user, and the
//! credential used to reconnect. Storage failures are logged, never returned.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::types::{ConversationId, Credential, LocalUser};

pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

const ACTIVE_CONVERSATION_KEY: &str = "activeChatId";
const ACCESS_TOKEN_KEY: &str = "accessToken";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const LOCAL_USER_KEY: &str = "chatAppUser";

/// Small string values keyed by name.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct PersistenceBridge {
    /// Survives restarts.
    durable: Arc<dyn KeyValueStore>,
    /// Lives as long as the client session.
    session: Arc<dyn KeyValueStore>,
}

impl PersistenceBridge {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    /// Both scopes in memory; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
        )
    }

    pub async fn save_active_conversation(&self, id: &ConversationId) {
        set(&*self.durable, ACTIVE_CONVERSATION_KEY, id.as_str()).await;
    }

    pub async fn load_active_conversation(&self) -> Option<ConversationId> {
        get(&*self.durable, ACTIVE_CONVERSATION_KEY)
            .await
            .filter(|id| !id.is_empty())
            .map(ConversationId::from)
    }

    pub async fn clear_active_conversation(&self) {
        remove(&*self.durable, ACTIVE_CONVERSATION_KEY).await;
    }

    pub async fn save_credential(&self, credential: &Credential) {
        set(&*self.session, ACCESS_TOKEN_KEY, &credential.access_token).await;
        match credential.refresh_token {
            Some(ref refresh) => set(&*self.session, REFRESH_TOKEN_KEY, refresh).await,
            None => remove(&*self.session, REFRESH_TOKEN_KEY).await,
        }
    }

    pub async fn load_credential(&self) -> Option<Credential> {
        let access_token = get(&*self.session, ACCESS_TOKEN_KEY).await?;
        let refresh_token = get(&*self.session, REFRESH_TOKEN_KEY).await;
        Some(Credential {
            access_token,
            refresh_token,
        })
    }

    pub async fn clear_credential(&self) {
        remove(&*self.session, ACCESS_TOKEN_KEY).await;
        remove(&*self.session, REFRESH_TOKEN_KEY).await;
    }

    pub async fn save_local_user(&self, user: &LocalUser) {
        match serde_json::to_string(user) {
            Ok(json) => set(&*self.durable, LOCAL_USER_KEY, &json).await,
            Err(e) => warn!(error = %e, "failed to encode local user"),
        }
    }

    pub async fn load_local_user(&self) -> Option<LocalUser> {
        let json = get(&*self.durable, LOCAL_USER_KEY).await?;
        match serde_json::from_str(&json) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "failed to parse stored user");
                None
            }
        }
    }

    pub async fn clear_local_user(&self) {
        remove(&*self.durable, LOCAL_USER_KEY).await;
    }
}

async fn get(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "failed to read persisted value");
            None
        }
    }
}

async fn set(store: &dyn KeyValueStore, key: &str, value: &str) {
    if let Err(e) = store.set(key, value).await {
        warn!(key, error = %e, "failed to persist value");
    }
}

async fn remove(store: &dyn KeyValueStore, key: &str) {
    if let Err(e) = store.remove(key).await {
        warn!(key, error = %e, "failed to remove persisted value");
    }
}
