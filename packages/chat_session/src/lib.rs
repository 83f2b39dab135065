//! Client-side chat session synchronizer.
//!
//! Keeps the active conversation, its cached history and the typing
//! indicators consistent with a duplex event channel while the user switches
//! conversations, the connection drops and comes back, and the process
//! restarts.
//!
//! The pieces, leaves first:
//!
//! - [`connection::ConnectionManager`] owns the one channel connection.
//! - [`store::ConversationStore`] caches conversations and their history.
//! - [`typing::TypingTracker`] tracks who is composing.
//! - [`persistence::PersistenceBridge`] remembers the last active conversation
//!   and the credential.
//! - [`synchronizer::SessionSynchronizer`] ties them together;
//!   [`actor::spawn_session`] runs it on its own task.
//!
//! [`ws_transport::WsTransport`] and [`backend::HttpBackend`] are the
//! production channel and REST collaborators.

pub mod actor;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod store;
pub mod synchronizer;
pub mod types;
pub mod typing;
pub mod ws_transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use actor::{SessionHandle, SessionSnapshot, spawn_session};
pub use backend::{ChatBackend, CredentialCell, HttpBackend};
pub use config::SessionConfig;
pub use connection::{ConnectionState, Transport};
pub use error::{Result, SessionError};
pub use persistence::{KeyValueStore, MemoryKeyValueStore, PersistenceBridge, SqliteKeyValueStore};
pub use synchronizer::{SessionSynchronizer, SessionUpdate, SyncState};
pub use types::{Conversation, ConversationId, Credential, LocalUser, Member, Message, MessageId, UserId};
pub use ws_transport::WsTransport;
