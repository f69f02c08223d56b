//! Session storage
//!
//! The broker persists what a clean_session=false client needs to resume
//! (subscriptions, in-flight tables, queued messages) through the
//! [`SessionStore`] trait. [`MemoryStore`] is the in-process implementation
//! and the reference behavior for other backends.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::protocol::{ProtocolVersion, Publish, QoS};
use crate::session::InflightMessage;

/// Errors returned by a session store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or failed
    Unavailable(String),
    /// `register_session` for an id that already has a record
    AlreadyExists(String),
    /// `update_session` for an id with no record
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "session store unavailable: {}", e),
            Self::AlreadyExists(id) => write!(f, "session already stored: {}", id),
            Self::NotFound(id) => write!(f, "no stored session: {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Resumable part of a persistent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub protocol_version: ProtocolVersion,
    pub subscriptions: Vec<(String, QoS)>,
    pub inflight_outgoing: Vec<InflightMessage>,
    pub inflight_incoming: Vec<InflightMessage>,
    /// Messages queued while the client was offline
    pub pending: Vec<Publish>,
}

impl StoredSession {
    /// Record for a persistent session that has nothing to resume yet
    pub fn empty(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            subscriptions: Vec::new(),
            inflight_outgoing: Vec::new(),
            inflight_incoming: Vec::new(),
            pending: Vec::new(),
        }
    }
}

/// Storage backend for persistent sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a stored session
    async fn find_session(&self, client_id: &str) -> StoreResult<Option<StoredSession>>;

    /// Create a record; fails with `AlreadyExists` if one is present
    async fn register_session(&self, client_id: &str, session: &StoredSession)
        -> StoreResult<()>;

    /// Replace an existing record
    async fn update_session(&self, client_id: &str, session: &StoredSession) -> StoreResult<()>;

    /// Remove a record (missing ids are not an error)
    async fn delete_session(&self, client_id: &str) -> StoreResult<()>;
}

/// In-memory session store
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<String, StoredSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_session(&self, client_id: &str) -> StoreResult<Option<StoredSession>> {
        Ok(self.sessions.get(client_id).map(|s| s.value().clone()))
    }

    async fn register_session(
        &self,
        client_id: &str,
        session: &StoredSession,
    ) -> StoreResult<()> {
        match self.sessions.entry(client_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(client_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn update_session(&self, client_id: &str, session: &StoredSession) -> StoreResult<()> {
        match self.sessions.get_mut(client_id) {
            Some(mut entry) => {
                *entry = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(client_id.to_string())),
        }
    }

    async fn delete_session(&self, client_id: &str) -> StoreResult<()> {
        self.sessions.remove(client_id);
        Ok(())
    }
}
