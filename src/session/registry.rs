//! Client id -> session map
//!
//! The registry is the single owner of the id mapping. Everything that has
//! to look atomic to other connections (resume, takeover) happens under one
//! acquisition of its lock. Lock order is registry first, then session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{OutboundQueue, Session, SharedSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A session with this client id is already registered
    AlreadyRegistered(Arc<str>),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(id) => {
                write!(f, "session already registered: {}", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// How a connection came to own its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrigin {
    /// New session record
    Fresh,
    /// Existing persistent record reattached
    Resumed,
}

/// Result of [`SessionRegistry::claim`]
#[derive(Debug)]
pub struct Claim {
    pub session: SharedSession,
    pub origin: ClaimOrigin,
    /// Queue of the connection that held this client id before; already closed
    pub displaced: Option<Arc<OutboundQueue>>,
    /// Record that was replaced (clean session or protocol mismatch)
    pub discarded: Option<SharedSession>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Arc<str>, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions.lock().get(client_id).cloned()
    }

    /// Insert a session that must not already exist
    pub fn register(&self, session: SharedSession) -> Result<(), RegistryError> {
        let client_id = session.lock().client_id.clone();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&client_id) {
            return Err(RegistryError::AlreadyRegistered(client_id));
        }
        sessions.insert(client_id, session);
        Ok(())
    }

    /// Insert or replace, returning the previous record
    pub fn update(&self, session: SharedSession) -> Option<SharedSession> {
        let client_id = session.lock().client_id.clone();
        self.sessions.lock().insert(client_id, session)
    }

    pub fn remove(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions.lock().remove(client_id)
    }

    /// Remove `client_id` only if it still maps to `session`
    pub fn remove_if_current(&self, client_id: &str, session: &SharedSession) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(client_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Hand `client_id` to connection `owner` in one step.
    ///
    /// A persistent record is resumed when both it and the incoming
    /// connection ask for clean_session=false; otherwise `create` builds a
    /// replacement. A queue still attached to the old record is detached and
    /// closed, which ends the older connection.
    pub fn claim(
        &self,
        client_id: &Arc<str>,
        clean_session: bool,
        owner: u64,
        create: impl FnOnce() -> Session,
    ) -> Claim {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(client_id) {
            let mut current = existing.lock();
            if !clean_session && !current.clean_session {
                let displaced = current.claim(owner);
                if let Some(old) = &displaced {
                    old.close();
                }
                drop(current);
                return Claim {
                    session: existing.clone(),
                    origin: ClaimOrigin::Resumed,
                    displaced,
                    discarded: None,
                };
            }
        }

        let mut fresh = create();
        fresh.claim(owner);
        let session = Arc::new(Mutex::new(fresh));
        let discarded = sessions.insert(client_id.clone(), session.clone());
        let displaced = discarded.as_ref().and_then(|old| {
            let mut old = old.lock();
            let queue = old.claim(0);
            if let Some(q) = &queue {
                q.close();
            }
            queue
        });

        Claim {
            session,
            origin: ClaimOrigin::Fresh,
            displaced,
            discarded,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{ProtocolVersion, QoS};
    use crate::session::OverflowPolicy;

    fn queue() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(8, OverflowPolicy::Block, Duration::ZERO))
    }

    fn build(id: &Arc<str>, clean: bool) -> impl FnOnce() -> Session {
        let id = id.clone();
        move || Session::new(id, ProtocolVersion::V311, clean, 16)
    }

    /// Claim and attach a fresh queue, as a connecting client does
    fn connect(registry: &SessionRegistry, id: &Arc<str>, clean: bool, owner: u64) -> (Claim, Arc<OutboundQueue>) {
        let claim = registry.claim(id, clean, owner, build(id, clean));
        let q = queue();
        assert!(claim.session.lock().attach(owner, q.clone()));
        (claim, q)
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let registry = SessionRegistry::new();
        let id: Arc<str> = Arc::from("dup");
        let s = Arc::new(Mutex::new(build(&id, true)()));
        assert!(registry.register(s.clone()).is_ok());
        assert_eq!(
            registry.register(s),
            Err(RegistryError::AlreadyRegistered(id))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_claim_resumes_persistent_session() {
        let registry = SessionRegistry::new();
        let id: Arc<str> = Arc::from("p");
        let (first, q1) = connect(&registry, &id, false, 1);
        assert_eq!(first.origin, ClaimOrigin::Fresh);
        first
            .session
            .lock()
            .subscriptions
            .insert("a/b".into(), QoS::AtLeastOnce);

        let (second, q2) = connect(&registry, &id, false, 2);
        assert_eq!(second.origin, ClaimOrigin::Resumed);
        assert!(Arc::ptr_eq(&first.session, &second.session));
        assert!(q1.is_closed(), "older connection is shut down");
        assert!(!q2.is_closed());
        let session = second.session.lock();
        assert!(session.is_owned_by(2));
        assert!(!session.is_owned_by(1));
        assert_eq!(session.subscriptions.get("a/b"), Some(&QoS::AtLeastOnce));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_claim_clean_replaces_record() {
        let registry = SessionRegistry::new();
        let id: Arc<str> = Arc::from("c");
        let (first, q1) = connect(&registry, &id, false, 1);

        let (second, _q2) = connect(&registry, &id, true, 2);
        assert_eq!(second.origin, ClaimOrigin::Fresh);
        assert!(!Arc::ptr_eq(&first.session, &second.session));
        assert!(second.displaced.is_some());
        assert!(q1.is_closed());
        assert!(second
            .discarded
            .as_ref()
            .is_some_and(|old| Arc::ptr_eq(old, &first.session)));
        assert!(!first.session.lock().is_owned_by(1));
    }

    #[test]
    fn test_remove_if_current_ignores_stale() {
        let registry = SessionRegistry::new();
        let id: Arc<str> = Arc::from("s");
        let (first, _) = connect(&registry, &id, true, 1);
        let (second, _) = connect(&registry, &id, true, 2);

        assert!(!registry.remove_if_current(&id, &first.session));
        assert!(registry.find(&id).is_some());
        assert!(registry.remove_if_current(&id, &second.session));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_claims_leave_one_owner() {
        let registry = Arc::new(SessionRegistry::new());
        let id: Arc<str> = Arc::from("race");

        let owners: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (1..=8u64)
                .map(|owner| {
                    let registry = registry.clone();
                    let id = id.clone();
                    scope.spawn(move || {
                        let claim = registry.claim(&id, false, owner, build(&id, false));
                        let attached = claim.session.lock().attach(owner, queue());
                        (owner, attached)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|(_, attached)| *attached)
                .map(|(owner, _)| owner)
                .collect()
        });

        assert!(!owners.is_empty());
        let session = registry.find(&id).unwrap();
        let session = session.lock();
        let current: Vec<_> = owners.iter().filter(|o| session.is_owned_by(**o)).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
