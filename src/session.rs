use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::crypto::SessionCrypto;
use crate::substitution::SubstitutionStore;

/// The single current session. Its `active_workspace_id` drives routing and
/// scopes the substitution map.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub active_workspace_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Owns the current session and the per-session substitution stores.
///
/// Exactly one session is current at any time. Workspace activation
/// replaces the `active_workspace_id` under the mutex; requests capture a
/// snapshot at pipeline entry and finish under the workspace they started
/// with.
pub struct SessionRegistry {
    current: Mutex<Session>,
    stores: Mutex<HashMap<String, Arc<SubstitutionStore>>>,
    crypto: Arc<SessionCrypto>,
}

impl SessionRegistry {
    pub fn new(default_workspace_id: impl Into<String>) -> Self {
        SessionRegistry {
            current: Mutex::new(Session {
                id: Uuid::new_v4().to_string(),
                active_workspace_id: default_workspace_id.into(),
                updated_at: Utc::now(),
            }),
            stores: Mutex::new(HashMap::new()),
            crypto: Arc::new(SessionCrypto::new()),
        }
    }

    pub fn current(&self) -> Session {
        self.current.lock().unwrap().clone()
    }

    /// Point the current session at a workspace. Serialized on the session
    /// mutex; concurrent activations cannot interleave.
    pub fn activate_workspace(&self, workspace_id: &str) -> Session {
        let mut session = self.current.lock().unwrap();
        session.active_workspace_id = workspace_id.to_string();
        session.updated_at = Utc::now();
        session.clone()
    }

    /// The substitution store for a session id, created on first use.
    pub fn store_for(&self, session_id: &str) -> Arc<SubstitutionStore> {
        let mut stores = self.stores.lock().unwrap();
        stores
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SubstitutionStore::new(session_id, self.crypto.clone()))
            })
            .clone()
    }

    /// The store scoped to the current session.
    pub fn current_store(&self) -> Arc<SubstitutionStore> {
        let id = self.current.lock().unwrap().id.clone();
        self.store_for(&id)
    }

    /// Wipe a session's substitution state. Used on shutdown and when a
    /// session is replaced.
    pub fn end_session(&self, session_id: &str) {
        if let Some(store) = self.stores.lock().unwrap().remove(session_id) {
            store.cleanup();
        }
    }

    pub fn shutdown(&self) {
        let mut stores = self.stores.lock().unwrap();
        for (_, store) in stores.drain() {
            store.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substitution::SpanOrigin;

    #[test]
    fn exactly_one_session_is_current() {
        let registry = SessionRegistry::new("default");
        let a = registry.current();
        let b = registry.current();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn activation_updates_workspace_and_keeps_session() {
        let registry = SessionRegistry::new("default");
        let before = registry.current();
        let after = registry.activate_workspace("w1");
        assert_eq!(before.id, after.id);
        assert_eq!(after.active_workspace_id, "w1");
        assert_eq!(registry.current().active_workspace_id, "w1");
    }

    #[test]
    fn store_is_stable_per_session() {
        let registry = SessionRegistry::new("default");
        let s1 = registry.current_store();
        let s2 = registry.current_store();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[test]
    fn end_session_wipes_store() {
        let registry = SessionRegistry::new("default");
        let store = registry.current_store();
        let p = store.get_or_insert("literal", SpanOrigin::Secret, "t", "");
        let id = registry.current().id;
        registry.end_session(&id);
        assert!(store.resolve(&p).is_none());
    }
}
