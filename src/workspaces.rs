use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::mux::MuxRule;

/// Name of the built-in workspace. Always present, always activatable,
/// never archived or deleted.
pub const DEFAULT_WORKSPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Active,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub state: WorkspaceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    pub mux_rules: Vec<MuxRule>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    fn new(name: &str) -> Self {
        Workspace {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            state: WorkspaceState::Active,
            custom_instructions: None,
            mux_rules: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WorkspaceError {
    #[error("workspace not found: {0}")]
    NotFound(String),
    #[error("workspace already exists: {0}")]
    AlreadyExists(String),
    #[error("the default workspace cannot be modified")]
    DefaultImmutable,
    #[error("workspace is not archived: {0}")]
    NotArchived(String),
    #[error("invalid workspace name: {0}")]
    InvalidName(String),
}

type Snapshot = Arc<HashMap<String, Workspace>>;

/// Workspace registry with copy-on-write snapshots.
///
/// Reads clone an `Arc` and never block behind a mutation; mutations clone
/// the map, modify, and swap the pointer. Rule edits come through the
/// management API and are rare, so the clone cost is irrelevant.
pub struct WorkspaceRegistry {
    snapshot: RwLock<Snapshot>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(DEFAULT_WORKSPACE.to_string(), Workspace::new(DEFAULT_WORKSPACE));
        WorkspaceRegistry {
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    /// Rebuild from persisted rows. The default workspace is re-created if
    /// the persisted set lost it.
    pub fn from_rows(rows: Vec<Workspace>) -> Self {
        let registry = WorkspaceRegistry::new();
        {
            let mut map = HashMap::clone(&registry.read());
            for ws in rows {
                map.insert(ws.name.clone(), ws);
            }
            map.entry(DEFAULT_WORKSPACE.to_string())
                .or_insert_with(|| Workspace::new(DEFAULT_WORKSPACE));
            *registry.snapshot.write().unwrap() = Arc::new(map);
        }
        registry
    }

    /// Current snapshot. Holds no lock beyond the pointer read.
    pub fn read(&self) -> Snapshot {
        self.snapshot.read().unwrap().clone()
    }

    pub fn get(&self, name: &str) -> Option<Workspace> {
        self.read().get(name).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Workspace> {
        self.read().values().find(|w| w.id == id).cloned()
    }

    pub fn list(&self, state: WorkspaceState) -> Vec<Workspace> {
        let mut out: Vec<Workspace> = self
            .read()
            .values()
            .filter(|w| w.state == state)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn create(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkspaceError::InvalidName("empty name".into()));
        }
        let mut guard = self.snapshot.write().unwrap();
        if guard.contains_key(name) {
            return Err(WorkspaceError::AlreadyExists(name.to_string()));
        }
        let ws = Workspace::new(name);
        let mut map = HashMap::clone(&guard);
        map.insert(name.to_string(), ws.clone());
        *guard = Arc::new(map);
        Ok(ws)
    }

    /// Soft delete. Archived workspaces stay recoverable until hard-deleted.
    pub fn archive(&self, name: &str) -> Result<(), WorkspaceError> {
        if name == DEFAULT_WORKSPACE {
            return Err(WorkspaceError::DefaultImmutable);
        }
        self.update(name, |ws| {
            ws.state = WorkspaceState::Archived;
            Ok(())
        })
    }

    pub fn recover(&self, name: &str) -> Result<(), WorkspaceError> {
        self.update(name, |ws| {
            if ws.state != WorkspaceState::Archived {
                return Err(WorkspaceError::NotArchived(ws.name.clone()));
            }
            ws.state = WorkspaceState::Active;
            Ok(())
        })
    }

    /// Hard delete. Only archived workspaces can go; the default never.
    pub fn hard_delete(&self, name: &str) -> Result<(), WorkspaceError> {
        if name == DEFAULT_WORKSPACE {
            return Err(WorkspaceError::DefaultImmutable);
        }
        let mut guard = self.snapshot.write().unwrap();
        let ws = guard
            .get(name)
            .ok_or_else(|| WorkspaceError::NotFound(name.to_string()))?;
        if ws.state != WorkspaceState::Archived {
            return Err(WorkspaceError::NotArchived(name.to_string()));
        }
        let mut map = HashMap::clone(&guard);
        map.remove(name);
        *guard = Arc::new(map);
        Ok(())
    }

    pub fn set_custom_instructions(
        &self,
        name: &str,
        instructions: Option<String>,
    ) -> Result<(), WorkspaceError> {
        self.update(name, |ws| {
            ws.custom_instructions = instructions.clone();
            Ok(())
        })
    }

    /// Replace the rule list wholesale. Order is the caller's order; the
    /// router never renumbers.
    pub fn set_mux_rules(&self, name: &str, rules: Vec<MuxRule>) -> Result<(), WorkspaceError> {
        self.update(name, |ws| {
            ws.mux_rules = rules.clone();
            Ok(())
        })
    }

    fn update<F>(&self, name: &str, mut f: F) -> Result<(), WorkspaceError>
    where
        F: FnMut(&mut Workspace) -> Result<(), WorkspaceError>,
    {
        let mut guard = self.snapshot.write().unwrap();
        if !guard.contains_key(name) {
            return Err(WorkspaceError::NotFound(name.to_string()));
        }
        let mut map = HashMap::clone(&guard);
        f(map.get_mut(name).expect("checked above"))?;
        *guard = Arc::new(map);
        Ok(())
    }
}

impl Default for WorkspaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxMatcherType, MuxRule};

    #[test]
    fn default_workspace_always_present() {
        let registry = WorkspaceRegistry::new();
        assert!(registry.get(DEFAULT_WORKSPACE).is_some());
    }

    #[test]
    fn default_workspace_immutable() {
        let registry = WorkspaceRegistry::new();
        assert_eq!(
            registry.archive(DEFAULT_WORKSPACE),
            Err(WorkspaceError::DefaultImmutable)
        );
        assert_eq!(
            registry.hard_delete(DEFAULT_WORKSPACE),
            Err(WorkspaceError::DefaultImmutable)
        );
        assert!(registry.get(DEFAULT_WORKSPACE).is_some());
    }

    #[test]
    fn archive_recover_delete_lifecycle() {
        let registry = WorkspaceRegistry::new();
        registry.create("w1").unwrap();

        // Active workspaces cannot be hard-deleted.
        assert_eq!(
            registry.hard_delete("w1"),
            Err(WorkspaceError::NotArchived("w1".into()))
        );

        registry.archive("w1").unwrap();
        assert_eq!(registry.list(WorkspaceState::Archived).len(), 1);

        registry.recover("w1").unwrap();
        assert_eq!(registry.get("w1").unwrap().state, WorkspaceState::Active);

        registry.archive("w1").unwrap();
        registry.hard_delete("w1").unwrap();
        assert!(registry.get("w1").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let registry = WorkspaceRegistry::new();
        registry.create("w1").unwrap();
        assert_eq!(
            registry.create("w1"),
            Err(WorkspaceError::AlreadyExists("w1".into()))
        );
    }

    #[test]
    fn rule_order_is_stable() {
        let registry = WorkspaceRegistry::new();
        registry.create("w1").unwrap();
        let rules = vec![
            MuxRule::new("ep1", "model-a", MuxMatcherType::RequestTypeMatch, "fim"),
            MuxRule::new("ep1", "model-b", MuxMatcherType::CatchAll, ""),
        ];
        registry.set_mux_rules("w1", rules.clone()).unwrap();
        let stored = registry.get("w1").unwrap().mux_rules;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].model_name, "model-a");
        assert_eq!(stored[1].model_name, "model-b");
    }

    #[test]
    fn snapshot_isolated_from_mutation() {
        let registry = WorkspaceRegistry::new();
        let before = registry.read();
        registry.create("w1").unwrap();
        assert!(before.get("w1").is_none());
        assert!(registry.read().get("w1").is_some());
    }
}
