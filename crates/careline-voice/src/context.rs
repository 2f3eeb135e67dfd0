//! Per-user command context: role, identity, and turn-to-turn session memory.
//!
//! The orchestrator owns the only mutable copy. Resolvers and interpreters receive
//! an `Arc<CommandContext>` snapshot taken at the start of a turn.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Session memory key for the intent of the last live turn.
pub const LAST_INTENT_KEY: &str = "last_intent";
/// Session memory key for the text of the last live turn.
pub const LAST_UTTERANCE_KEY: &str = "last_utterance";

/// Portal role of the signed-in user. Shortcuts are scoped by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Provider,
    /// Employer / practice owner.
    Owner,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Patient, Role::Provider, Role::Owner, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Provider => "provider",
            Role::Owner => "owner",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small key/value memory carried between turns. Every mutation bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMemory {
    version: u64,
    entries: BTreeMap<String, String>,
}

impl SessionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert or replace `key`; returns the new version.
    pub fn remember(&mut self, key: impl Into<String>, value: impl Into<String>) -> u64 {
        self.entries.insert(key.into(), value.into());
        self.version += 1;
        self.version
    }

    /// Remove `key`. The version only moves if something was removed.
    pub fn forget(&mut self, key: &str) -> u64 {
        if self.entries.remove(key).is_some() {
            self.version += 1;
        }
        self.version
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Everything a resolver may know about the speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContext {
    pub role: Role,
    /// Opaque portal user id.
    pub user_id: String,
    pub session_memory: SessionMemory,
}

impl CommandContext {
    pub fn new(role: Role, user_id: impl Into<String>) -> Self {
        Self {
            role,
            user_id: user_id.into(),
            session_memory: SessionMemory::new(),
        }
    }

    /// Last intent handled in this session, if any.
    pub fn last_intent(&self) -> Option<&str> {
        self.session_memory.get(LAST_INTENT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_versions_every_mutation() {
        let mut mem = SessionMemory::new();
        assert_eq!(mem.version(), 0);
        assert_eq!(mem.remember("topic", "labs"), 1);
        assert_eq!(mem.remember("topic", "billing"), 2);
        assert_eq!(mem.get("topic"), Some("billing"));
        assert_eq!(mem.forget("missing"), 2);
        assert_eq!(mem.forget("topic"), 3);
        assert!(mem.is_empty());
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::Provider).unwrap();
        assert_eq!(json, "\"provider\"");
        assert_eq!(Role::Owner.to_string(), "owner");
    }
}
