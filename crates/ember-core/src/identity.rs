//! Deterministic identity mapping.
//!
//! Every identifier the runtime stores is derived from the owning agent's id
//! and a platform-native id, so two agents never collide on the "same"
//! external object and any component can recompute an id without a shared
//! lookup table.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for all Ember-derived identifiers (UUIDv5).
pub const EMBER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a3e_9b47_4d0a_8e51_c3f2_7a90_d41b);

/// What kind of object an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Entity,
    Room,
    World,
    Message,
}

impl IdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Entity => "entity",
            IdKind::Room => "room",
            IdKind::World => "world",
            IdKind::Message => "message",
        }
    }
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the agent-local identifier for a platform-native id.
///
/// Total over its domain: the platform id is hashed as-is, including empty or
/// malformed strings.
pub fn resolve(agent_id: Uuid, platform_id: &str, kind: IdKind) -> Uuid {
    let name = format!("{}:{}:{}", kind.as_str(), agent_id, platform_id);
    Uuid::new_v5(&EMBER_NAMESPACE, name.as_bytes())
}

/// [`resolve`] bound to a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMapper {
    agent_id: Uuid,
}

impl IdentityMapper {
    pub fn new(agent_id: Uuid) -> Self {
        Self { agent_id }
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn entity(&self, platform_user_id: &str) -> Uuid {
        resolve(self.agent_id, platform_user_id, IdKind::Entity)
    }

    pub fn room(&self, platform_channel_id: &str) -> Uuid {
        resolve(self.agent_id, platform_channel_id, IdKind::Room)
    }

    pub fn world(&self, platform_server_id: &str) -> Uuid {
        resolve(self.agent_id, platform_server_id, IdKind::World)
    }

    pub fn message(&self, platform_message_id: &str) -> Uuid {
        resolve(self.agent_id, platform_message_id, IdKind::Message)
    }
}

/// Derive a stable agent id from a character name, for agents configured without one.
pub fn agent_id_from_name(name: &str) -> Uuid {
    Uuid::new_v5(&EMBER_NAMESPACE, format!("agent:{name}").as_bytes())
}
