use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settings::WorldSettings;

/// Key under `World::metadata` holding the onboarding settings map.
pub const SETTINGS_METADATA_KEY: &str = "settings";

/// A participant (user, agent, bot) as seen by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Display names this participant has been seen under, oldest first.
    #[serde(default)]
    pub names: Vec<String>,
    /// Per-source component metadata (e.g. `{"discord": {"username": ...}}`).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(id: Uuid, agent_id: Uuid, name: Option<&str>) -> Self {
        Self {
            id,
            agent_id,
            names: name.map(|n| vec![n.to_string()]).unwrap_or_default(),
            metadata: Default::default(),
        }
    }

    /// Merge another observation of the same participant into this one.
    /// Returns true if anything changed.
    pub fn merge(&mut self, other: &Entity) -> bool {
        let mut changed = false;
        for name in &other.names {
            if !self.names.iter().any(|n| n == name) {
                self.names.push(name.clone());
                changed = true;
            }
        }
        for (key, value) in &other.metadata {
            if self.metadata.get(key) != Some(value) {
                self.metadata.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// The most recently observed display name.
    pub fn display_name(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }
}

/// Kind of conversation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Direct,
    Group,
    Feed,
    SelfChannel,
    Thread,
    Voice,
    Api,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Direct => "direct",
            ChannelType::Group => "group",
            ChannelType::Feed => "feed",
            ChannelType::SelfChannel => "self_channel",
            ChannelType::Thread => "thread",
            ChannelType::Voice => "voice",
            ChannelType::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => ChannelType::Group,
            "feed" => ChannelType::Feed,
            "self_channel" | "self" => ChannelType::SelfChannel,
            "thread" => ChannelType::Thread,
            "voice" => ChannelType::Voice,
            "api" => ChannelType::Api,
            _ => ChannelType::Direct,
        }
    }
}

/// A conversation channel as seen by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: Option<String>,
    /// Platform the room lives on ("discord", "cli", ...).
    pub source: String,
    pub channel_type: ChannelType,
    /// Platform-native channel id.
    pub channel_id: String,
    pub world_id: Option<Uuid>,
}

/// A server / guild / workspace as seen by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: Option<String>,
    /// Platform-native server id.
    pub server_id: String,
    pub owner_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl World {
    /// Decode the onboarding settings stored under `metadata.settings`.
    pub fn settings(&self) -> Option<WorldSettings> {
        self.metadata
            .get(SETTINGS_METADATA_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Replace the onboarding settings sub-map.
    pub fn set_settings(&mut self, settings: &WorldSettings) -> crate::Result<()> {
        let value = serde_json::to_value(settings)?;
        self.metadata.insert(SETTINGS_METADATA_KEY.to_string(), value);
        Ok(())
    }
}
