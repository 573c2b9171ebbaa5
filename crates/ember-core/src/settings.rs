//! World onboarding settings: the only externally durable configuration
//! surface the runtime reads and writes. Stored under `World::metadata.settings`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EmberError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Keys that must be set before this one becomes relevant.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current value; `null` when unset.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default = "default_true")]
    pub public: bool,
}

fn default_true() -> bool {
    true
}

impl Setting {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
            depends_on: vec![],
            value: None,
            secret: false,
            public: true,
        }
    }

    pub fn depends_on(mut self, key: &str) -> Self {
        self.depends_on.push(key.to_string());
        self
    }

    pub fn is_set(&self) -> bool {
        self.value.as_ref().is_some_and(|v| !v.is_null())
    }
}

/// Settings keyed by setting key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldSettings(pub BTreeMap<String, Setting>);

impl WorldSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, setting: Setting) {
        self.0.insert(key.into(), setting);
    }

    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.0.get(key)
    }

    /// Current value of a setting, if set.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key).and_then(|s| s.value.as_ref()).filter(|v| !v.is_null())
    }

    fn dependencies_met(&self, setting: &Setting) -> bool {
        setting
            .depends_on
            .iter()
            .all(|dep| self.0.get(dep).is_some_and(Setting::is_set))
    }

    /// Update a setting's value. Unknown keys and unmet dependencies are rejected.
    pub fn update(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        let setting = self
            .0
            .get(key)
            .ok_or_else(|| EmberError::UnknownSetting(key.to_string()))?;
        if let Some(dep) = setting
            .depends_on
            .iter()
            .find(|dep| !self.0.get(dep.as_str()).is_some_and(Setting::is_set))
        {
            return Err(EmberError::SettingDependency {
                setting: key.to_string(),
                dependency: dep.clone(),
            });
        }
        if let Some(setting) = self.0.get_mut(key) {
            setting.value = if value.is_null() { None } else { Some(value) };
        }
        Ok(())
    }

    /// Required settings that are still unset, regardless of dependencies.
    pub fn missing_required(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, s)| s.required && !s.is_set())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Unset settings whose dependencies are satisfied: what onboarding should ask next.
    pub fn pending(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, s)| !s.is_set() && self.dependencies_met(s))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Every required setting has a value.
    pub fn is_complete(&self) -> bool {
        self.missing_required().is_empty()
    }

    /// Copy with secret values blanked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for setting in copy.0.values_mut() {
            if setting.secret && setting.is_set() {
                setting.value = Some(serde_json::Value::String("****".into()));
            }
        }
        copy
    }
}
