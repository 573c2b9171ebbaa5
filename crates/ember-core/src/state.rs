use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ephemeral per-cycle context snapshot assembled from providers.
///
/// `values` is flattened key → text for prompt injection; `data` holds
/// structured results (per-provider data, prior action results).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub values: BTreeMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Provider texts joined in registration order.
    pub text: String,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Render the state as a prompt context block: the provider text followed
    /// by any values not already contained in it.
    pub fn render(&self) -> String {
        let mut out = self.text.clone();
        for (key, value) in &self.values {
            if key == "providers" || value.is_empty() || self.text.contains(value.as_str()) {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("{key}: {value}"));
        }
        out
    }
}
