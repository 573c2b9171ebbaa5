use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use ember_core::{EmberError, Result};

/// Plugin manifest, loaded from `plugin.toml` or built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugins that must be loaded before this one: `"name"` or `"name@<semver req>"`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Service types that must already be registered.
    #[serde(default)]
    pub required_services: Vec<String>,
    pub plugin: PluginMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

/// A parsed hard dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDependency {
    pub name: String,
    pub version: Option<VersionReq>,
}

impl PluginDependency {
    /// Whether a loaded plugin version satisfies this dependency.
    pub fn accepts(&self, version: &Version) -> bool {
        self.version.as_ref().is_none_or(|req| req.matches(version))
    }
}

impl PluginManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            dependencies: vec![],
            required_services: vec![],
            plugin: PluginMeta {
                name: name.into(),
                version: version.into(),
                description: String::new(),
                authors: vec![],
                license: None,
                homepage: None,
            },
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.plugin.description = description.into();
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn requires_service(mut self, service_type: impl Into<String>) -> Self {
        self.required_services.push(service_type.into());
        self
    }

    /// Parse from TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(s).map_err(|e| EmberError::Plugin {
            plugin: "unknown".into(),
            reason: format!("failed to parse plugin.toml: {}", e),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load `plugin.toml` from disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    /// Get the semver version.
    pub fn semver(&self) -> Result<Version> {
        Version::parse(&self.plugin.version).map_err(|e| EmberError::Plugin {
            plugin: self.plugin.name.clone(),
            reason: format!("invalid version '{}': {}", self.plugin.version, e),
        })
    }

    /// Parse the `dependencies` list.
    pub fn parsed_dependencies(&self) -> Result<Vec<PluginDependency>> {
        self.dependencies
            .iter()
            .map(|dep| {
                let (name, req) = match dep.split_once('@') {
                    Some((name, req)) => (name.trim(), Some(req.trim())),
                    None => (dep.trim(), None),
                };
                let version = req
                    .map(VersionReq::parse)
                    .transpose()
                    .map_err(|e| EmberError::Plugin {
                        plugin: self.plugin.name.clone(),
                        reason: format!("invalid dependency '{dep}': {e}"),
                    })?;
                Ok(PluginDependency {
                    name: name.to_string(),
                    version,
                })
            })
            .collect()
    }

    /// Structural checks: non-empty name, semver version, parseable dependencies.
    pub fn validate(&self) -> Result<()> {
        if self.plugin.name.trim().is_empty() {
            return Err(EmberError::Plugin {
                plugin: "unknown".into(),
                reason: "plugin name is empty".into(),
            });
        }
        self.semver()?;
        let deps = self.parsed_dependencies()?;
        if deps.iter().any(|d| d.name == self.plugin.name) {
            return Err(EmberError::Plugin {
                plugin: self.plugin.name.clone(),
                reason: "plugin depends on itself".into(),
            });
        }
        Ok(())
    }
}
