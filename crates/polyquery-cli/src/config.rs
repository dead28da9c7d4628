//! Connection config file
//!
//! ```yaml
//! connections:
//!   - id: app
//!     type: postgres
//!     url: postgres://localhost/app
//!   - id: cache
//!     type: redis
//!     url: redis://localhost:6379/0
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub id: String,
    pub url: String,
    /// Backend name the adapter is registered under
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON, anything else is read as YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl ConnectionsFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::parse(&contents, ConfigFormat::from_path(path))
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> anyhow::Result<Self> {
        let file: ConnectionsFile = match format {
            ConfigFormat::Json => serde_json::from_str(contents)?,
            ConfigFormat::Yaml if contents.trim().is_empty() => ConnectionsFile::default(),
            ConfigFormat::Yaml => serde_yaml::from_str(contents)?,
        };

        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();

        for conn in &self.connections {
            if conn.id.trim().is_empty() {
                bail!("connection id must not be empty");
            }
            if conn.kind.trim().is_empty() {
                bail!("connection '{}' has no type", conn.id);
            }
            if !seen.insert(conn.id.as_str()) {
                bail!("duplicate connection id '{}'", conn.id);
            }
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.id == id)
    }
}
