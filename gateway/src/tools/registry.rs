//! On-disk tool catalog (spec §5 "the tool catalog on disk is written as a whole file
//! (`tools.json`)", §6 persisted state, §9 "legacy flat-array form is accepted on read
//! but never written").

use std::path::PathBuf;

use gwconfig::{ToolConfig, ToolRuntimeSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ToolCatalogError {
    #[error("read tool catalog {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("write tool catalog {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("parse tool catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),
    #[error("tool not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCatalog {
    settings: ToolRuntimeSettings,
    tools: Vec<ToolConfig>,
}

/// In-memory tool catalog, the "in-memory slice" spec §5 describes readers snapshotting
/// under the lock and writers mutating before persisting.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    pub settings: ToolRuntimeSettings,
    pub tools: Vec<ToolConfig>,
    path: PathBuf,
}

impl ToolCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { settings: ToolRuntimeSettings::default(), tools: Vec::new(), path: path.into() }
    }

    /// Loads `tools.json`, accepting either the current `{settings, tools}` shape or the
    /// legacy flat `[tool, ...]` array (spec §9).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ToolCatalogError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ToolCatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let value: serde_json::Value = serde_json::from_str(&text)?;
        let (settings, tools) = if value.is_array() {
            let tools: Vec<ToolConfig> = serde_json::from_value(value)?;
            (ToolRuntimeSettings::default(), tools)
        } else {
            let persisted: PersistedCatalog = serde_json::from_value(value)?;
            (persisted.settings, persisted.tools)
        };

        let catalog = Self { settings, tools, path };
        catalog.validate_unique_names()?;
        Ok(catalog)
    }

    fn validate_unique_names(&self) -> Result<(), ToolCatalogError> {
        let mut seen = std::collections::HashSet::new();
        for t in &self.tools {
            if !seen.insert(t.name.clone()) {
                return Err(ToolCatalogError::DuplicateName(t.name.clone()));
            }
        }
        Ok(())
    }

    /// Persists the current in-memory slice as a whole file, always in the current
    /// `{settings, tools}` shape (never the legacy flat array, per spec §9).
    pub fn save(&self) -> Result<(), ToolCatalogError> {
        let persisted = PersistedCatalog { settings: self.settings.clone(), tools: self.tools.clone() };
        let text = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, text).map_err(|source| ToolCatalogError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn find(&self, id: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.id == id)
    }

    pub fn upsert(&mut self, tool: ToolConfig) -> Result<(), ToolCatalogError> {
        if self.tools.iter().any(|t| t.name == tool.name && t.id != tool.id) {
            return Err(ToolCatalogError::DuplicateName(tool.name));
        }
        if let Some(existing) = self.tools.iter_mut().find(|t| t.id == tool.id) {
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
        self.save()
    }

    pub fn remove(&mut self, id: &str) -> Result<(), ToolCatalogError> {
        let before = self.tools.len();
        self.tools.retain(|t| t.id != id);
        if self.tools.len() == before {
            return Err(ToolCatalogError::NotFound(id.to_string()));
        }
        self.save()
    }
}
