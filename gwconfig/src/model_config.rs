//! Static model/group/peer/tool directory, loaded from a TOML file.
//!
//! This is the "named interface" for the configuration loader that spec §1 keeps out of
//! the core data plane: `GatewayConfig` is the data the core consumes, `load` is how it
//! gets built from disk. Validation enforces the invariants spec §3 states (unique
//! modelID/alias union, `exclusive` group semantics) at load time rather than at first use.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate model id or alias: {0}")]
    DuplicateModelId(String),
    #[error("group {group} references unknown model id {model}")]
    UnknownGroupMember { group: String, model: String },
}

/// Truncation strategy for the Context Manager (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    SlidingWindow,
    StrictError,
    LowVram,
}

impl Default for TruncationMode {
    fn default() -> Self {
        TruncationMode::SlidingWindow
    }
}

/// Prompt optimization policy (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPolicy {
    Off,
    LimitOnly,
    Always,
    LlmAssisted,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        PromptPolicy::LimitOnly
    }
}

/// Parameters to strip or set on incoming requests bound for this model (spec §3).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub strip_params: Vec<String>,
    #[serde(default)]
    pub set_params: serde_json::Map<String, serde_json::Value>,
}

/// One model descriptor (spec §3 "Model descriptor").
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub cmd: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub truncation_mode: TruncationMode,
    #[serde(default)]
    pub use_model_name: Option<String>,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default)]
    pub prompt_policy: PromptPolicy,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_check_endpoint() -> String {
    "/health".to_string()
}

/// A named group of models sharing exclusivity/persistence policy (spec §3 "Group").
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub swap: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub persistent: bool,
}

/// A peer inference endpoint (spec §3 "Peer").
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub filters: Filters,
}

/// Tool execution policy (spec §3 Tool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicy {
    Auto,
    Always,
    Watchdog,
    Never,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        ToolPolicy::Auto
    }
}

/// Tool kind (spec §3 Tool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Mcp,
}

/// One entry of the tool catalog (spec §3 Tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub remote_name: Option<String>,
    #[serde(default)]
    pub policy: ToolPolicy,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Tool runtime settings (spec §3 "Tool runtime settings").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolRuntimeSettings {
    pub enabled: bool,
    pub web_search_mode: WebSearchMode,
    pub watchdog_mode: WatchdogMode,
    pub require_approval_header: bool,
    pub approval_header_name: String,
    pub block_non_local_endpoints: bool,
    pub max_tool_rounds: u8,
    pub kill_previous_on_swap: bool,
    pub max_running_models: u8,
}

impl Default for ToolRuntimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            web_search_mode: WebSearchMode::Auto,
            watchdog_mode: WatchdogMode::Auto,
            require_approval_header: false,
            approval_header_name: "X-LlamaSwap-Tool-Approval".to_string(),
            block_non_local_endpoints: true,
            max_tool_rounds: 4,
            kill_previous_on_swap: false,
            max_running_models: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSearchMode {
    Off,
    Auto,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogMode {
    Off,
    Auto,
}

/// Top-level settings that are not per-model (spec §6 listing/compat behavior).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub include_aliases_in_list: bool,
    pub strict_openai: bool,
    pub safety_margin: u32,
    pub health_check_timeout_seconds: u64,
    pub fallback_model: Option<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            include_aliases_in_list: false,
            strict_openai: false,
            safety_margin: 32,
            health_check_timeout_seconds: 30,
            fallback_model: None,
        }
    }
}

/// Full static configuration: models, groups, peers, tools, and global settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub models: Vec<ModelDescriptor>,
    pub groups: Vec<GroupConfig>,
    pub peers: Vec<PeerConfig>,
    pub tools: Vec<ToolConfig>,
    pub tool_settings: ToolRuntimeSettings,
    pub settings: GlobalSettings,
}

impl GatewayConfig {
    /// Parses and validates a config from TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let cfg: GatewayConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the invariants spec §3 states: the union of modelID and aliases is
    /// unique across descriptors, and every group member refers to a known model id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for m in &self.models {
            if !seen.insert(m.id.clone()) {
                return Err(ConfigError::DuplicateModelId(m.id.clone()));
            }
            for alias in &m.aliases {
                if !seen.insert(alias.clone()) {
                    return Err(ConfigError::DuplicateModelId(alias.clone()));
                }
            }
        }
        for g in &self.groups {
            for member in &g.members {
                if !self.models.iter().any(|m| &m.id == member) {
                    return Err(ConfigError::UnknownGroupMember {
                        group: g.name.clone(),
                        model: member.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds a lookup from model id or alias to the owning descriptor's id.
    pub fn alias_index(&self) -> HashMap<String, String> {
        let mut idx = HashMap::new();
        for m in &self.models {
            idx.insert(m.id.clone(), m.id.clone());
            for alias in &m.aliases {
                idx.insert(alias.clone(), m.id.clone());
            }
        }
        idx
    }

    /// Finds the group (if any) owning the given model id.
    pub fn group_for_model(&self, model_id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.members.iter().any(|m| m == model_id))
    }
}

/// Loads a `GatewayConfig` from a TOML file on disk.
pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    GatewayConfig::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[models]]
id = "coder"
cmd = "llama-server -m coder.gguf"
aliases = ["coder-alias"]

[[models]]
id = "chat"
cmd = "llama-server -m chat.gguf"

[[groups]]
name = "main"
members = ["coder", "chat"]
exclusive = true
"#;

    #[test]
    fn parse_sample_config() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(cfg.groups[0].members.len(), 2);
        assert!(cfg.groups[0].exclusive);
    }

    #[test]
    fn duplicate_alias_rejected() {
        let text = r#"
[[models]]
id = "a"
cmd = "x"
aliases = ["shared"]

[[models]]
id = "shared"
cmd = "y"
"#;
        let err = GatewayConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateModelId(_)));
    }

    #[test]
    fn unknown_group_member_rejected() {
        let text = r#"
[[models]]
id = "a"
cmd = "x"

[[groups]]
name = "g"
members = ["a", "missing"]
"#;
        let err = GatewayConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGroupMember { .. }));
    }

    #[test]
    fn alias_index_maps_both_id_and_alias() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        let idx = cfg.alias_index();
        assert_eq!(idx.get("coder-alias"), Some(&"coder".to_string()));
        assert_eq!(idx.get("coder"), Some(&"coder".to_string()));
    }

    #[test]
    fn load_missing_file_errors() {
        let err = load(Path::new("/nonexistent/gw-config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.models.len(), 2);
    }
}
