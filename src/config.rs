//! Configuration for A3S Code
//!
//! Loaded from TOML or JSON (chosen by file extension). Without an explicit
//! path the user config (`<config_dir>/a3s-code/config.toml`) is read first
//! and a project-local `./.a3s-code.toml` is merged over it.
//!
//! ```toml
//! default_provider = "anthropic"
//!
//! [[providers]]
//! name = "anthropic"
//! model = "claude-sonnet-4-20250514"
//! api_key_env = "ANTHROPIC_API_KEY"
//!
//! [agent]
//! max_tool_rounds = 50
//!
//! [permissions]
//! always_allow = ["read", "ls", "glob", "grep"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationConfig;
use crate::error::{CodeError, Result};
use crate::llm::{LlmConfig, SecretString};
use crate::permission::PermissionConfig;
use crate::retry::RetryConfig;
use crate::telemetry::{LogConfig, ModelPricing};

/// Project-local override file, looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = ".a3s-code.toml";

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

// ============================================================================
// Provider Configuration
// ============================================================================

/// One configured LLM provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name ("anthropic", "openai", or any OpenAI-compatible name)
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<SecretString>,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Overrides the built-in pricing table for `model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Effective API key: inline key, then `api_key_env`, then the
    /// provider's conventional variable.
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let var = self
            .api_key_env
            .clone()
            .or_else(|| default_api_key_env(&self.name).map(str::to_string))?;
        std::env::var(&var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }
}

fn default_api_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
        "openai" | "gpt" => Some("OPENAI_API_KEY"),
        _ => None,
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" | "claude" => DEFAULT_ANTHROPIC_MODEL,
        _ => DEFAULT_OPENAI_MODEL,
    }
}

// ============================================================================
// Section Configuration
// ============================================================================

/// Agent loop limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Provider round-trips allowed per run
    pub max_tool_rounds: usize,
    /// Upper bound for one provider round-trip, including streaming
    pub provider_timeout_secs: Option<u64>,
    /// Upper bound for one tool execution
    pub tool_timeout_secs: Option<u64>,
    /// Replaces the built-in system prompt
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 50,
            provider_timeout_secs: Some(300),
            tool_timeout_secs: Some(900),
            system_prompt: None,
        }
    }
}

/// Session storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (no persistence)
    Memory,
    /// One directory per session under `sessions_dir`
    #[default]
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sessions_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured directory, or `<data_dir>/a3s-code/sessions`
    pub fn resolved_sessions_dir(&self) -> PathBuf {
        if let Some(dir) = &self.sessions_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("a3s-code").join("sessions"))
            .unwrap_or_else(|| PathBuf::from(".a3s-code").join("sessions"))
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Configuration for A3S Code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConfig {
    /// Provider used when none is named on the command line
    pub default_provider: Option<String>,
    pub providers: Vec<ProviderConfig>,
    pub agent: AgentSettings,
    pub continuation: ContinuationConfig,
    pub permissions: PermissionConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl CodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one file, TOML unless the extension is `.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CodeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(content).map_err(|e| {
                CodeError::Config(format!("failed to parse {}: {}", path.display(), e))
            })
        } else {
            toml::from_str(content).map_err(|e| {
                CodeError::Config(format!("failed to parse {}: {}", path.display(), e))
            })
        }
    }

    /// Default user config location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("a3s-code").join("config.toml"))
    }

    /// Load `explicit` if given; otherwise merge the user config and the
    /// project file in `cwd`, falling back to defaults when neither exists.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let candidates = [Self::default_path(), Some(cwd.join(PROJECT_CONFIG_FILE))];
        let mut merged: Option<toml::Value> = None;
        for path in candidates.into_iter().flatten() {
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                CodeError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let layer: toml::Value = toml::from_str(&content).map_err(|e| {
                CodeError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?;
            tracing::debug!("Loaded config layer {}", path.display());
            merged = Some(match merged {
                Some(mut base) => {
                    merge_toml(&mut base, layer);
                    base
                }
                None => layer,
            });
        }

        match merged {
            Some(value) => value
                .try_into()
                .map_err(|e| CodeError::Config(format!("invalid configuration: {}", e))),
            None => Ok(Self::default()),
        }
    }

    /// Find a provider by name
    pub fn find_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Provider chosen by `name`, then `default_provider`, then the first
    /// configured one. An unconfigured well-known name gets a bare entry so
    /// that an API key in the environment is enough to get started.
    pub fn select_provider(&self, name: Option<&str>) -> Result<ProviderConfig> {
        let wanted = name.or(self.default_provider.as_deref());
        if let Some(wanted) = wanted {
            if let Some(provider) = self.find_provider(wanted) {
                return Ok(provider.clone());
            }
            if default_api_key_env(wanted).is_some() {
                return Ok(ProviderConfig::new(wanted, default_model(wanted)));
            }
            return Err(CodeError::Config(format!("unknown provider '{}'", wanted)));
        }
        if let Some(first) = self.providers.first() {
            return Ok(first.clone());
        }
        Ok(ProviderConfig::new("anthropic", DEFAULT_ANTHROPIC_MODEL))
    }

    /// Build the client configuration for a provider, optionally overriding
    /// its model.
    pub fn to_llm_config(&self, provider: &ProviderConfig, model: Option<&str>) -> Result<LlmConfig> {
        let model = model
            .map(str::to_string)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if provider.model.is_empty() {
                    default_model(&provider.name).to_string()
                } else {
                    provider.model.clone()
                }
            });

        let api_key = match provider.resolve_api_key() {
            Some(key) => key,
            // Local OpenAI-compatible servers usually need no key
            None if provider.base_url.is_some() => SecretString::default(),
            None => {
                let hint = provider
                    .api_key_env
                    .as_deref()
                    .or(default_api_key_env(&provider.name))
                    .unwrap_or("api_key");
                return Err(CodeError::Config(format!(
                    "no API key for provider '{}' (set {})",
                    provider.name, hint
                )));
            }
        };

        let mut config = LlmConfig {
            provider: provider.name.clone(),
            model,
            api_key,
            ..Default::default()
        }
        .with_retry_config(self.retry.clone());
        if let Some(url) = &provider.base_url {
            config = config.with_base_url(url);
        }
        if let Some(max_tokens) = provider.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        Ok(config)
    }
}

/// Recursively merge `overlay` into `base`; tables merge, everything else
/// is replaced.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::TimeoutAction;

    #[test]
    fn test_config_default() {
        let config = CodeConfig::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.agent.max_tool_rounds, 50);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.continuation.enabled);
        assert_eq!(config.continuation.max_continuations, 10);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_toml() {
        let config = CodeConfig::parse(
            r#"
            default_provider = "local"

            [[providers]]
            name = "local"
            model = "qwen2.5-coder"
            base_url = "http://localhost:11434/v1"
            pricing = { input_per_million = 0.0, output_per_million = 0.0 }

            [agent]
            max_tool_rounds = 12
            tool_timeout_secs = 30

            [permissions]
            always_allow = ["read", "grep"]
            approval_timeout_secs = 60
            timeout_action = "approve"

            [storage]
            backend = "memory"
            "#,
            Path::new("config.toml"),
        )
        .unwrap();

        assert_eq!(config.default_provider.as_deref(), Some("local"));
        assert_eq!(config.providers[0].model, "qwen2.5-coder");
        assert_eq!(config.agent.max_tool_rounds, 12);
        assert_eq!(config.agent.tool_timeout_secs, Some(30));
        assert_eq!(config.agent.provider_timeout_secs, Some(300));
        assert_eq!(config.permissions.always_allow, vec!["read", "grep"]);
        assert_eq!(config.permissions.timeout_action, TimeoutAction::Approve);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_parse_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"providers": [{"name": "openai", "model": "gpt-4o", "api_key": "sk-x"}],
                "continuation": {"enabled": false}}"#,
        )
        .unwrap();

        let config = CodeConfig::from_file(&path).unwrap();
        assert!(!config.continuation.enabled);
        assert_eq!(config.continuation.max_continuations, 10);
        assert_eq!(
            config.providers[0].resolve_api_key().unwrap().expose(),
            "sk-x"
        );
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "agent = [").unwrap();
        assert!(matches!(CodeConfig::from_file(&path), Err(CodeError::Config(_))));
        assert!(matches!(
            CodeConfig::from_file(&dir.path().join("missing.toml")),
            Err(CodeError::Config(_))
        ));
    }

    #[test]
    fn test_project_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "[agent]\nmax_tool_rounds = 7\n",
        )
        .unwrap();

        let config = CodeConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.agent.max_tool_rounds, 7);
        assert_eq!(config.agent.provider_timeout_secs, Some(300));
    }

    #[test]
    fn test_merge_toml_tables() {
        let mut base: toml::Value =
            toml::from_str("[agent]\nmax_tool_rounds = 5\nsystem_prompt = \"a\"\n").unwrap();
        let overlay: toml::Value = toml::from_str("[agent]\nmax_tool_rounds = 9\n").unwrap();
        merge_toml(&mut base, overlay);
        assert_eq!(base["agent"]["max_tool_rounds"].as_integer(), Some(9));
        assert_eq!(base["agent"]["system_prompt"].as_str(), Some("a"));
    }

    #[test]
    fn test_select_provider() {
        let mut config = CodeConfig::default();
        assert_eq!(config.select_provider(None).unwrap().name, "anthropic");
        assert_eq!(config.select_provider(Some("openai")).unwrap().model, "gpt-4o");
        assert!(matches!(
            config.select_provider(Some("nope")),
            Err(CodeError::Config(_))
        ));

        config.providers.push(ProviderConfig::new("local", "llama"));
        assert_eq!(config.select_provider(None).unwrap().name, "local");
    }

    #[test]
    fn test_to_llm_config() {
        let config = CodeConfig::default();
        let mut provider = ProviderConfig::new("local", "llama");
        provider.base_url = Some("http://localhost:8080/v1".to_string());
        provider.max_tokens = Some(1024);

        let llm = config.to_llm_config(&provider, Some("other")).unwrap();
        assert_eq!(llm.model, "other");
        assert!(llm.api_key.is_empty());
        assert_eq!(llm.max_tokens, Some(1024));
        assert_eq!(llm.retry_config, Some(RetryConfig::default()));

        let mut keyed = ProviderConfig::new("anthropic", "");
        keyed.api_key = Some(SecretString::new("sk-ant"));
        let llm = config.to_llm_config(&keyed, None).unwrap();
        assert_eq!(llm.model, DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(llm.api_key.expose(), "sk-ant");
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let mut provider = ProviderConfig::new("custom", "m");
        provider.api_key_env = Some("A3S_CODE_TEST_KEY_THAT_IS_NOT_SET".to_string());
        let err = CodeConfig::default().to_llm_config(&provider, None).unwrap_err();
        assert!(err.to_string().contains("A3S_CODE_TEST_KEY_THAT_IS_NOT_SET"));
    }
}
