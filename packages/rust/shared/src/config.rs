//! Application configuration for CELIA.
//!
//! User config lives at `~/.celia/celia.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CeliaError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "celia.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".celia";

// ---------------------------------------------------------------------------
// Config structs (matching celia.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Validation and repair policy.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Generation service settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Output log / corpus database.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Validation failures block persistence (`validation_failed = true`).
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Repair attempts allowed for an invalid structured artifact.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Missing coherence values above this count are an error.
    #[serde(default = "default_coherence_error_threshold")]
    pub coherence_error_threshold: usize,

    /// Minimum trimmed narrative length, in characters.
    #[serde(default = "default_min_narrative_chars")]
    pub min_narrative_chars: usize,

    /// Normalized structured values shorter than this are not checked.
    #[serde(default = "default_min_value_chars")]
    pub min_value_chars: usize,

    /// Placeholder the generator uses for "intentionally left blank".
    #[serde(default = "default_omitted_sentinel")]
    pub omitted_sentinel: String,

    /// Ask the generator to refine the base section instruction.
    #[serde(default = "default_true")]
    pub refine_instruction: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict: true,
            max_retries: default_max_retries(),
            coherence_error_threshold: default_coherence_error_threshold(),
            min_narrative_chars: default_min_narrative_chars(),
            min_value_chars: default_min_value_chars(),
            omitted_sentinel: default_omitted_sentinel(),
            refine_instruction: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    2
}
fn default_coherence_error_threshold() -> usize {
    5
}
fn default_min_narrative_chars() -> usize {
    50
}
fn default_min_value_chars() -> usize {
    3
}
fn default_omitted_sentinel() -> String {
    "faltantes".into()
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature for the structured (JSON_A) generation.
    #[serde(default = "default_structured_temperature")]
    pub structured_temperature: f32,

    /// Temperature for the narrative (JSON_B) generation.
    #[serde(default = "default_narrative_temperature")]
    pub narrative_temperature: f32,

    /// Temperature for instruction refinement.
    #[serde(default = "default_refine_temperature")]
    pub refine_temperature: f32,

    /// Temperature for repair calls.
    #[serde(default = "default_repair_temperature")]
    pub repair_temperature: f32,

    /// Upper bound on completion tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            structured_temperature: default_structured_temperature(),
            narrative_temperature: default_narrative_temperature(),
            refine_temperature: default_refine_temperature(),
            repair_temperature: default_repair_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    /// Parse `base_url`, rejecting anything that is not http(s).
    pub fn endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            CeliaError::config(format!("invalid generation.base_url '{}': {e}", self.base_url))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(CeliaError::config(format!(
                "generation.base_url must be http(s), got '{other}'"
            ))),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o".into()
}
fn default_structured_temperature() -> f32 {
    0.2
}
fn default_narrative_temperature() -> f32 {
    0.4
}
fn default_refine_temperature() -> f32 {
    0.3
}
fn default_repair_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_timeout_secs() -> u64 {
    60
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum snippets requested per query.
    #[serde(default = "default_retrieval_limit")]
    pub limit: usize,

    /// Character budget for the context block placed in prompts.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: default_retrieval_limit(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_retrieval_limit() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    4000
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Defaults to `~/.celia/celia.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join("celia.db")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.celia/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| CeliaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.celia/celia.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CeliaError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CeliaError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CeliaError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CeliaError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CeliaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the generation API key env var is set and non-empty, returning it.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.generation.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CeliaError::config(format!(
            "generation API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_retries"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert!(parsed.pipeline.strict);
        assert_eq!(parsed.pipeline.coherence_error_threshold, 5);
        assert_eq!(parsed.generation.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let toml_str = r#"
[pipeline]
strict = false
max_retries = 0

[storage]
db_path = "/tmp/celia-test.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(!config.pipeline.strict);
        assert_eq!(config.pipeline.max_retries, 0);
        assert_eq!(config.pipeline.omitted_sentinel, "faltantes");
        assert_eq!(config.retrieval.max_context_chars, 4000);
        assert_eq!(
            config.storage.resolved_db_path().unwrap(),
            PathBuf::from("/tmp/celia-test.db")
        );
    }

    #[test]
    fn endpoint_rejects_non_http() {
        let mut generation = GenerationConfig::default();
        assert!(generation.endpoint().is_ok());

        generation.base_url = "ftp://example.com".into();
        assert!(generation.endpoint().is_err());

        generation.base_url = "not a url".into();
        assert!(generation.endpoint().is_err());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.generation.api_key_env = "CELIA_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
