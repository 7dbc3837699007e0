//! Application configuration for the brief engine.
//!
//! User config lives at `~/.briefengine/briefengine.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored here; each provider section names the
//! environment variable that holds its credential.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BriefError, Result};
use crate::types::Destination;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "briefengine.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".briefengine";

/// Default run database file name, inside the config directory.
const RUNS_DB_NAME: &str = "runs.db";

// ---------------------------------------------------------------------------
// Config structs (matching briefengine.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine paths and limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Search provider settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Model provider settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Delivery provider settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Retry policy for model and delivery calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Named destinations modules may reference by alias.
    #[serde(default)]
    pub destinations: BTreeMap<String, Destination>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one `<module>.yaml` per module.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: String,

    /// Root that prompt paths in module files are relative to.
    #[serde(default = "default_prompts_root")]
    pub prompts_root: String,

    /// Maximum evidence items carried into a prompt.
    #[serde(default = "default_max_evidence")]
    pub max_evidence: usize,

    /// Maximum rendered prompt size, in characters.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Maximum search queries in flight at once.
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,

    /// Run outcome database path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_db: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            prompts_root: default_prompts_root(),
            max_evidence: default_max_evidence(),
            max_prompt_chars: default_max_prompt_chars(),
            search_concurrency: default_search_concurrency(),
            runs_db: None,
        }
    }
}

impl EngineConfig {
    /// Run database path: the configured one, or `~/.briefengine/runs.db`.
    pub fn runs_db_path(&self) -> Result<PathBuf> {
        match &self.runs_db {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(config_dir()?.join(RUNS_DB_NAME)),
        }
    }
}

fn default_modules_dir() -> String {
    "configs".into()
}
fn default_prompts_root() -> String {
    ".".into()
}
fn default_max_evidence() -> usize {
    40
}
fn default_max_prompt_chars() -> usize {
    60_000
}
fn default_search_concurrency() -> usize {
    3
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Name of the env var holding the search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    /// Web search endpoint.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Results requested per query.
    #[serde(default = "default_results_per_query")]
    pub results_per_query: u32,

    /// Per-query timeout.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,

    /// Minimum spacing between query dispatches, for rate-limited plans.
    #[serde(default = "default_search_min_interval")]
    pub min_interval_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            endpoint: default_search_endpoint(),
            results_per_query: default_results_per_query(),
            timeout_secs: default_search_timeout(),
            min_interval_ms: default_search_min_interval(),
        }
    }
}

fn default_search_min_interval() -> u64 {
    1200
}
fn default_search_key_env() -> String {
    "BRAVE_API_KEY".into()
}
fn default_search_endpoint() -> String {
    "https://api.search.brave.com/res/v1/web/search".into()
}
fn default_results_per_query() -> u32 {
    8
}
fn default_search_timeout() -> u64 {
    15
}

/// `[model]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name of the env var holding the model API key.
    #[serde(default = "default_model_key_env")]
    pub api_key_env: String,

    /// Messages API endpoint.
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,

    /// Model used when a module does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Output token ceiling used when a module does not set one.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Per-call timeout.
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_model_key_env(),
            endpoint: default_model_endpoint(),
            default_model: default_model(),
            default_max_tokens: default_max_tokens(),
            timeout_secs: default_model_timeout(),
        }
    }
}

fn default_model_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_model_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".into()
}
fn default_model() -> String {
    "claude-haiku-4-5-20251001".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_model_timeout() -> u64 {
    60
}

/// `[delivery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Name of the env var holding the bot token.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Bot API base URL (the token and method are appended).
    #[serde(default = "default_delivery_endpoint")]
    pub endpoint: String,

    /// Per-send timeout.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Suppress link preview cards under the message.
    #[serde(default = "default_true")]
    pub disable_web_page_preview: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            endpoint: default_delivery_endpoint(),
            timeout_secs: default_delivery_timeout(),
            disable_web_page_preview: true,
        }
    }
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".into()
}
fn default_delivery_endpoint() -> String {
    "https://api.telegram.org".into()
}
fn default_delivery_timeout() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per model or delivery call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure; doubles per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    8000
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// The three opaque secrets the providers need, read once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub search_api_key: String,
    pub model_api_key: String,
    pub bot_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    /// Read every credential from the environment variables the config names.
    pub fn from_env(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            search_api_key: read_secret(&config.search.api_key_env, "search")?,
            model_api_key: read_secret(&config.model.api_key_env, "model")?,
            bot_token: read_secret(&config.delivery.bot_token_env, "delivery")?,
        })
    }
}

fn read_secret(var_name: &str, purpose: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(BriefError::config(format!(
            "{purpose} credential not found. Set the {var_name} environment variable."
        ))),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.briefengine/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| BriefError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.briefengine/briefengine.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| BriefError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| BriefError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BriefError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| BriefError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BriefError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
