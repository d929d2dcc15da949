//! Configuration (spec §6, expanded in SPEC_FULL.md A.3): a JSON document
//! preserved verbatim on disk. `$VAR`/`${VAR}` tokens are resolved against
//! the environment on a working copy used to build the typed `Config`; the
//! original `serde_json::Value` keeps the literal tokens so unknown keys and
//! un-substituted placeholders round-trip on save.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("environment variable not set: ${0}")]
    MissingEnvVar(String),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: crate::retention::RetentionPolicy,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path or name of the LLM-CLI binary spawned per task.
    #[serde(default = "default_binary")]
    pub binary: String,
    pub default_model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub skills_dirs: Vec<String>,
    /// Session message count above which `maybe_compact_session` summarizes
    /// the oldest messages instead of leaving them to grow unbounded.
    #[serde(default = "default_session_compact_high_water")]
    pub session_compact_high_water: i64,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default)]
    pub allowed_senders: Vec<i64>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    #[serde(default)]
    pub allowed_guilds: Vec<u64>,
    #[serde(default)]
    pub allowed_users: Vec<u64>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

// ---------------------------------------------------------------------------
// Security / trust
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub shell_deny_patterns: Vec<String>,
    #[serde(default)]
    pub tools: HashMap<String, ToolPermission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPermission {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u32,
    #[serde(default)]
    pub levels: HashMap<String, String>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            promotion_threshold: default_promotion_threshold(),
            levels: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default)]
    pub per_model: HashMap<String, ModelRateConfig>,
    #[serde(default)]
    pub classification_cost: f64,
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold_usd: f64,
    #[serde(default)]
    pub daily_cap_usd: Option<f64>,
    #[serde(default)]
    pub weekly_cap_usd: Option<f64>,
    #[serde(default)]
    pub monthly_cap_usd: Option<f64>,
    #[serde(default = "default_over_budget_action")]
    pub over_budget_action: String,
    #[serde(default)]
    pub downgrade_threshold_usd: f64,
    #[serde(default)]
    pub warning_threshold_usd: f64,
    #[serde(default = "default_downgrade_model")]
    pub downgrade_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

// ---------------------------------------------------------------------------
// Web UI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { enabled: false, port: default_web_port(), bind: default_web_bind() }
    }
}

// ---------------------------------------------------------------------------
// Scheduler / notify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    /// Channel (by name, matching a configured adapter) cron/reminder/board
    /// notifications are delivered through. `None` disables delivery.
    #[serde(default)]
    pub channel: Option<String>,
    /// Fixed session id notifications are addressed to within that channel.
    #[serde(default)]
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_binary() -> String {
    "claude".to_string()
}
fn default_workdir() -> String {
    "~/tetora/work".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_db_path() -> String {
    "~/.tetora/tetora.db".to_string()
}
fn default_true() -> bool {
    true
}
fn default_promotion_threshold() -> u32 {
    10
}
fn default_confirmation_threshold() -> f64 {
    1.0
}
fn default_over_budget_action() -> String {
    "pause".to_string()
}
fn default_downgrade_model() -> String {
    "gpt-5-mini".to_string()
}
fn default_web_port() -> u16 {
    19898
}
fn default_web_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_tick_interval() -> u64 {
    30
}
fn default_session_compact_high_water() -> i64 {
    200
}

// ---------------------------------------------------------------------------
// Loading / env expansion
// ---------------------------------------------------------------------------

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn env_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap())
}

fn expand_env_string(input: &str) -> Result<String, ConfigError> {
    let mut result = input.to_string();
    let captures: Vec<(String, String)> = env_var_re().captures_iter(input).map(|c| (c[0].to_string(), c[1].to_string())).collect();
    for (full_match, var_name) in captures {
        let value = std::env::var(&var_name).map_err(|_| ConfigError::MissingEnvVar(var_name.clone()))?;
        result = result.replace(&full_match, &value);
    }
    Ok(result)
}

/// Walk a JSON tree, expanding `$VAR`/`${VAR}` in string leaves. Operates on
/// a clone — the caller's original `Value` keeps literal tokens intact.
fn expand_env_in_value(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = expand_env_string(s)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env_in_value(item)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_in_value(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".tetora")
}

/// Parse a config document, returning both the typed `Config` and the
/// original (un-expanded) `Value` for round-tripping.
pub fn parse_config(raw: &str) -> Result<(Config, Value), ConfigError> {
    let original: Value = serde_json::from_str(raw)?;
    let mut working = original.clone();
    expand_env_in_value(&mut working)?;
    let config: Config = serde_json::from_value(working)?;
    Ok((config, original))
}

/// Read/update wrapper around the on-disk JSON document. `read()` hands out
/// a cheap `Arc<Config>` snapshot; in-flight tasks hold onto their snapshot
/// so a concurrent `update()` never mutates state underneath them.
pub struct ConfigStore {
    path: PathBuf,
    raw: RwLock<Value>,
    config: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let (config, raw) = parse_config(&text)?;
        Ok(Self {
            path: path.to_path_buf(),
            raw: RwLock::new(raw),
            config: RwLock::new(Arc::new(config)),
        })
    }

    pub fn read(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    /// Apply `mutator` to the retained raw JSON tree, re-derive the typed
    /// config, then atomically rewrite the file (write-temp + rename, mode
    /// 0644) so unknown keys and literal `$VAR` tokens survive the round trip.
    pub fn update<F>(&self, mutator: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Value),
    {
        let mut raw = self.raw.write().unwrap();
        let mut candidate = raw.clone();
        mutator(&mut candidate);

        let mut working = candidate.clone();
        expand_env_in_value(&mut working)?;
        let config: Config = serde_json::from_value(working)?;

        let pretty = serde_json::to_string_pretty(&candidate)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &pretty)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644))?;
        }
        std::fs::rename(&tmp, &self.path)?;

        *raw = candidate;
        *self.config.write().unwrap() = Arc::new(config);
        Ok(())
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        expand_tilde(&self.persistence.db_path)
    }

    pub fn workdir(&self) -> PathBuf {
        expand_tilde(&self.agent.workdir)
    }

    pub fn skills_dirs(&self) -> Vec<PathBuf> {
        if self.agent.skills_dirs.is_empty() {
            vec![config_dir().join("skills")]
        } else {
            self.agent.skills_dirs.iter().map(|s| expand_tilde(s)).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "agent": { "default_model": "claude-sonnet-4-20250514" },
            "channels": { "telegram": { "bot_token": "123:ABC" } }
        }"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let (config, _raw) = parse_config(minimal_json()).unwrap();
        assert_eq!(config.agent.default_model, "claude-sonnet-4-20250514");
        assert_eq!(config.agent.binary, "claude");
        assert_eq!(config.agent.max_concurrent, 4);
        assert!(config.channels.telegram.is_some());
        let tg = config.channels.telegram.unwrap();
        assert_eq!(tg.bot_token, "123:ABC");
        assert_eq!(tg.debounce_ms, 2000);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TETORA_TEST_KEY", "expanded-value");
        let json = r#"{
            "agent": { "default_model": "test", "system_prompt": "${TETORA_TEST_KEY}" }
        }"#;
        let (config, _raw) = parse_config(json).unwrap();
        assert_eq!(config.agent.system_prompt.as_deref(), Some("expanded-value"));
        std::env::remove_var("TETORA_TEST_KEY");
    }

    #[test]
    fn test_missing_env_var() {
        let json = r#"{ "agent": { "default_model": "test", "system_prompt": "${TETORA_NOPE}" } }"#;
        let err = parse_config(json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "TETORA_NOPE"));
    }

    #[test]
    fn test_unknown_keys_round_trip_in_raw_value() {
        let json = r#"{
            "agent": { "default_model": "test" },
            "experimentalFeatureNotYetModeled": { "foo": 1 }
        }"#;
        let (_config, raw) = parse_config(json).unwrap();
        assert!(raw.get("experimentalFeatureNotYetModeled").is_some());
    }

    #[test]
    fn test_store_update_preserves_unknown_keys_and_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "agent": { "default_model": "test" },
                "customThing": { "keep": true }
            }"#,
        )
        .unwrap();
        let store = ConfigStore::load(&path).unwrap();
        store
            .update(|raw| {
                raw["agent"]["default_model"] = Value::String("updated-model".to_string());
            })
            .unwrap();
        assert_eq!(store.read().agent.default_model, "updated-model");

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["customThing"]["keep"], Value::Bool(true));
        assert_eq!(on_disk["agent"]["default_model"], Value::String("updated-model".to_string()));
    }

    #[test]
    fn test_store_update_keeps_literal_var_token_on_disk() {
        std::env::set_var("TETORA_ROUNDTRIP_KEY", "secret-value");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "agent": { "default_model": "test", "system_prompt": "${TETORA_ROUNDTRIP_KEY}" } }"#,
        )
        .unwrap();
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.read().agent.system_prompt.as_deref(), Some("secret-value"));
        store.update(|raw| { raw["agent"]["max_concurrent"] = Value::from(8); }).unwrap();
        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["agent"]["system_prompt"], Value::String("${TETORA_ROUNDTRIP_KEY}".to_string()));
        std::env::remove_var("TETORA_ROUNDTRIP_KEY");
    }

    #[test]
    fn test_defaults() {
        let (config, _raw) = parse_config(r#"{ "agent": { "default_model": "test" } }"#).unwrap();
        assert_eq!(config.persistence.db_path, "~/.tetora/tetora.db");
        assert!(config.channels.telegram.is_none());
        assert!(config.trust.enabled);
        assert_eq!(config.trust.promotion_threshold, 10);
        assert_eq!(config.budget.over_budget_action, "pause");
        assert_eq!(config.retention.history, 90);
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/.tetora/config.json");
        assert!(path.to_str().unwrap().contains(".tetora/config.json"));
        assert!(!path.to_str().unwrap().starts_with('~'));
    }
}
