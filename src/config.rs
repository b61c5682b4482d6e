// 配置读取:YAML 文件 + 环境变量覆盖,解析失败时回退默认值。
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/parley.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Fragments to accumulate before an edit is due.
    pub batch_size: usize,
    /// Minimum seconds between message edits on the channel.
    pub min_update_interval_s: f64,
    /// How many recent chat events feed the model on each turn.
    pub history_window: usize,
    /// Body of the initial message before any fragment arrived.
    pub placeholder: String,
    /// Optional banner prefixed to every delivered edit.
    #[serde(default)]
    pub preamble: Option<String>,
    /// Fallback system prompt when the config blob carries none.
    pub system_prompt: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            min_update_interval_s: 1.0,
            history_window: 10,
            placeholder: "...".to_string(),
            preamble: None,
            system_prompt: "You are a friendly chatbot who always responds in the language \
                            of the person who spoke to you."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

pub fn load_config() -> Config {
    let path = env::var("PARLEY_CONFIG").unwrap_or_else(|_| "parley.yaml".to_string());
    let mut config = read_config(&path);
    apply_env_overrides(&mut config);
    config
}

fn read_config(path: &str) -> Config {
    // 配置文件允许不存在,首次启动直接用默认值。
    if !Path::new(path).exists() {
        return Config::default();
    }
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("读取配置失败: {path}, {err}");
            return Config::default();
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("配置解析失败,使用默认配置: {err}");
        Config::default()
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = env::var("PARLEY_DB_PATH") {
        if !value.trim().is_empty() {
            config.storage.db_path = value;
        }
    }
    if let Ok(value) = env::var("PARLEY_LLM_BASE_URL") {
        if !value.trim().is_empty() {
            config.llm.base_url = Some(value);
        }
    }
    if let Ok(value) = env::var("PARLEY_LLM_API_KEY") {
        if !value.trim().is_empty() {
            config.llm.api_key = Some(value);
        }
    }
    if let Ok(value) = env::var("PARLEY_LLM_MODEL") {
        if !value.trim().is_empty() {
            config.llm.model = Some(value);
        }
    }
}
