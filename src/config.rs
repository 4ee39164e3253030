use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// User IDs always treated as bots in private chats
    #[serde(default)]
    pub known_bot_ids: Vec<u64>,
    /// Messages starting with this prefix are treated as sent by a bot
    #[serde(default = "default_bot_message_prefix")]
    pub bot_message_prefix: String,
    /// Answer messages classified as coming from other bots
    #[serde(default)]
    pub reply_to_bots: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub http_referer: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    #[default]
    Buffer,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackend,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Number of turns the sqlite backend loads back
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::default(),
            max_length: default_max_length(),
            window: default_window(),
            database_path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverBackend {
    #[default]
    Simple,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrieverConfig {
    #[serde(default)]
    pub backend: RetrieverBackend,
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            backend: RetrieverBackend::default(),
            documents_dir: default_documents_dir(),
            top_k: default_top_k(),
            database_path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub condense_system: Option<String>,
    #[serde(default)]
    pub qa_system: Option<String>,
}

fn default_bot_message_prefix() -> String {
    "[bot]".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_title() -> String {
    "ragbot".to_string()
}

fn default_max_length() -> usize {
    1000
}

fn default_window() -> usize {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ragbot.db")
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("knowledge")
}

fn default_top_k() -> usize {
    4
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).context("Failed to parse config file")?;

        if config.telegram.bot_token.is_empty() {
            if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
                config.telegram.bot_token = token;
            }
        }

        Ok(config)
    }
}
