//! Environment configuration. `.env` is loaded first by `load_dotenv`.

use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Load `.env` from the working directory if there is one.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), ".env loaded"),
        Err(err) if err.not_found() => {}
        Err(err) => tracing::warn!(error = %err, "failed to read .env"),
    }
}

/// Set and non-empty.
fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(format!("unknown storage kind: {other}")),
        }
    }
}

/// Keys and models of the generation providers.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub deepseek_api_key: Option<String>,
    pub xai_api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_api_key: None,
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            deepseek_api_key: None,
            xai_api_key: None,
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            anthropic_model: var("ANTHROPIC_MODEL").unwrap_or(defaults.anthropic_model),
            deepseek_api_key: var("DEEPSEEK_API_KEY"),
            xai_api_key: var("XAI_API_KEY"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub storage: StorageKind,
    /// Directory holding `messages.json` for file storage.
    pub data_dir: Option<PathBuf>,
    pub corpus_dir: Option<PathBuf>,
    pub personas_file: Option<PathBuf>,
    pub default_figure: Option<String>,
    /// Earlier messages handed to the model per turn.
    pub history_limit: usize,
    pub providers: ProviderConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let addr = parsed("SOPHIA_ADDR", SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))?;
        let storage = match var("SOPHIA_STORAGE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "SOPHIA_STORAGE",
                value,
            })?,
            None => StorageKind::File,
        };
        Ok(Self {
            addr,
            storage,
            data_dir: var("SOPHIA_DATA_DIR").map(PathBuf::from),
            corpus_dir: var("SOPHIA_CORPUS_DIR").map(PathBuf::from),
            personas_file: var("SOPHIA_PERSONAS_FILE").map(PathBuf::from),
            default_figure: var("SOPHIA_DEFAULT_FIGURE"),
            history_limit: parsed("SOPHIA_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            providers: ProviderConfig::from_env(),
        })
    }

    /// Where file storage keeps its snapshot.
    pub fn messages_path(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("messages.json"),
            None => crate::storage::LocalRepository::default_path(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_url: String,
    pub session_id: String,
}

impl ClientConfig {
    /// A fresh random session is used when `SOPHIA_SESSION` is unset.
    pub fn from_env() -> Self {
        Self {
            server_url: var("SOPHIA_SERVER_URL").unwrap_or_else(|| format!("http://127.0.0.1:{DEFAULT_PORT}")),
            session_id: var("SOPHIA_SESSION").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}
