use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub log_path: Option<PathBuf>,
    pub use_ultimate_workflow: bool,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub redis_url: Option<String>,
    #[serde(skip_serializing)]
    pub google_api_key: Option<String>,
    pub llm: LLMSettings,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub caches: CacheConfig,
    pub upload: UploadConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMSettings {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub model_chat: String,
    pub model_analysis: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chat_k: usize,
    /// Cut-off for chat-time retrieval.
    pub chat_threshold: f32,
    /// Cut-off for maintenance and search endpoints.
    pub search_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_turns: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub rag_ttl_secs: u64,
    pub rag_capacity: usize,
    pub response_ttl_secs: u64,
    pub response_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub blob_dir: PathBuf,
    /// Worker pool size is this multiple of the available CPUs.
    pub workers_per_cpu: usize,
    pub task_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl AppConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.trim().is_empty() {
            return Err("database_url must not be empty".into());
        }
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval.chat_k == 0 {
            return Err("retrieval.chat_k must be > 0".into());
        }
        for (name, value) in [
            ("retrieval.chat_threshold", self.retrieval.chat_threshold),
            ("retrieval.search_threshold", self.retrieval.search_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(format!("{} must be in [-1.0, 1.0]", name));
            }
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err("llm.temperature must be in [0.0, 2.0]".into());
        }
        if self.llm.max_tokens == 0 {
            return Err("llm.max_tokens must be > 0".into());
        }
        if self.memory.max_turns == 0 {
            return Err("memory.max_turns must be > 0".into());
        }
        if self.upload.workers_per_cpu == 0 {
            return Err("upload.workers_per_cpu must be > 0".into());
        }
        Ok(())
    }

    /// Build the config from process environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = var("DATABASE_URL") {
            config.database_url = url;
        }
        config.log_path = var("LOG_PATH").map(PathBuf::from);
        if let Some(flag) = var("USE_ULTIMATE_WORKFLOW") {
            config.use_ultimate_workflow = parse_bool(&flag);
        }
        config.secret_key = var("SECRET_KEY");
        config.redis_url = var("REDIS_URL");
        config.google_api_key = var("GOOGLE_API_KEY");

        if let Some(key) = var("OPENAI_API_KEY") {
            config.llm.api_key = key;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            config.llm.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = var("OPENAI_MODEL_CHAT") {
            config.llm.model_chat = model;
        }
        if let Some(model) = var("OPENAI_MODEL_ANALYSIS") {
            config.llm.model_analysis = model;
        }
        if let Some(t) = var("OPENAI_TEMPERATURE") {
            config.llm.temperature = t
                .parse()
                .map_err(|e| format!("OPENAI_TEMPERATURE is not a number: {}", e))?;
        }
        if let Some(n) = var("OPENAI_MAX_TOKENS") {
            config.llm.max_tokens = n
                .parse()
                .map_err(|e| format!("OPENAI_MAX_TOKENS is not an integer: {}", e))?;
        }
        if let Some(model) = var("OPENAI_MODEL_EMBEDDING") {
            config.embedding.model = model;
        }
        if let Some(dim) = var("EMBEDDING_DIMENSION") {
            config.embedding.dimension = dim
                .parse()
                .map_err(|e| format!("EMBEDDING_DIMENSION is not an integer: {}", e))?;
        }
        if let Some(dir) = var("UPLOAD_DIR") {
            config.upload.blob_dir = PathBuf::from(dir);
        }
        if let Some(addr) = var("BIND_ADDR") {
            config.server.bind_addr = addr;
        }

        config.validate()?;
        if config.llm.api_key.trim().is_empty() && var("CARELINE_ALLOW_NO_KEY").is_none() {
            return Err("OPENAI_API_KEY is required (set CARELINE_ALLOW_NO_KEY to run without it)".into());
        }
        Ok(config)
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve `database_url` to a SQLite location. `None` means in-memory.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        let url = self.database_url.trim();
        if url == "sqlite::memory:" || url == ":memory:" {
            return None;
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Some(PathBuf::from(path))
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();

        Self {
            database_url: format!("sqlite://{}", data_dir.join("careline.db").display()),
            log_path: None,
            use_ultimate_workflow: true,
            secret_key: None,
            redis_url: None,
            google_api_key: None,
            llm: LLMSettings::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
            caches: CacheConfig::default(),
            upload: UploadConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for LLMSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_chat: "gpt-4o-mini".to_string(),
            model_analysis: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            timeout_secs: 20,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            cache_size: 1000,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            min_chunk_size: 1,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chat_k: 5,
            chat_threshold: 0.45,
            search_threshold: 0.3,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            cache_ttl_secs: 30 * 60,
            cache_capacity: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rag_ttl_secs: 5 * 60,
            rag_capacity: 50,
            response_ttl_secs: 5 * 60,
            response_capacity: 100,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_data_dir().join("uploads"),
            workers_per_cpu: 2,
            task_timeout_secs: 300,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("careline")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert!((config.retrieval.chat_threshold - 0.45).abs() < f32::EPSILON);
    }

    #[test]
    fn env_overrides_apply() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:///tmp/care.db"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL_CHAT", "gpt-4o"),
            ("OPENAI_TEMPERATURE", "0.3"),
            ("OPENAI_MAX_TOKENS", "256"),
            ("USE_ULTIMATE_WORKFLOW", "false"),
            ("LOG_PATH", "/tmp/care.log"),
        ]))
        .unwrap();

        assert_eq!(config.llm.api_key, "sk-test");
        assert_eq!(config.llm.model_chat, "gpt-4o");
        assert_eq!(config.llm.max_tokens, 256);
        assert!(!config.use_ultimate_workflow);
        assert_eq!(config.sqlite_path(), Some(PathBuf::from("/tmp/care.db")));
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/care.log")));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("OPENAI_TEMPERATURE", "hot")]));
        assert!(err.is_err());
        let err = AppConfig::from_lookup(lookup_from(&[("OPENAI_TEMPERATURE", "3.5")]));
        assert!(err.is_err());
    }

    #[test]
    fn memory_database_url() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("CARELINE_ALLOW_NO_KEY", "1"),
        ]))
        .unwrap();
        assert_eq!(config.sqlite_path(), None);
    }

    #[test]
    fn api_key_is_required_unless_waived() {
        assert!(AppConfig::from_lookup(lookup_from(&[])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("CARELINE_ALLOW_NO_KEY", "1")])).is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut config = AppConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }
}
