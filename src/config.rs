use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            state_path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default = "default_cache_window_days")]
    pub cache_window_days: i64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: i64,
    /// Body characters sent to the LLM for newsletter/digest/automated mail
    #[serde(default = "default_simple_context_chars")]
    pub simple_context_chars: usize,
    #[serde(default = "default_min_context_chars")]
    pub min_context_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_few_shot_examples")]
    pub few_shot_examples: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            cache_window_days: default_cache_window_days(),
            cache_capacity: default_cache_capacity(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            simple_context_chars: default_simple_context_chars(),
            min_context_chars: default_min_context_chars(),
            max_context_chars: default_max_context_chars(),
            few_shot_examples: default_few_shot_examples(),
        }
    }
}

/// One OpenAI-compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_base: String,
    pub model: String,
    /// Environment variable holding the API key; local endpoints may leave it unset
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Estimated price per 1k tokens, used for cost telemetry only
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_primary")]
    pub primary: ProviderConfig,
    #[serde(default = "default_llm_fallback")]
    pub fallback: ProviderConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: default_llm_primary(),
            fallback: default_llm_fallback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_primary")]
    pub primary: ProviderConfig,
    #[serde(default = "default_embedding_secondary")]
    pub secondary: Option<ProviderConfig>,
    #[serde(default = "default_embedding_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_embedding_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_embedding_input_chars")]
    pub max_input_chars: usize,
    /// Vector distance metric: "cosine" or "euclidean"
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            primary: default_embedding_primary(),
            secondary: default_embedding_secondary(),
            max_attempts: default_embedding_attempts(),
            initial_delay_ms: default_embedding_initial_delay_ms(),
            max_input_chars: default_embedding_input_chars(),
            metric: default_metric(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    #[serde(default = "default_auto_assign_threshold")]
    pub auto_assign_threshold: f32,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_llm_base_confidence")]
    pub llm_base_confidence: f32,
    #[serde(default = "default_agreement_confidence")]
    pub agreement_confidence: f32,
    #[serde(default = "default_palette")]
    pub palette: Vec<String>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            auto_assign_threshold: default_auto_assign_threshold(),
            similarity_threshold: default_similarity_threshold(),
            llm_base_confidence: default_llm_base_confidence(),
            agreement_confidence: default_agreement_confidence(),
            palette: default_palette(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".mail-triage/triage.db")
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".mail-triage/state.json")
}

fn default_cache_window_days() -> i64 {
    30
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_rate_limit_cooldown_secs() -> i64 {
    60
}

fn default_simple_context_chars() -> usize {
    500
}

fn default_min_context_chars() -> usize {
    1000
}

fn default_max_context_chars() -> usize {
    4000
}

fn default_few_shot_examples() -> usize {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_llm_primary() -> ProviderConfig {
    ProviderConfig {
        name: "primary".to_string(),
        api_base: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        request_timeout_secs: default_request_timeout_secs(),
        cost_per_1k_tokens: 0.15,
    }
}

fn default_llm_fallback() -> ProviderConfig {
    ProviderConfig {
        name: "local".to_string(),
        api_base: "http://localhost:11434/v1".to_string(),
        model: "llama3.1".to_string(),
        api_key_env: None,
        request_timeout_secs: 120,
        cost_per_1k_tokens: 0.0,
    }
}

fn default_embedding_primary() -> ProviderConfig {
    ProviderConfig {
        name: "primary-embeddings".to_string(),
        api_base: "https://api.openai.com/v1".to_string(),
        model: "text-embedding-3-small".to_string(),
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        request_timeout_secs: default_request_timeout_secs(),
        cost_per_1k_tokens: 0.02,
    }
}

fn default_embedding_secondary() -> Option<ProviderConfig> {
    Some(ProviderConfig {
        name: "local-embeddings".to_string(),
        api_base: "http://localhost:11434/v1".to_string(),
        model: "nomic-embed-text".to_string(),
        api_key_env: None,
        request_timeout_secs: 60,
        cost_per_1k_tokens: 0.0,
    })
}

fn default_embedding_attempts() -> u32 {
    3
}

fn default_embedding_initial_delay_ms() -> u64 {
    500
}

fn default_embedding_input_chars() -> usize {
    2000
}

fn default_metric() -> String {
    "cosine".to_string()
}

fn default_auto_assign_threshold() -> f32 {
    0.8
}

fn default_similarity_threshold() -> f32 {
    0.85
}

fn default_llm_base_confidence() -> f32 {
    0.6
}

fn default_agreement_confidence() -> f32 {
    0.95
}

fn default_palette() -> Vec<String> {
    [
        "#4285f4", "#34a853", "#fbbc04", "#ea4335", "#9c27b0", "#00acc1", "#ff7043", "#8d6e63",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_sync_enabled() -> bool {
    true
}

fn default_max_concurrent_accounts() -> usize {
    4
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let classification = &self.classification;
        if classification.cache_window_days <= 0 {
            return Err(TriageError::ConfigError(
                "classification.cache_window_days must be at least 1".to_string(),
            ));
        }
        if classification.cache_capacity == 0 {
            return Err(TriageError::ConfigError(
                "classification.cache_capacity must be greater than 0".to_string(),
            ));
        }
        if classification.rate_limit_cooldown_secs <= 0 {
            return Err(TriageError::ConfigError(
                "classification.rate_limit_cooldown_secs must be greater than 0".to_string(),
            ));
        }
        if classification.simple_context_chars == 0
            || classification.min_context_chars == 0
            || classification.max_context_chars < classification.min_context_chars
        {
            return Err(TriageError::ConfigError(
                "classification context windows must be positive and max_context_chars >= min_context_chars"
                    .to_string(),
            ));
        }

        for provider in [&self.llm.primary, &self.llm.fallback, &self.embedding.primary]
            .into_iter()
            .chain(self.embedding.secondary.as_ref())
        {
            validate_provider(provider)?;
        }

        if self.embedding.max_attempts == 0 {
            return Err(TriageError::ConfigError(
                "embedding.max_attempts must be at least 1".to_string(),
            ));
        }
        match self.embedding.metric.as_str() {
            "cosine" | "euclidean" => {}
            other => {
                return Err(TriageError::ConfigError(format!(
                    "Invalid embedding.metric: '{}'. Must be 'cosine' or 'euclidean'",
                    other
                )));
            }
        }

        let labels = &self.labels;
        for (name, value) in [
            ("auto_assign_threshold", labels.auto_assign_threshold),
            ("similarity_threshold", labels.similarity_threshold),
            ("llm_base_confidence", labels.llm_base_confidence),
            ("agreement_confidence", labels.agreement_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TriageError::ConfigError(format!(
                    "labels.{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }
        if labels.palette.is_empty() {
            return Err(TriageError::ConfigError(
                "labels.palette cannot be empty".to_string(),
            ));
        }
        if labels.palette.iter().any(|c| c.trim().is_empty()) {
            return Err(TriageError::ConfigError(
                "labels.palette cannot contain empty strings".to_string(),
            ));
        }

        if self.sync.max_concurrent_accounts == 0 {
            return Err(TriageError::ConfigError(
                "sync.max_concurrent_accounts must be at least 1".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}

fn validate_provider(provider: &ProviderConfig) -> Result<()> {
    if provider.api_base.trim().is_empty() {
        return Err(TriageError::ConfigError(format!(
            "provider '{}' has an empty api_base",
            provider.name
        )));
    }
    if provider.model.trim().is_empty() {
        return Err(TriageError::ConfigError(format!(
            "provider '{}' has an empty model",
            provider.name
        )));
    }
    if provider.cost_per_1k_tokens < 0.0 {
        return Err(TriageError::ConfigError(format!(
            "provider '{}' cost_per_1k_tokens cannot be negative",
            provider.name
        )));
    }
    if provider.request_timeout_secs == 0 {
        return Err(TriageError::ConfigError(format!(
            "provider '{}' request_timeout_secs must be greater than 0",
            provider.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.classification.cache_window_days, 30);
        assert_eq!(config.classification.rate_limit_cooldown_secs, 60);
        assert_eq!(config.embedding.max_attempts, 3);
        assert_eq!(config.embedding.metric, "cosine");
        assert!(config.embedding.secondary.is_some());
        assert_eq!(config.labels.auto_assign_threshold, 0.8);
        assert_eq!(config.labels.similarity_threshold, 0.85);
        assert_eq!(config.labels.llm_base_confidence, 0.6);
        assert_eq!(config.labels.agreement_confidence, 0.95);
        assert_eq!(config.labels.palette.len(), 8);
        assert!(config.sync.enabled);
        assert_eq!(config.llm.fallback.api_base, "http://localhost:11434/v1");
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_cache_window() {
        let mut config = Config::default();
        config.classification.cache_window_days = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cache_window_days"));
    }

    #[test]
    fn test_config_validation_context_window_order() {
        let mut config = Config::default();
        config.classification.max_context_chars = 100;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_context_chars >= min_context_chars"));
    }

    #[test]
    fn test_config_validation_invalid_metric() {
        let mut config = Config::default();
        config.embedding.metric = "manhattan".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid embedding.metric"));
    }

    #[test]
    fn test_config_validation_threshold_out_of_range() {
        let mut config = Config::default();
        config.labels.similarity_threshold = 1.5;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("labels.similarity_threshold must be between"));
    }

    #[test]
    fn test_config_validation_empty_palette() {
        let mut config = Config::default();
        config.labels.palette.clear();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("palette cannot be empty"));
    }

    #[test]
    fn test_config_validation_empty_model() {
        let mut config = Config::default();
        config.llm.fallback.model = " ".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("provider 'local' has an empty model"));
    }

    #[test]
    fn test_config_validation_zero_accounts() {
        let mut config = Config::default();
        config.sync.max_concurrent_accounts = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let config = Config::default();
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();

        assert_eq!(config.classification.cache_window_days, loaded.classification.cache_window_days);
        assert_eq!(config.llm.primary.model, loaded.llm.primary.model);
        assert_eq!(config.labels.palette, loaded.labels.palette);
        assert_eq!(
            config.embedding.secondary.map(|p| p.model),
            loaded.embedding.secondary.map(|p| p.model)
        );
    }

    #[tokio::test]
    async fn test_config_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/nonexistent-mail-triage-config-12345.toml");

        let config = Config::load(path).await.unwrap();

        assert_eq!(config.classification.cache_window_days, 30);
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        tokio::fs::write(path, "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(path).await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let partial_config = r#"
[classification]
cache_window_days = 7

[sync]
enabled = false
"#;
        tokio::fs::write(path, partial_config).await.unwrap();

        let config = Config::load(path).await.unwrap();

        assert_eq!(config.classification.cache_window_days, 7);
        assert!(!config.sync.enabled);

        assert_eq!(config.classification.rate_limit_cooldown_secs, 60);
        assert_eq!(config.sync.max_concurrent_accounts, 4);
        assert_eq!(config.labels.auto_assign_threshold, 0.8);
    }

    #[tokio::test]
    async fn test_config_create_example() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        Config::create_example(path).await.unwrap();

        assert!(path.exists());
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.embedding.max_attempts, 3);
    }
}
