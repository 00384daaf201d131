//! Configuration loading.
//!
//! Sources are layered: built-in defaults, then a TOML file, then `CONJURE_*`
//! environment variables (`__` separates nested keys, e.g.
//! `CONJURE_LIMITS__GEMINI__REQUESTS_PER_DAY=500`). The file is taken from
//! `--config`, then `CONJURE_CONFIG`, then `~/.conjure/conjure.toml` if it exists.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::budget::DEFAULT_CHARS_PER_TOKEN;
use crate::delegation::validate_template;
use crate::quota::QuotaLimits;
use crate::registry::{RegistryError, ServiceConfig, ServiceRegistry};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CONJURE_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CONJURE";

const DATA_DIR_NAME: &str = ".conjure";
const CONFIG_FILE_NAME: &str = "conjure.toml";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid provider configuration: {0}")]
    Registry(#[from] RegistryError),

    #[error("invalid command template for '{provider}': {reason}")]
    Template { provider: String, reason: String },

    #[error("invalid limits for '{provider}': {reason}")]
    Limits { provider: String, reason: String },

    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Typed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConjureConfig {
    pub providers: Vec<ServiceConfig>,
    /// Provider id or alias -> limits.
    pub limits: BTreeMap<String, QuotaLimits>,
    /// Directory holding one quota file per provider.
    pub quota_dir: Option<PathBuf>,
    pub usage_log_path: Option<PathBuf>,
    pub default_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub chars_per_token_fallback: f64,
    /// Per-stream capture limit for provider output.
    pub max_output_bytes: usize,
    pub cleanup_interval_secs: u64,
    /// Register gemini and qwen when no providers are configured.
    pub use_builtin_providers: bool,
}

impl Default for ConjureConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            limits: BTreeMap::new(),
            quota_dir: None,
            usage_log_path: None,
            default_timeout_ms: 300_000,
            auth_timeout_ms: 10_000,
            chars_per_token_fallback: DEFAULT_CHARS_PER_TOKEN,
            max_output_bytes: 1024 * 1024,
            cleanup_interval_secs: 3_600,
            use_builtin_providers: true,
        }
    }
}

/// `~/.conjure`, or `.conjure` in the working directory when there is no home.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

/// `~/.conjure/conjure.toml`.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE_NAME)
}

impl ConjureConfig {
    /// Load and validate configuration.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let requested = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let mut builder = Config::builder();
        match requested {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::NotFound(path));
                }
                debug!(path = %path.display(), "loading configuration");
                builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
            }
            None => {
                let path = default_config_path();
                debug!(path = %path.display(), "loading optional default configuration");
                builder = builder.add_source(
                    File::new(&path.to_string_lossy(), FileFormat::Toml).required(false),
                );
            }
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ConjureConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would misbehave at dispatch time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.chars_per_token_fallback.is_finite() && self.chars_per_token_fallback > 0.0) {
            return Err(ConfigError::Invalid {
                field: "chars_per_token_fallback",
                reason: format!("must be a positive number, got {}", self.chars_per_token_fallback),
            });
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_output_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }

        let registry = self.registry()?;
        if registry.is_empty() {
            return Err(ConfigError::Invalid {
                field: "providers",
                reason: "no providers configured".to_string(),
            });
        }

        for service in registry.list_available() {
            let mut templates = vec![&service.command_template];
            if !service.auth_check_command.is_empty() {
                templates.push(&service.auth_check_command);
            }
            for template in templates {
                validate_template(template).map_err(|err| ConfigError::Template {
                    provider: service.id.clone(),
                    reason: err.to_string(),
                })?;
            }
        }

        self.resolved_limits(&registry)?;
        Ok(())
    }

    /// The provider registry this configuration describes.
    pub fn registry(&self) -> Result<ServiceRegistry, ConfigError> {
        if self.providers.is_empty() && self.use_builtin_providers {
            return Ok(ServiceRegistry::builtin());
        }
        Ok(ServiceRegistry::new(self.providers.clone())?)
    }

    /// Limits keyed by canonical provider id.
    ///
    /// Built-in providers without configured limits get their free-tier presets;
    /// other providers default to unlimited.
    pub fn resolved_limits(
        &self,
        registry: &ServiceRegistry,
    ) -> Result<HashMap<String, QuotaLimits>, ConfigError> {
        let mut resolved = HashMap::new();

        if self.providers.is_empty() && self.use_builtin_providers {
            resolved.insert("gemini".to_string(), QuotaLimits::gemini_free_tier());
            resolved.insert("qwen".to_string(), QuotaLimits::qwen_free_tier());
        }

        for (name, limits) in &self.limits {
            let id = registry.resolve_alias(name).map_err(|_| ConfigError::Limits {
                provider: name.clone(),
                reason: "no such provider".to_string(),
            })?;
            limits.validate().map_err(|reason| ConfigError::Limits {
                provider: name.clone(),
                reason,
            })?;
            resolved.insert(id, limits.clone());
        }

        Ok(resolved)
    }

    pub fn resolved_quota_dir(&self) -> PathBuf {
        self.quota_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("quota"))
    }

    pub fn resolved_usage_log_path(&self) -> PathBuf {
        self.usage_log_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("usage.jsonl"))
    }

    pub fn with_provider(mut self, service: ServiceConfig) -> Self {
        self.providers.push(service);
        self
    }

    pub fn with_limits(mut self, provider: impl Into<String>, limits: QuotaLimits) -> Self {
        self.limits.insert(provider.into(), limits);
        self
    }

    /// Put the quota directory and usage log under `dir`.
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.quota_dir = Some(dir.join("quota"));
        self.usage_log_path = Some(dir.join("usage.jsonl"));
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn without_builtin_providers(mut self) -> Self {
        self.use_builtin_providers = false;
        self
    }
}
