//! Provider registry.
//!
//! The registry is built once at startup and shared read-only. Lookups accept
//! a provider id or any of its aliases, case-insensitively; unknown names are
//! an error, never a silent default.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider name reserved for automatic selection on the command line.
pub const AUTO_PROVIDER: &str = "auto";

const DEFAULT_PRIORITY: u32 = 100;

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

/// Immutable description of one external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    /// argv template; supports `{model}`, `{prompt}` and `{files}`.
    pub command_template: Vec<String>,
    /// argv whose zero exit means the provider is usable. Empty skips the check.
    #[serde(default)]
    pub auth_check_command: Vec<String>,
    pub context_window_tokens: u64,
    #[serde(default)]
    pub default_model: String,
    /// Short model names mapped to full model ids.
    #[serde(default)]
    pub model_aliases: BTreeMap<String, String>,
    /// Alternative provider names.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Rank for automatic selection, lower first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl ServiceConfig {
    pub fn new(
        id: impl Into<String>,
        command_template: Vec<String>,
        context_window_tokens: u64,
    ) -> Self {
        Self {
            id: id.into(),
            command_template,
            auth_check_command: Vec::new(),
            context_window_tokens,
            default_model: String::new(),
            model_aliases: BTreeMap::new(),
            aliases: Vec::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_auth_check(mut self, command: Vec<String>) -> Self {
        self.auth_check_command = command;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_model_alias(mut self, alias: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_aliases.insert(alias.into(), model.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Model to run: a model alias is expanded, an unknown name is passed through,
    /// and no request falls back to the default model.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim).filter(|m| !m.is_empty()) {
            Some(name) => self
                .model_aliases
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string()),
            None => self.default_model.clone(),
        }
    }

    /// Google Gemini CLI.
    pub fn gemini() -> Self {
        Self::new(
            "gemini",
            argv(&[
                "gemini",
                "--model",
                "{model}",
                "--output-format",
                "json",
                "--prompt",
                "{prompt}",
                "{files}",
            ]),
            1_000_000,
        )
        .with_auth_check(argv(&["gemini", "--version"]))
        .with_default_model("gemini-2.5-pro")
        .with_model_alias("pro", "gemini-2.5-pro")
        .with_model_alias("flash", "gemini-2.5-flash")
        .with_alias("google")
        .with_priority(10)
    }

    /// Qwen Code CLI.
    pub fn qwen() -> Self {
        Self::new(
            "qwen",
            argv(&["qwen", "--model", "{model}", "--prompt", "{prompt}", "{files}"]),
            32_000,
        )
        .with_auth_check(argv(&["qwen", "--version"]))
        .with_default_model("qwen3-coder-plus")
        .with_model_alias("coder", "qwen3-coder-plus")
        .with_alias("qwen-code")
        .with_priority(20)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        // The id names the provider's quota file.
        let id_chars_ok = self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !id_chars_ok || !self.id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid(
                "id must start with a letter or digit and contain only letters, digits, '-', '_' or '.'",
            ));
        }
        if self.command_template.is_empty() || self.command_template[0].trim().is_empty() {
            return Err(invalid("command_template must name a program"));
        }
        if self.context_window_tokens == 0 {
            return Err(invalid("context_window_tokens must be greater than 0"));
        }
        Ok(())
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("provider name '{name}' is used by both '{first}' and '{second}'")]
    Duplicate {
        name: String,
        first: String,
        second: String,
    },

    #[error("invalid provider '{id}': {reason}")]
    Invalid { id: String, reason: String },
}

/// Read-only table of providers keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<ServiceConfig>>,
    /// Lowercased id or alias -> id.
    names: HashMap<String, String>,
}

impl ServiceRegistry {
    /// Build a registry, rejecting invalid entries and clashing names.
    pub fn new(services: Vec<ServiceConfig>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for service in services {
            service.validate()?;
            let names = std::iter::once(&service.id).chain(service.aliases.iter());
            for name in names {
                let key = name.trim().to_lowercase();
                if key == AUTO_PROVIDER {
                    return Err(RegistryError::Invalid {
                        id: service.id.clone(),
                        reason: format!("'{}' is reserved", AUTO_PROVIDER),
                    });
                }
                match registry.names.get(&key) {
                    // An alias that repeats its own id is harmless.
                    Some(owner) if owner == &service.id => {}
                    Some(owner) => {
                        return Err(RegistryError::Duplicate {
                            name: name.clone(),
                            first: owner.clone(),
                            second: service.id.clone(),
                        })
                    }
                    None => {
                        registry.names.insert(key, service.id.clone());
                    }
                }
            }
            registry
                .services
                .insert(service.id.clone(), Arc::new(service));
        }

        Ok(registry)
    }

    /// The built-in gemini and qwen providers.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for service in [ServiceConfig::gemini(), ServiceConfig::qwen()] {
            for name in std::iter::once(&service.id).chain(service.aliases.iter()) {
                registry.names.insert(name.to_lowercase(), service.id.clone());
            }
            registry
                .services
                .insert(service.id.clone(), Arc::new(service));
        }
        registry
    }

    /// Canonical id for a provider id or alias.
    pub fn resolve_alias(&self, name: &str) -> Result<String, RegistryError> {
        self.names
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    /// Look up a provider by id or alias.
    pub fn lookup(&self, name: &str) -> Result<Arc<ServiceConfig>, RegistryError> {
        let id = self.resolve_alias(name)?;
        self.services
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownProvider(id))
    }

    /// All providers, sorted by id.
    pub fn list_available(&self) -> Vec<Arc<ServiceConfig>> {
        self.services.values().cloned().collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
