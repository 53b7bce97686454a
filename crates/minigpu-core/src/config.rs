//! Context configuration, loaded from RON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(String),
    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialize(String),
    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Settings for a [`ContextManager`](crate::ContextManager).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Label used in log output
    pub label: String,
    /// Warn on teardown if standalone buffers or shaders are still alive
    pub warn_on_leaks: bool,
    /// Compare full source text on cache hits before sharing a compiled kernel
    pub verify_cached_source: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            label: "minigpu".to_string(),
            warn_on_leaks: true,
            verify_cached_source: true,
        }
    }
}

impl ContextConfig {
    /// Parse a configuration from RON text. Missing fields take defaults.
    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_ron_str(&content)?;
        tracing::info!("Loaded context config from {:?}", path);
        Ok(config)
    }

    /// Serialize to pretty RON.
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ContextConfig::from_ron_str("(label: \"bench\")").unwrap();
        assert_eq!(config.label, "bench");
        assert!(config.warn_on_leaks);
        assert!(config.verify_cached_source);
    }

    #[test]
    fn test_ron_roundtrip() {
        let config = ContextConfig {
            label: "test".into(),
            warn_on_leaks: false,
            verify_cached_source: true,
        };
        let text = config.to_ron_string().unwrap();
        assert_eq!(ContextConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            ContextConfig::from_ron_str("(warn_on_leaks: 3)"),
            Err(ConfigError::Deserialize(_))
        ));
    }
}
