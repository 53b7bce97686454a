//! Combined configuration file for the CLI.

use std::path::Path;

use minigpu_core::{ConfigError, ContextConfig};
use minigpu_wgpu::WgpuConfig;
use serde::{Deserialize, Serialize};

/// Contents of `minigpu.ron`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub context: ContextConfig,
    pub wgpu: WgpuConfig,
}

impl CliConfig {
    /// Loads `path`, or defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = ron::from_str(&content).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minigpu_wgpu::BackendSet;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CliConfig::load_or_default(Path::new("/nonexistent/minigpu.ron")).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let config: CliConfig = ron::from_str(
            "(context: (label: \"cli\", warn_on_leaks: false), wgpu: (backends: Gl))",
        )
        .unwrap();
        assert_eq!(config.context.label, "cli");
        assert!(!config.context.warn_on_leaks);
        assert!(config.context.verify_cached_source);
        assert_eq!(config.wgpu.backends, BackendSet::Gl);
    }
}
