//! Adapter and device selection settings.

use std::path::Path;

use minigpu_core::ConfigError;
use serde::{Deserialize, Serialize};

/// Adapter power preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerPreference {
    None,
    LowPower,
    #[default]
    HighPerformance,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(value: PowerPreference) -> Self {
        match value {
            PowerPreference::None => wgpu::PowerPreference::None,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Native graphics APIs the instance may enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendSet {
    All,
    #[default]
    Primary,
    Vulkan,
    Metal,
    Dx12,
    Gl,
}

impl From<BackendSet> for wgpu::Backends {
    fn from(value: BackendSet) -> Self {
        match value {
            BackendSet::All => wgpu::Backends::all(),
            BackendSet::Primary => wgpu::Backends::PRIMARY,
            BackendSet::Vulkan => wgpu::Backends::VULKAN,
            BackendSet::Metal => wgpu::Backends::METAL,
            BackendSet::Dx12 => wgpu::Backends::DX12,
            BackendSet::Gl => wgpu::Backends::GL,
        }
    }
}

/// Settings for a [`WgpuBackend`](crate::WgpuBackend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgpuConfig {
    pub power_preference: PowerPreference,
    /// Only accept a software adapter
    pub force_fallback_adapter: bool,
    pub backends: BackendSet,
    pub device_label: String,
    /// Kernel entry point looked up on every load
    pub entry_point: String,
}

impl Default for WgpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::default(),
            force_fallback_adapter: false,
            backends: BackendSet::default(),
            device_label: "minigpu device".to_string(),
            entry_point: "main".to_string(),
        }
    }
}

impl WgpuConfig {
    /// Parse settings from RON text. Missing fields take defaults.
    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }

    /// Load settings from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_ron_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WgpuConfig::default();
        assert_eq!(config.entry_point, "main");
        assert_eq!(
            wgpu::PowerPreference::from(config.power_preference),
            wgpu::PowerPreference::HighPerformance
        );
        assert_eq!(wgpu::Backends::from(config.backends), wgpu::Backends::PRIMARY);
    }

    #[test]
    fn test_parse_partial() {
        let config =
            WgpuConfig::from_ron_str("(backends: Vulkan, force_fallback_adapter: true)").unwrap();
        assert_eq!(config.backends, BackendSet::Vulkan);
        assert!(config.force_fallback_adapter);
        assert_eq!(config.power_preference, PowerPreference::HighPerformance);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(matches!(
            WgpuConfig::from_ron_str("(backends: Glide)"),
            Err(ConfigError::Deserialize(_))
        ));
    }
}
