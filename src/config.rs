// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub compute: ComputeConfig,
    pub descriptors: DescriptorConfig,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lava".to_string(),
            width: 600,
            height: 480,
            resizable: false,
        }
    }
}

/// Buffers, shader and the initial staging upload
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Precompiled SPIR-V binary, relative to the working directory
    pub shader_path: PathBuf,
    /// Size in bytes of both the staging and the device-local buffer
    pub buffer_size: u64,
    /// Bytes copied from the staging buffer into the device-local buffer
    pub copy_size: u64,
    pub submit_copy: bool,
    pub fence_timeout_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::from("shaders/add.comp.spv"),
            buffer_size: 1024,
            copy_size: 1000,
            submit_copy: true,
            fence_timeout_ms: 1000,
        }
    }
}

/// Descriptor pool capacity
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub max_sets: u32,
    pub storage_buffer_count: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            max_sets: 10,
            storage_buffer_count: 5,
        }
    }
}

/// Physical device selection
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Enumeration index of the GPU to use. Falls back to scoring when the
    /// device is missing or has no compute queue.
    pub preferred_index: Option<usize>,
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "lava_errors.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Reject settings the Vulkan calls would fail on later
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            anyhow::bail!(
                "Window size must be non-zero, got {}x{}",
                self.window.width,
                self.window.height
            );
        }

        let compute = &self.compute;
        if compute.buffer_size == 0 {
            anyhow::bail!("compute.buffer_size must be non-zero");
        }
        if compute.copy_size == 0 {
            anyhow::bail!("compute.copy_size must be non-zero");
        }
        if compute.copy_size > compute.buffer_size {
            anyhow::bail!(
                "compute.copy_size ({}) exceeds compute.buffer_size ({})",
                compute.copy_size,
                compute.buffer_size
            );
        }

        if self.descriptors.max_sets == 0 {
            anyhow::bail!("descriptors.max_sets must be at least 1");
        }
        if self.descriptors.storage_buffer_count == 0 {
            anyhow::bail!("descriptors.storage_buffer_count must be at least 1");
        }

        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.compute.fence_timeout_ms)
    }

    /// Validation layers are only requested in debug builds
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("lava-{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_match_reference_setup() {
        let config = Config::default();
        assert_eq!(config.window.title, "Lava");
        assert_eq!((config.window.width, config.window.height), (600, 480));
        assert!(!config.window.resizable);
        assert_eq!(config.compute.buffer_size, 1024);
        assert_eq!(config.compute.copy_size, 1000);
        assert_eq!(config.descriptors.max_sets, 10);
        assert_eq!(config.descriptors.storage_buffer_count, 5);
        assert!(config.device.preferred_index.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [compute]
            buffer_size = 4096

            [device]
            preferred_index = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.compute.buffer_size, 4096);
        assert_eq!(config.compute.copy_size, 1000);
        assert_eq!(config.device.preferred_index, Some(1));
        assert_eq!(config.window.title, "Lava");
    }

    #[test]
    fn copy_larger_than_buffer_is_rejected() {
        let mut config = Config::default();
        config.compute.copy_size = 2048;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn zero_sized_values_are_rejected() {
        let mut config = Config::default();
        config.window.height = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.descriptors.storage_buffer_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.compute.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("/nonexistent/lava/config.toml").unwrap();
        assert_eq!(config.compute.buffer_size, 1024);
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = temp_config("malformed", "[compute\nbuffer_size = ");
        let err = Config::load_from_path(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn file_values_are_loaded() {
        let path = temp_config("valid", "[window]\ntitle = \"Compute\"\n");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.window.title, "Compute");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn fence_timeout_is_in_milliseconds() {
        let mut config = Config::default();
        config.compute.fence_timeout_ms = 250;
        assert_eq!(config.fence_timeout(), Duration::from_millis(250));
    }
}
