//! Mirror settings, loaded from a JSON file and overridden from the CLI

use std::fs;
use std::path::{Path, PathBuf};

use ash::vk;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::Layout;
use crate::linux::StopKey;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How source windows are brought to the GPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// MIT-SHM snapshot copied through a staging buffer
    #[default]
    Shm,
    /// DRI3 DMA-BUF import, no host copy
    ZeroCopy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PresentModePreference {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

impl PresentModePreference {
    pub fn vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatPreference {
    #[default]
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba8Unorm,
}

impl FormatPreference {
    pub fn vk(self) -> vk::SurfaceFormatKHR {
        let format = match self {
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        };
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub capture: CaptureMode,
    pub layout: Layout,
    pub format: FormatPreference,
    pub present_mode: PresentModePreference,
    /// Desired swapchain length, clamped to what the surface allows
    pub image_count: u32,
    pub acquire_timeout_ms: u64,
    /// RGBA clear colour, `None` skips the clear
    pub clear_color: Option<[f32; 4]>,
    /// How often the surface extent is polled, `None` disables polling
    pub refresh_interval_ms: Option<u64>,
    pub stop_key: StopKey,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            capture: CaptureMode::default(),
            layout: Layout::default(),
            format: FormatPreference::default(),
            present_mode: PresentModePreference::default(),
            image_count: 3,
            acquire_timeout_ms: 250,
            clear_color: Some([0.0, 0.0, 0.0, 1.0]),
            refresh_interval_ms: Some(500),
            stop_key: StopKey::default(),
        }
    }
}

impl MirrorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_count == 0 {
            return Err(ConfigError::Invalid("image_count must be at least 1".into()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "acquire_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.refresh_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "refresh_interval_ms must be greater than 0, omit it to disable".into(),
            ));
        }
        if let Some(color) = self.clear_color {
            if color.iter().any(|c| !(0.0..=1.0).contains(c)) {
                return Err(ConfigError::Invalid(format!(
                    "clear_color components must be within 0..=1, got {color:?}"
                )));
            }
        }
        Ok(())
    }
}
