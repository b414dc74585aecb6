// Configuration - load settings from frameloop.toml
//
// Provides full defaults when the config file is missing or malformed, so
// embedding applications can run without shipping one.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RendererConfig {
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub app_name: String,
    /// How many frames the CPU may record ahead of the GPU. 2 or 3.
    pub frames_in_flight: usize,
    /// Preferred swapchain image count, clamped to surface capabilities.
    pub preferred_image_count: u32,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            app_name: "frameloop".to_string(),
            frames_in_flight: 2,
            preferred_image_count: 3,
            present_mode: "mailbox".to_string(),
            clear_color: [0.02, 0.02, 0.02, 1.0],
            clear_depth: 1.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_frame_stats: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_frame_stats: false,
        }
    }
}

impl RendererConfig {
    /// Load configuration from frameloop.toml, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path("frameloop.toml")
            .unwrap_or_else(|e| {
                log::warn!("Failed to load frameloop.toml: {}. Using defaults.", e);
                RendererConfig::default()
            })
            .validated()
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RendererConfig::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: RendererConfig = toml::from_str(&content).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Clamp out-of-range values to what the pipelining model supports
    pub fn validated(mut self) -> Self {
        if !(2..=3).contains(&self.graphics.frames_in_flight) {
            let clamped = self.graphics.frames_in_flight.clamp(2, 3);
            log::warn!(
                "frames_in_flight = {} unsupported, clamping to {}",
                self.graphics.frames_in_flight,
                clamped
            );
            self.graphics.frames_in_flight = clamped;
        }
        if self.graphics.preferred_image_count < self.graphics.frames_in_flight as u32 {
            log::warn!(
                "preferred_image_count = {} is below frames_in_flight, raising",
                self.graphics.preferred_image_count
            );
            self.graphics.preferred_image_count = self.graphics.frames_in_flight as u32;
        }
        self
    }

    /// Preferred present mode as a Vulkan enum, None when unrecognized
    pub fn preferred_present_mode(&self) -> Option<ash::vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(ash::vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(ash::vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(ash::vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(ash::vk::PresentModeKHR::FIFO_RELAXED),
            other => {
                log::warn!("Unknown present mode '{}', using selection policy", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn defaults_are_valid() {
        let config = RendererConfig::default().validated();
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.preferred_image_count, 3);
        assert_eq!(
            config.preferred_present_mode(),
            Some(vk::PresentModeKHR::MAILBOX)
        );
    }

    #[test]
    fn parses_toml_tables() {
        let config: RendererConfig = toml::from_str(
            r#"
            [graphics]
            frames_in_flight = 3
            present_mode = "fifo"
            clear_color = [0.0, 0.0, 0.0, 1.0]

            [debug]
            validation_layers = false
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert!(!config.debug.validation_layers);
        assert_eq!(
            config.preferred_present_mode(),
            Some(vk::PresentModeKHR::FIFO)
        );
        // Unspecified fields keep their defaults
        assert_eq!(config.graphics.preferred_image_count, 3);
    }

    #[test]
    fn clamps_frames_in_flight() {
        let mut config = RendererConfig::default();
        config.graphics.frames_in_flight = 7;
        let config = config.validated();
        assert_eq!(config.graphics.frames_in_flight, 3);

        let mut config = RendererConfig::default();
        config.graphics.frames_in_flight = 0;
        assert_eq!(config.validated().graphics.frames_in_flight, 2);
    }

    #[test]
    fn image_count_never_below_frames_in_flight() {
        let mut config = RendererConfig::default();
        config.graphics.frames_in_flight = 3;
        config.graphics.preferred_image_count = 2;
        let config = config.validated();
        assert_eq!(config.graphics.preferred_image_count, 3);
    }

    #[test]
    fn unknown_present_mode_defers_to_policy() {
        let mut config = RendererConfig::default();
        config.graphics.present_mode = "vsync-ish".to_string();
        assert_eq!(config.preferred_present_mode(), None);
    }
}
