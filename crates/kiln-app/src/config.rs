//! Application configuration.

use std::path::Path;
use std::time::Duration;

use kiln_gpu::ash::vk;
use serde::{Deserialize, Serialize};

/// Present mode requested from the swapchain. FIFO is used when the requested
/// mode is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl PresentModeSetting {
    /// Vulkan equivalent.
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

/// Which class of GPU to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Any,
}

impl DeviceClass {
    /// Vulkan device type, `None` for [`DeviceClass::Any`].
    pub fn to_vk(self) -> Option<vk::PhysicalDeviceType> {
        match self {
            Self::Discrete => Some(vk::PhysicalDeviceType::DISCRETE_GPU),
            Self::Integrated => Some(vk::PhysicalDeviceType::INTEGRATED_GPU),
            Self::Virtual => Some(vk::PhysicalDeviceType::VIRTUAL_GPU),
            Self::Cpu => Some(vk::PhysicalDeviceType::CPU),
            Self::Any => None,
        }
    }
}

/// Application configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Minimum frame time in milliseconds (None for unlimited).
    pub min_frame_time_ms: Option<u64>,
    /// Requested present mode.
    pub present_mode: PresentModeSetting,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Upper bound on waiting for a swapchain image.
    pub acquire_timeout_ms: u64,
    /// Upper bound on waiting for a frame slot's fence.
    pub fence_timeout_ms: u64,
    /// Accelerator to use when several are suitable (None to ask).
    pub device_index: Option<usize>,
    /// Accepted device class.
    pub device_class: DeviceClass,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Kiln".to_string(),
            width: 1280,
            height: 720,
            frames_in_flight: kiln_core::constants::DEFAULT_FRAMES_IN_FLIGHT,
            min_frame_time_ms: None,
            present_mode: PresentModeSetting::default(),
            validation: cfg!(debug_assertions),
            acquire_timeout_ms: 1_000,
            fence_timeout_ms: 5_000,
            device_index: None,
            device_class: DeviceClass::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> kiln_core::Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| kiln_core::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> kiln_core::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject values the render loop cannot work with.
    pub fn validate(&self) -> kiln_core::Result<()> {
        if self.frames_in_flight == 0 {
            return Err(kiln_core::Error::Config(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(kiln_core::Error::Config(format!(
                "window size {}x{} has no area",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the minimum frame time.
    pub fn with_min_frame_time_ms(mut self, ms: u64) -> Self {
        self.min_frame_time_ms = Some(ms);
        self
    }

    /// Set the requested present mode.
    pub fn with_present_mode(mut self, mode: PresentModeSetting) -> Self {
        self.present_mode = mode;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Pick a fixed accelerator instead of asking.
    pub fn with_device_index(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    /// Set the accepted device class.
    pub fn with_device_class(mut self, class: DeviceClass) -> Self {
        self.device_class = class;
        self
    }

    /// Minimum frame time as a duration.
    pub fn min_frame_time(&self) -> Option<Duration> {
        self.min_frame_time_ms.map(Duration::from_millis)
    }

    /// Acquire timeout in nanoseconds.
    pub fn acquire_timeout_ns(&self) -> u64 {
        self.acquire_timeout_ms.saturating_mul(1_000_000)
    }

    /// Fence timeout in nanoseconds.
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.present_mode, PresentModeSetting::Immediate);
    }

    #[test]
    fn partial_document_overrides_keys() {
        let config = AppConfig::from_toml_str(
            r#"
            title = "viewer"
            width = 800
            height = 600
            present_mode = "fifo"
            min_frame_time_ms = 5
            device_class = "any"
            "#,
        )
        .unwrap();

        assert_eq!(config.title, "viewer");
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.present_mode.to_vk(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.min_frame_time(), Some(Duration::from_millis(5)));
        assert_eq!(config.device_class.to_vk(), None);
        assert_eq!(config.fence_timeout_ms, AppConfig::default().fence_timeout_ms);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(AppConfig::from_toml_str("frames_in_flight = 0").is_err());
        assert!(AppConfig::from_toml_str("width = 0").is_err());
        assert!(AppConfig::from_toml_str("present_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("demo")
            .with_size(640, 480)
            .with_frames_in_flight(3)
            .with_device_index(1)
            .with_validation(false);
        assert_eq!(config.title, "demo");
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.device_index, Some(1));
        assert!(!config.validation);
        assert_eq!(config.acquire_timeout_ns(), 1_000_000_000);
    }
}
