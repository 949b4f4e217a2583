//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Failed to load the Vulkan loader library.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A graphics, compute or transfer queue family could not be assigned.
    #[error("Queue family requirement not satisfied: {0}")]
    UnsatisfiedQueueFamilies(String),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The surface changed and the swapchain no longer matches it.
    #[error("Surface is out of date")]
    SurfaceOutOfDate,

    /// The window has no drawable area (e.g. minimized).
    #[error("Surface extent is zero ({width}x{height})")]
    ZeroExtent { width: u32, height: u32 },

    /// A bounded wait expired.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The operation needs a window surface but the context is headless.
    #[error("Operation requires a window surface but the context is headless")]
    Headless,

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A caller broke an API contract (programming error, never retried).
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// How the render loop should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Recover in place (recreate the swapchain, retry next frame).
    Transient,
    /// Abort with a diagnostic.
    Fatal,
}

impl GpuError {
    /// Classify this error, assuming the surface is known to be current.
    pub fn severity(&self) -> ErrorSeverity {
        self.severity_with_stale_surface(false)
    }

    /// Classify this error. A timeout counts as transient only when the
    /// surface was already known to be stale when it happened.
    pub fn severity_with_stale_surface(&self, surface_stale: bool) -> ErrorSeverity {
        match self {
            Self::SurfaceOutOfDate | Self::ZeroExtent { .. } => ErrorSeverity::Transient,
            Self::Timeout(_) if surface_stale => ErrorSeverity::Transient,
            _ => ErrorSeverity::Fatal,
        }
    }

    /// Whether the swapchain must be recreated before rendering continues.
    pub fn requires_recreation(&self) -> bool {
        matches!(self, Self::SurfaceOutOfDate)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutOfDate,
            vk::Result::TIMEOUT => Self::Timeout("GPU"),
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_is_transient() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, GpuError::SurfaceOutOfDate));
        assert_eq!(err.severity(), ErrorSeverity::Transient);
        assert!(err.requires_recreation());
    }

    #[test]
    fn timeout_depends_on_surface_state() {
        let err = GpuError::from(vk::Result::TIMEOUT);
        assert_eq!(err.severity(), ErrorSeverity::Fatal);
        assert_eq!(
            err.severity_with_stale_surface(true),
            ErrorSeverity::Transient
        );
    }

    #[test]
    fn setup_and_contract_errors_are_fatal() {
        for err in [
            GpuError::NoSuitableDevice,
            GpuError::UnsatisfiedQueueFamilies("transfer".into()),
            GpuError::ContractViolation("construct called twice".into()),
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
        ] {
            assert_eq!(err.severity_with_stale_surface(true), ErrorSeverity::Fatal);
        }
    }

    #[test]
    fn zero_extent_is_transient() {
        let err = GpuError::ZeroExtent {
            width: 0,
            height: 600,
        };
        assert_eq!(err.severity(), ErrorSeverity::Transient);
        assert!(!err.requires_recreation());
    }
}
