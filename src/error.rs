// Renderer error taxonomy
//
// Every failure carries enough context (operation + status code) to be
// diagnosed from the log alone.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("cannot find a compatible Vulkan ICD")]
    IncompatibleDriver,

    /// A creation/allocation/submission call returned a non-success status.
    #[error("{operation} failed: {result:?} ({})", .result.as_raw())]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },

    /// A call succeeded but returned zero items where at least one is required.
    #[error("no {what} reported")]
    Enumeration { what: &'static str },

    #[error("no physical device satisfies the renderer requirements")]
    NoSuitableDevice,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{what} was created but the handle is null")]
    NullHandle { what: &'static str },

    #[error("could not open shader file '{}': {source}", .path.display())]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shader '{name}' is empty")]
    EmptyShader { name: String },

    #[error("shader '{name}' is not valid SPIR-V: {source}")]
    InvalidShader {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn vulkan(operation: &'static str, result: vk::Result) -> Self {
        Self::Vulkan { operation, result }
    }

    /// The swapchain no longer matches the surface and must be rebuilt.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            Self::Vulkan {
                result: vk::Result::ERROR_OUT_OF_DATE_KHR,
                ..
            }
        )
    }

    /// Raw status code, when the error came from the driver.
    pub fn status(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            Self::IncompatibleDriver => Some(vk::Result::ERROR_INCOMPATIBLE_DRIVER),
            _ => None,
        }
    }
}

/// Attach an operation name to an `ash` result.
pub trait VkResultExt<T> {
    fn vk_context(self, operation: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn vk_context(self, operation: &'static str) -> RenderResult<T> {
        self.map_err(|result| RenderError::vulkan(operation, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_names_operation_and_status() {
        let err = RenderError::vulkan("vkQueuePresentKHR", vk::Result::ERROR_OUT_OF_DATE_KHR);
        let message = err.to_string();

        assert!(message.contains("vkQueuePresentKHR"));
        assert!(message.contains("ERROR_OUT_OF_DATE_KHR"));
        assert!(message.contains("-1000001004"));
    }

    #[test]
    fn only_out_of_date_is_recoverable() {
        let stale = RenderError::vulkan("vkAcquireNextImageKHR", vk::Result::ERROR_OUT_OF_DATE_KHR);
        let lost = RenderError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);

        assert!(stale.is_out_of_date());
        assert!(!lost.is_out_of_date());
        assert!(!RenderError::NoSuitableDevice.is_out_of_date());
    }

    #[test]
    fn vk_context_wraps_status() {
        let result: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let err = result.vk_context("vkCreateBuffer").unwrap_err();

        assert_eq!(err.status(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        match err {
            RenderError::Vulkan { operation, .. } => assert_eq!(operation, "vkCreateBuffer"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
