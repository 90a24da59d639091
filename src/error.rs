//! Error types for capture and presentation
//!
//! Capture failures come from the X11 side, GPU failures from Vulkan. Both
//! are folded into [`Error`], which the frame loop surfaces to its caller.

use ash::vk;
use thiserror::Error;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

use crate::config::ConfigError;

/// Broad category of a failure, used by the caller of `draw()` to decide
/// whether to skip a source, retry or terminate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Window not viewable, not redirected, missing extension.
    Precondition,
    /// Swapchain out of date or surface resized.
    Transient,
    /// No memory type, no import handle, unsupported format.
    Resource,
    /// X11 protocol error or shm segment failure.
    Protocol,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("window 0x{0:x} is not viewable")]
    SourceNotViewable(u32),

    #[error("window 0x{0:x} has not been redirected for off-screen capture")]
    NotRedirected(u32),

    #[error("window 0x{0:x} does not exist")]
    WindowNotFound(u32),

    #[error("snapshot of window 0x{window:x} failed with X error code {code}")]
    SnapshotRequestFailed { window: u32, code: u8 },

    #[error("shm {request} failed with X error code {code}")]
    ShmSegment { request: &'static str, code: u8 },

    #[error("no importable buffer for window 0x{window:x}: {reason}")]
    ImportHandleUnavailable { window: u32, reason: String },

    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("frame size {width}x{height} at {bytes_per_pixel} bytes per pixel overflows")]
    BufferOverflow {
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    },

    #[error("unsupported pixel depth {0}")]
    UnsupportedDepth(u8),

    #[error("X server does not support {name} {major}.{minor}")]
    ExtensionUnsupported {
        name: &'static str,
        major: u32,
        minor: u32,
    },

    #[error("invalid display name {0:?}")]
    InvalidDisplay(String),

    #[error("failed to connect to X11 display: {0}")]
    Connect(#[from] ConnectError),

    #[error("X11 connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("X11 request failed: {0}")]
    Reply(#[from] ReplyError),

    #[error("X11 request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),

    #[error("shared memory error: {0}")]
    Os(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SourceNotViewable(_)
            | Self::NotRedirected(_)
            | Self::WindowNotFound(_)
            | Self::ExtensionUnsupported { .. }
            | Self::InvalidDisplay(_)
            | Self::Connect(_) => ErrorClass::Precondition,
            Self::ImportHandleUnavailable { .. }
            | Self::BufferOverflow { .. }
            | Self::UnsupportedDepth(_)
            | Self::Os(_)
            | Self::Io(_) => ErrorClass::Resource,
            Self::SnapshotRequestFailed { .. }
            | Self::ShmSegment { .. }
            | Self::BufferSizeMismatch { .. }
            | Self::Connection(_)
            | Self::Reply(_)
            | Self::ReplyOrId(_) => ErrorClass::Protocol,
        }
    }
}

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no memory type matches bits {type_bits:#x} with flags {flags:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("surface does not support {0:?} image usage")]
    UnsupportedUsage(vk::ImageUsageFlags),

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("missing Vulkan extension {0}")]
    MissingExtension(String),

    #[error("no command buffer recorded for swapchain image {0}")]
    NotRecorded(u32),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
}

impl GpuError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Vulkan {
                result: vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR,
                ..
            } => ErrorClass::Transient,
            Self::NoSuitableDevice(_) | Self::MissingExtension(_) | Self::Loading(_) => {
                ErrorClass::Precondition
            }
            Self::Vulkan { .. }
            | Self::NoCompatibleMemoryType { .. }
            | Self::UnsupportedFormat(_)
            | Self::UnsupportedUsage(_)
            | Self::NotRecorded(_) => ErrorClass::Resource,
        }
    }
}

/// Attach the name of the failing Vulkan entry point to a raw result.
pub trait VkResultExt<T> {
    fn vk(self, call: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn vk(self, call: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::Vulkan { call, result })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Capture(e) => e.class(),
            Self::Gpu(e) => e.class(),
            Self::Config(_) => ErrorClass::Precondition,
        }
    }

    /// Only swapchain invalidation is recovered internally; everything else
    /// reaches the caller of `draw()`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
pub type GpuResult<T> = Result<T, GpuError>;
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_errors_are_not_recoverable() {
        let err = Error::from(CaptureError::SourceNotViewable(0x1a00003));
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert!(!err.is_recoverable());

        let err = Error::from(CaptureError::NotRedirected(7));
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[test]
    fn test_out_of_date_is_transient() {
        let err = Error::from(GpuError::Vulkan {
            call: "vkQueuePresentKHR",
            result: vk::Result::ERROR_OUT_OF_DATE_KHR,
        });
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_resource_and_protocol_classes() {
        let err = GpuError::NoCompatibleMemoryType {
            type_bits: 0b101,
            flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert_eq!(err.class(), ErrorClass::Resource);

        let err = CaptureError::ImportHandleUnavailable {
            window: 1,
            reason: "DRI3 missing".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Resource);

        let err = CaptureError::SnapshotRequestFailed { window: 1, code: 8 };
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(err.to_string().contains("code 8"), "error code must be kept");
    }

    #[test]
    fn test_vk_result_ext_names_the_call() {
        let res: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = res.vk("vkQueueSubmit").unwrap_err();
        assert!(err.to_string().starts_with("vkQueueSubmit failed"));
    }
}
