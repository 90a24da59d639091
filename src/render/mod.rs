//! Vulkan side of the mirror
//!
//! Device bootstrap, source textures, the swapchain, command recording and
//! the presentation loop, assembled into pipelines in [`pipeline`].

pub mod bootstrap;
pub mod extent;
pub mod memory;
pub mod pipeline;
pub mod present;
pub mod recorder;
pub mod swapchain;
pub mod texture;

pub use bootstrap::GpuContext;
pub use pipeline::{build_renderer, PipelineSettings, Renderer};
pub use present::FrameStatus;
