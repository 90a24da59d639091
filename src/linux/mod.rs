//! Linux X11 support module
//!
//! Window queries, per-frame capture, the X11 session with its extension
//! checks, and stop-key polling.

pub mod capture;
pub mod input;
pub mod session;
pub mod window;

pub use capture::{
    CapturedFrame, DmaBufFrame, Dri3Capture, FrameCapture, FrameLayout, HostFrame, ShmBuffer,
    ShmCapture, WindowSystem,
};
pub use input::{StopKey, StopSignal};
pub use session::X11Session;
pub use window::{SourceSurfaceHandle, WindowInfo};
