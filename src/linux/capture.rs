//! Per-cycle capture of source window pixels
//!
//! Two strategies are available. [`ShmCapture`] copies the window contents
//! into a memfd-backed MIT-SHM segment and is the default. [`Dri3Capture`]
//! exports the window's redirected backing pixmap as a DMA-BUF for
//! zero-copy import and must be requested explicitly.

use std::collections::HashSet;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use x11rb::protocol::xproto::Window;

use crate::error::{CaptureError, CaptureResult};
use crate::geometry::Extent;
use crate::linux::window::SourceSurfaceHandle;

/// Operations the capture strategies need from the window system
pub trait WindowSystem {
    fn surface(&self, window: Window) -> CaptureResult<SourceSurfaceHandle>;

    /// Fill `buffer` with the window contents, returning the byte count
    /// reported by the server.
    fn shm_snapshot(
        &self,
        surface: &SourceSurfaceHandle,
        buffer: &mut ShmBuffer,
    ) -> CaptureResult<usize>;

    fn redirect(&self, window: Window) -> CaptureResult<()>;

    fn unredirect(&self, window: Window) -> CaptureResult<()>;

    /// Export the window's current backing pixmap as a DMA-BUF
    fn export_pixmap(&self, surface: &SourceSurfaceHandle) -> CaptureResult<DmaBufFrame>;
}

/// Dimensions of a host frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl FrameLayout {
    pub fn byte_len(&self) -> CaptureResult<usize> {
        let overflow = || CaptureError::BufferOverflow {
            width: self.width,
            height: self.height,
            bytes_per_pixel: self.bytes_per_pixel,
        };
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(self.bytes_per_pixel as usize))
            .ok_or_else(overflow)
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// Window pixels in host memory, tightly packed rows
#[derive(Debug, Clone, Copy)]
pub struct HostFrame<'a> {
    bytes: &'a [u8],
    layout: FrameLayout,
}

impl<'a> HostFrame<'a> {
    /// Rejects a byte slice whose length disagrees with the layout.
    pub fn new(bytes: &'a [u8], layout: FrameLayout) -> CaptureResult<Self> {
        let expected = layout.byte_len()?;
        if bytes.len() != expected {
            return Err(CaptureError::BufferSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes, layout })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }
}

/// Single-plane DMA-BUF exported from a window pixmap
#[derive(Debug)]
pub struct DmaBufFrame {
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
    /// DRM format modifier, `None` when the server could not report one
    /// and the buffer is assumed linear.
    pub modifier: Option<u64>,
    pub depth: u8,
    pub bits_per_pixel: u8,
}

impl DmaBufFrame {
    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// Output of one capture cycle
#[derive(Debug)]
pub enum CapturedFrame<'a> {
    Host(HostFrame<'a>),
    Imported(DmaBufFrame),
}

impl CapturedFrame<'_> {
    pub fn extent(&self) -> Extent {
        match self {
            Self::Host(frame) => frame.layout().extent(),
            Self::Imported(frame) => frame.extent(),
        }
    }
}

/// A capture strategy driven by the render pipeline once per cycle
pub trait FrameCapture {
    /// True when a bound frame keeps tracking the window after import,
    /// so it only needs to be captured again when the geometry changes.
    fn zero_copy(&self) -> bool;

    /// Called once per source before the first capture.
    fn prepare<W: WindowSystem>(&mut self, ws: &W, window: Window) -> CaptureResult<()>;

    fn capture<W: WindowSystem>(
        &mut self,
        ws: &W,
        surface: &SourceSurfaceHandle,
    ) -> CaptureResult<CapturedFrame<'_>>;

    /// Undo whatever `prepare` did. Failures are logged.
    fn release<W: WindowSystem>(&mut self, ws: &W);
}

/// memfd-backed shared memory mapped into this process
pub struct ShmBuffer {
    fd: OwnedFd,
    ptr: Option<NonNull<c_void>>,
    len: usize,
}

impl ShmBuffer {
    pub fn new(len: usize) -> CaptureResult<Self> {
        let fd = memfd_create(c"winmirror-shm", MemFdCreateFlag::MFD_CLOEXEC)?;
        let mut buffer = Self {
            fd,
            ptr: None,
            len: 0,
        };
        buffer.reinit(len)?;
        Ok(buffer)
    }

    /// Resize the segment. Returns true when the size changed.
    pub fn reinit(&mut self, len: usize) -> CaptureResult<bool> {
        if len == self.len {
            return Ok(false);
        }

        self.unmap();
        ftruncate(&self.fd, len as nix::libc::off_t)?;
        if let Some(size) = NonZeroUsize::new(len) {
            let ptr = unsafe {
                mmap(
                    None,
                    size,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &self.fd,
                    0,
                )?
            };
            self.ptr = Some(ptr);
        }
        self.len = len;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().cast(), self.len) },
            None => &mut [],
        }
    }

    /// Duplicate the memfd for handing to the X server
    pub fn dup_fd(&self) -> CaptureResult<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    fn unmap(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            if let Err(e) = unsafe { munmap(ptr, self.len) } {
                log::warn!("munmap of shm segment failed: {e}");
            }
        }
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// Host-memory snapshot through MIT-SHM
pub struct ShmCapture {
    buffer: ShmBuffer,
}

impl ShmCapture {
    pub fn new() -> CaptureResult<Self> {
        Ok(Self {
            buffer: ShmBuffer::new(0)?,
        })
    }

    pub fn capture<W: WindowSystem>(
        &mut self,
        ws: &W,
        surface: &SourceSurfaceHandle,
    ) -> CaptureResult<HostFrame<'_>> {
        if !surface.viewable {
            return Err(CaptureError::SourceNotViewable(surface.id));
        }

        let layout = surface.frame_layout();
        let len = layout.byte_len()?;
        if self.buffer.reinit(len)? {
            log::debug!(
                "shm segment resized to {} bytes for window 0x{:x} ({}x{})",
                self.buffer.len(),
                surface.id,
                layout.width,
                layout.height
            );
        }

        let written = ws.shm_snapshot(surface, &mut self.buffer).map_err(|e| {
            log::warn!("snapshot of window 0x{:x} failed: {e}", surface.id);
            e
        })?;
        if written != len {
            return Err(CaptureError::BufferSizeMismatch {
                expected: len,
                actual: written,
            });
        }

        HostFrame::new(self.buffer.as_slice(), layout)
    }
}

impl FrameCapture for ShmCapture {
    fn zero_copy(&self) -> bool {
        false
    }

    fn prepare<W: WindowSystem>(&mut self, _ws: &W, _window: Window) -> CaptureResult<()> {
        Ok(())
    }

    fn capture<W: WindowSystem>(
        &mut self,
        ws: &W,
        surface: &SourceSurfaceHandle,
    ) -> CaptureResult<CapturedFrame<'_>> {
        ShmCapture::capture(self, ws, surface).map(CapturedFrame::Host)
    }

    fn release<W: WindowSystem>(&mut self, _ws: &W) {}
}

/// Zero-copy export of redirected window pixmaps through DRI3
#[derive(Default)]
pub struct Dri3Capture {
    redirected: HashSet<Window>,
}

impl Dri3Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect a window off-screen so its backing pixmap can be exported
    pub fn redirect<W: WindowSystem>(&mut self, ws: &W, window: Window) -> CaptureResult<()> {
        if self.redirected.contains(&window) {
            return Ok(());
        }
        ws.redirect(window)?;
        self.redirected.insert(window);
        log::debug!("redirected window 0x{window:x}");
        Ok(())
    }

    pub fn unredirect_all<W: WindowSystem>(&mut self, ws: &W) {
        for window in self.redirected.drain() {
            if let Err(e) = ws.unredirect(window) {
                log::warn!("failed to unredirect window 0x{window:x}: {e}");
            }
        }
    }

    pub fn capture<W: WindowSystem>(
        &self,
        ws: &W,
        surface: &SourceSurfaceHandle,
    ) -> CaptureResult<DmaBufFrame> {
        if !self.redirected.contains(&surface.id) {
            return Err(CaptureError::NotRedirected(surface.id));
        }
        if !surface.viewable {
            return Err(CaptureError::SourceNotViewable(surface.id));
        }

        let frame = ws.export_pixmap(surface)?;
        if frame.width == 0 || frame.height == 0 {
            return Err(CaptureError::ImportHandleUnavailable {
                window: surface.id,
                reason: "exported pixmap is empty".to_string(),
            });
        }
        log::debug!(
            "exported window 0x{:x} as {}x{} dma-buf, stride {}, modifier {:?}",
            surface.id,
            frame.width,
            frame.height,
            frame.stride,
            frame.modifier
        );
        Ok(frame)
    }
}

impl FrameCapture for Dri3Capture {
    fn zero_copy(&self) -> bool {
        true
    }

    fn prepare<W: WindowSystem>(&mut self, ws: &W, window: Window) -> CaptureResult<()> {
        self.redirect(ws, window)
    }

    fn capture<W: WindowSystem>(
        &mut self,
        ws: &W,
        surface: &SourceSurfaceHandle,
    ) -> CaptureResult<CapturedFrame<'_>> {
        Dri3Capture::capture(self, ws, surface).map(CapturedFrame::Imported)
    }

    fn release<W: WindowSystem>(&mut self, ws: &W) {
        self.unredirect_all(ws);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::{Point, WindowGeometry};
    use std::cell::{Cell, RefCell};

    /// In-memory window system. Snapshots fill the buffer with a byte
    /// derived from the window id.
    #[derive(Default)]
    pub(crate) struct FakeWindowSystem {
        pub surfaces: RefCell<Vec<SourceSurfaceHandle>>,
        pub snapshot_calls: Cell<usize>,
        pub snapshot_error: Cell<Option<u8>>,
        pub short_reply: Cell<bool>,
        pub redirected: RefCell<Vec<Window>>,
    }

    pub(crate) fn surface(id: Window, width: u32, height: u32) -> SourceSurfaceHandle {
        SourceSurfaceHandle {
            id,
            geometry: WindowGeometry {
                origin: Point { x: 0, y: 0 },
                width,
                height,
                border: 0,
            },
            depth: 24,
            bytes_per_pixel: 4,
            viewable: true,
            class: "Fake".to_string(),
        }
    }

    impl FakeWindowSystem {
        pub(crate) fn with(surfaces: Vec<SourceSurfaceHandle>) -> Self {
            Self {
                surfaces: RefCell::new(surfaces),
                ..Default::default()
            }
        }
    }

    impl WindowSystem for FakeWindowSystem {
        fn surface(&self, window: Window) -> CaptureResult<SourceSurfaceHandle> {
            self.surfaces
                .borrow()
                .iter()
                .find(|s| s.id == window)
                .cloned()
                .ok_or(CaptureError::WindowNotFound(window))
        }

        fn shm_snapshot(
            &self,
            surface: &SourceSurfaceHandle,
            buffer: &mut ShmBuffer,
        ) -> CaptureResult<usize> {
            self.snapshot_calls.set(self.snapshot_calls.get() + 1);
            if let Some(code) = self.snapshot_error.get() {
                return Err(CaptureError::SnapshotRequestFailed {
                    window: surface.id,
                    code,
                });
            }
            buffer.as_mut_slice().fill(surface.id as u8);
            if self.short_reply.get() {
                return Ok(buffer.len() / 2);
            }
            Ok(buffer.len())
        }

        fn redirect(&self, window: Window) -> CaptureResult<()> {
            self.redirected.borrow_mut().push(window);
            Ok(())
        }

        fn unredirect(&self, window: Window) -> CaptureResult<()> {
            self.redirected.borrow_mut().retain(|&w| w != window);
            Ok(())
        }

        fn export_pixmap(&self, surface: &SourceSurfaceHandle) -> CaptureResult<DmaBufFrame> {
            let fd = ShmBuffer::new(0)?.dup_fd()?;
            Ok(DmaBufFrame {
                fd,
                width: surface.geometry.width,
                height: surface.geometry.height,
                stride: surface.geometry.width * 4,
                offset: 0,
                modifier: None,
                depth: surface.depth,
                bits_per_pixel: 32,
            })
        }
    }

    #[test]
    fn test_capture_buffer_size_800x600() {
        let ws = FakeWindowSystem::with(vec![surface(7, 800, 600)]);
        let mut capture = ShmCapture::new().unwrap();

        let handle = ws.surface(7).unwrap();
        let frame = capture.capture(&ws, &handle).unwrap();
        assert_eq!(frame.bytes().len(), 1_920_000);
        assert!(frame.bytes().iter().all(|&b| b == 7), "buffer holds snapshot data");
    }

    #[test]
    fn test_capture_buffer_follows_resize() {
        let ws = FakeWindowSystem::with(vec![surface(1, 640, 480)]);
        let mut capture = ShmCapture::new().unwrap();

        let sizes = [(640, 480), (320, 200), (1280, 1024)];
        for (width, height) in sizes {
            let handle = surface(1, width, height);
            let frame = capture.capture(&ws, &handle).unwrap();
            let expected = (width * height * 4) as usize;
            assert_eq!(frame.bytes().len(), expected, "stale size after resize to {width}x{height}");
            assert_eq!(capture.buffer.len(), expected);
        }
    }

    #[test]
    fn test_unmapped_window_is_not_captured() {
        let ws = FakeWindowSystem::default();
        let mut capture = ShmCapture::new().unwrap();

        let mut handle = surface(3, 100, 100);
        handle.viewable = false;

        let err = capture.capture(&ws, &handle).unwrap_err();
        assert!(matches!(err, CaptureError::SourceNotViewable(3)));
        assert_eq!(ws.snapshot_calls.get(), 0, "no request for unmapped windows");
    }

    #[test]
    fn test_snapshot_error_code_is_surfaced() {
        let ws = FakeWindowSystem::default();
        ws.snapshot_error.set(Some(8));
        let mut capture = ShmCapture::new().unwrap();

        let err = capture.capture(&ws, &surface(5, 10, 10)).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SnapshotRequestFailed { window: 5, code: 8 }
        ));
    }

    #[test]
    fn test_short_reply_is_a_mismatch() {
        let ws = FakeWindowSystem::default();
        ws.short_reply.set(true);
        let mut capture = ShmCapture::new().unwrap();

        let err = capture.capture(&ws, &surface(5, 10, 10)).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::BufferSizeMismatch {
                expected: 400,
                actual: 200
            }
        ));
    }

    #[test]
    fn test_host_frame_rejects_wrong_length() {
        let layout = FrameLayout {
            width: 4,
            height: 4,
            bytes_per_pixel: 4,
        };
        let bytes = vec![0u8; 60];
        assert!(matches!(
            HostFrame::new(&bytes, layout),
            Err(CaptureError::BufferSizeMismatch {
                expected: 64,
                actual: 60
            })
        ));
    }

    #[test]
    fn test_layout_overflow() {
        let layout = FrameLayout {
            width: u32::MAX,
            height: u32::MAX,
            bytes_per_pixel: u32::MAX,
        };
        assert!(matches!(
            layout.byte_len(),
            Err(CaptureError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_zero_copy_requires_redirect() {
        let ws = FakeWindowSystem::with(vec![surface(9, 64, 32)]);
        let mut capture = Dri3Capture::new();
        let handle = ws.surface(9).unwrap();

        let err = capture.capture(&ws, &handle).unwrap_err();
        assert!(matches!(err, CaptureError::NotRedirected(9)));

        capture.redirect(&ws, 9).unwrap();
        let frame = capture.capture(&ws, &handle).unwrap();
        assert_eq!(frame.extent(), Extent::new(64, 32));

        capture.unredirect_all(&ws);
        assert!(ws.redirected.borrow().is_empty());
        assert!(capture.redirected.is_empty());
    }

    #[test]
    fn test_frame_capture_trait_dispatch() {
        let ws = FakeWindowSystem::with(vec![surface(2, 16, 16)]);
        let handle = ws.surface(2).unwrap();

        let mut shm = ShmCapture::new().unwrap();
        assert!(!shm.zero_copy());
        let frame = FrameCapture::capture(&mut shm, &ws, &handle).unwrap();
        assert!(matches!(frame, CapturedFrame::Host(_)));
        assert_eq!(frame.extent(), Extent::new(16, 16));

        let mut dri3 = Dri3Capture::new();
        dri3.prepare(&ws, 2).unwrap();
        let frame = FrameCapture::capture(&mut dri3, &ws, &handle).unwrap();
        assert!(matches!(frame, CapturedFrame::Imported(_)));
        dri3.release(&ws);
        assert!(ws.redirected.borrow().is_empty());
    }
}
