//! X11 connection with the extensions the mirror depends on

use std::ffi::{c_void, CString};

use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::composite::{self, ConnectionExt as _, Redirect};
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::shape::SK;
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat, Pixmap, Screen, Window};
use x11rb::xcb_ffi::XCBConnection;

use crate::error::{CaptureError, CaptureResult};
use crate::linux::capture::{DmaBufFrame, ShmBuffer, WindowSystem};
use crate::linux::window::{self, SourceSurfaceHandle, WindowInfo};

const COMPOSITE_VERSION: (u32, u32) = (0, 4);
const XFIXES_VERSION: (u32, u32) = (2, 0);
const SHM_VERSION: (u32, u32) = (1, 2);
const DRI3_VERSION: (u32, u32) = (1, 0);
/// First DRI3 version able to report format modifiers
const DRI3_MODIFIERS: (u32, u32) = (1, 2);

fn version_at_least(have: (u32, u32), want: (u32, u32)) -> bool {
    have >= want
}

fn require_version(name: &'static str, have: (u32, u32), want: (u32, u32)) -> CaptureResult<()> {
    if version_at_least(have, want) {
        Ok(())
    } else {
        Err(CaptureError::ExtensionUnsupported {
            name,
            major: want.0,
            minor: want.1,
        })
    }
}

fn import_unavailable(window: Window, reason: impl Into<String>) -> CaptureError {
    CaptureError::ImportHandleUnavailable {
        window,
        reason: reason.into(),
    }
}

fn shm_error(request: &'static str, err: ReplyError) -> CaptureError {
    match err {
        ReplyError::X11Error(e) => CaptureError::ShmSegment {
            request,
            code: e.error_code,
        },
        other => other.into(),
    }
}

pub struct X11Session {
    conn: XCBConnection,
    screen_num: usize,
    root: Window,
    dri3: Option<(u32, u32)>,
    overlay: Option<Window>,
}

impl X11Session {
    /// Connect and verify Composite, XFixes and SHM. DRI3 is optional and
    /// only required once zero-copy capture is requested.
    pub fn connect(display: Option<&str>) -> CaptureResult<Self> {
        let display = display
            .map(|name| CString::new(name).map_err(|_| CaptureError::InvalidDisplay(name.into())))
            .transpose()?;
        let (conn, screen_num) = XCBConnection::connect(display.as_deref())?;
        let root = conn.setup().roots[screen_num].root;

        let mut session = Self {
            conn,
            screen_num,
            root,
            dri3: None,
            overlay: None,
        };
        session.check_extensions()?;
        Ok(session)
    }

    fn has_extension(&self, name: &'static str) -> CaptureResult<bool> {
        Ok(self.conn.extension_information(name)?.is_some())
    }

    fn check_extensions(&mut self) -> CaptureResult<()> {
        let unsupported = |name: &'static str, (major, minor): (u32, u32)| CaptureError::ExtensionUnsupported {
            name,
            major,
            minor,
        };

        if !self.has_extension(composite::X11_EXTENSION_NAME)? {
            return Err(unsupported("Composite", COMPOSITE_VERSION));
        }
        let reply = self
            .conn
            .composite_query_version(COMPOSITE_VERSION.0, COMPOSITE_VERSION.1)?
            .reply()?;
        require_version(
            "Composite",
            (reply.major_version, reply.minor_version),
            COMPOSITE_VERSION,
        )?;

        if !self.has_extension(xfixes::X11_EXTENSION_NAME)? {
            return Err(unsupported("XFixes", XFIXES_VERSION));
        }
        let reply = self
            .conn
            .xfixes_query_version(XFIXES_VERSION.0, XFIXES_VERSION.1)?
            .reply()?;
        require_version(
            "XFixes",
            (reply.major_version, reply.minor_version),
            XFIXES_VERSION,
        )?;

        if !self.has_extension(shm::X11_EXTENSION_NAME)? {
            return Err(unsupported("MIT-SHM", SHM_VERSION));
        }
        let reply = self.conn.shm_query_version()?.reply()?;
        require_version(
            "MIT-SHM",
            (reply.major_version as u32, reply.minor_version as u32),
            SHM_VERSION,
        )?;

        if self.has_extension(dri3::X11_EXTENSION_NAME)? {
            let reply = self
                .conn
                .dri3_query_version(DRI3_MODIFIERS.0, DRI3_MODIFIERS.1)?
                .reply()?;
            let version = (reply.major_version, reply.minor_version);
            if version_at_least(version, DRI3_VERSION) {
                self.dri3 = Some(version);
            }
        }

        log::debug!(
            "X11 extensions ok: composite, xfixes, shm; dri3 {:?}",
            self.dri3
        );
        Ok(())
    }

    pub fn connection(&self) -> &XCBConnection {
        &self.conn
    }

    pub fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen_num]
    }

    /// Fail unless DRI3 can export window pixmaps
    pub fn require_dri3(&self) -> CaptureResult<()> {
        match self.dri3 {
            Some(_) => Ok(()),
            None => Err(CaptureError::ExtensionUnsupported {
                name: "DRI3",
                major: DRI3_VERSION.0,
                minor: DRI3_VERSION.1,
            }),
        }
    }

    /// Raw libxcb pointer for creating a Vulkan surface
    pub fn raw_xcb_connection(&self) -> *mut c_void {
        self.conn.get_raw_xcb_connection()
    }

    /// The Composite overlay window, made transparent to input so the
    /// desktop below stays usable.
    pub fn overlay_window(&mut self) -> CaptureResult<Window> {
        if let Some(overlay) = self.overlay {
            return Ok(overlay);
        }

        let overlay = self
            .conn
            .composite_get_overlay_window(self.root)?
            .reply()?
            .overlay_win;
        self.overlay = Some(overlay);

        let region = self.conn.generate_id()?;
        self.conn.xfixes_create_region(region, &[])?;
        self.conn
            .xfixes_set_window_shape_region(overlay, SK::INPUT, 0, 0, region)?;
        self.conn.xfixes_destroy_region(region)?;
        self.conn.flush()?;

        log::info!("using composite overlay window 0x{overlay:x}");
        Ok(overlay)
    }

    pub fn list_windows(&self) -> CaptureResult<Vec<WindowInfo>> {
        window::list_windows(&self.conn, self.root)
    }

    pub fn find_windows_by_class(&self, class: &str) -> CaptureResult<Vec<Window>> {
        window::find_windows_by_class(&self.conn, self.root, class)
    }

    fn export_with_modifier(&self, window: Window, pixmap: Pixmap) -> CaptureResult<DmaBufFrame> {
        let mut reply = self
            .conn
            .dri3_buffers_from_pixmap(pixmap)?
            .reply()
            .map_err(|e| import_unavailable(window, format!("BuffersFromPixmap failed: {e}")))?;

        if reply.buffers.len() != 1 {
            return Err(import_unavailable(
                window,
                format!("{} planes, only single-plane buffers are supported", reply.buffers.len()),
            ));
        }
        let fd = reply
            .buffers
            .pop()
            .ok_or_else(|| import_unavailable(window, "no buffer returned"))?;

        Ok(DmaBufFrame {
            fd,
            width: reply.width as u32,
            height: reply.height as u32,
            stride: reply.strides.first().copied().unwrap_or_default(),
            offset: reply.offsets.first().copied().unwrap_or_default(),
            modifier: Some(reply.modifier),
            depth: reply.depth,
            bits_per_pixel: reply.bpp,
        })
    }

    fn export_linear(&self, window: Window, pixmap: Pixmap) -> CaptureResult<DmaBufFrame> {
        let reply = self
            .conn
            .dri3_buffer_from_pixmap(pixmap)?
            .reply()
            .map_err(|e| import_unavailable(window, format!("BufferFromPixmap failed: {e}")))?;

        Ok(DmaBufFrame {
            fd: reply.pixmap_fd,
            width: reply.width as u32,
            height: reply.height as u32,
            stride: reply.stride as u32,
            offset: 0,
            modifier: None,
            depth: reply.depth,
            bits_per_pixel: reply.bpp,
        })
    }
}

impl WindowSystem for X11Session {
    fn surface(&self, window: Window) -> CaptureResult<SourceSurfaceHandle> {
        window::query_surface(&self.conn, self.root, window)
    }

    fn shm_snapshot(
        &self,
        surface: &SourceSurfaceHandle,
        buffer: &mut ShmBuffer,
    ) -> CaptureResult<usize> {
        let layout = surface.frame_layout();
        let overflow = || CaptureError::BufferOverflow {
            width: layout.width,
            height: layout.height,
            bytes_per_pixel: layout.bytes_per_pixel,
        };
        let width = u16::try_from(layout.width).map_err(|_| overflow())?;
        let height = u16::try_from(layout.height).map_err(|_| overflow())?;

        let seg = self.conn.generate_id()?;
        self.conn
            .shm_attach_fd(seg, buffer.dup_fd()?, false)?
            .check()
            .map_err(|e| shm_error("attach", e))?;

        let image = self
            .conn
            .shm_get_image(
                surface.id,
                0,
                0,
                width,
                height,
                !0,
                ImageFormat::Z_PIXMAP.into(),
                seg,
                0,
            )
            .map_err(CaptureError::from)
            .and_then(|cookie| {
                cookie.reply().map_err(|e| match e {
                    ReplyError::X11Error(x) => CaptureError::SnapshotRequestFailed {
                        window: surface.id,
                        code: x.error_code,
                    },
                    other => other.into(),
                })
            });

        // Detach even when the snapshot failed
        let detached = self
            .conn
            .shm_detach(seg)
            .map_err(CaptureError::from)
            .and_then(|cookie| cookie.check().map_err(|e| shm_error("detach", e)));

        let reply = image?;
        detached?;
        Ok(reply.size as usize)
    }

    fn redirect(&self, window: Window) -> CaptureResult<()> {
        self.conn
            .composite_redirect_window(window, Redirect::AUTOMATIC)?
            .check()?;
        Ok(())
    }

    fn unredirect(&self, window: Window) -> CaptureResult<()> {
        self.conn
            .composite_unredirect_window(window, Redirect::AUTOMATIC)?
            .check()?;
        Ok(())
    }

    fn export_pixmap(&self, surface: &SourceSurfaceHandle) -> CaptureResult<DmaBufFrame> {
        let version = self
            .dri3
            .ok_or_else(|| import_unavailable(surface.id, "DRI3 extension not present"))?;

        let pixmap = self.conn.generate_id()?;
        self.conn
            .composite_name_window_pixmap(surface.id, pixmap)?
            .check()
            .map_err(|e| import_unavailable(surface.id, format!("NameWindowPixmap failed: {e}")))?;

        let frame = if version_at_least(version, DRI3_MODIFIERS) {
            self.export_with_modifier(surface.id, pixmap)
        } else {
            self.export_linear(surface.id, pixmap)
        };

        // The exported fd keeps the buffer alive without the pixmap
        match self.conn.free_pixmap(pixmap) {
            Ok(cookie) => cookie.ignore_error(),
            Err(e) => log::warn!("failed to free pixmap 0x{pixmap:x}: {e}"),
        }
        frame
    }
}

impl Drop for X11Session {
    fn drop(&mut self) {
        if self.overlay.take().is_some() {
            match self.conn.composite_release_overlay_window(self.root) {
                Ok(cookie) => cookie.ignore_error(),
                Err(e) => log::warn!("failed to release the overlay window: {e}"),
            }
            if let Err(e) = self.conn.flush() {
                log::warn!("failed to flush the X connection on teardown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_requirements() {
        assert!(version_at_least((0, 4), COMPOSITE_VERSION));
        assert!(version_at_least((1, 0), COMPOSITE_VERSION));
        assert!(!version_at_least((0, 3), COMPOSITE_VERSION), "0.3 lacks overlay windows");
        assert!(version_at_least((1, 3), DRI3_MODIFIERS));
        assert!(!version_at_least((1, 1), DRI3_MODIFIERS));
    }

    #[test]
    fn test_require_version_reports_wanted_version() {
        let err = require_version("XFixes", (1, 0), XFIXES_VERSION).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ExtensionUnsupported {
                name: "XFixes",
                major: 2,
                minor: 0
            }
        ));
    }

    #[test]
    fn test_shm_error_passes_connection_errors_through() {
        let err = shm_error(
            "attach",
            ReplyError::ConnectionError(x11rb::errors::ConnectionError::UnknownError),
        );
        assert!(matches!(err, CaptureError::Reply(_)));
    }
}
