//! X11 window enumeration and per-window queries using EWMH

use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt, Format, GetPropertyReply, MapState, Window,
};
use x11rb::protocol::ErrorKind;

use crate::error::{CaptureError, CaptureResult};
use crate::geometry::{Point, WindowGeometry};
use crate::linux::capture::FrameLayout;

#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub id: u32,
    pub name: String,
    pub class: String,
    pub geometry: WindowGeometry,
    pub viewable: bool,
}

/// Snapshot of what the core needs to know about a source window.
///
/// Re-queried every capture cycle; never cached across cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSurfaceHandle {
    pub id: Window,
    pub geometry: WindowGeometry,
    pub depth: u8,
    pub bytes_per_pixel: u32,
    pub viewable: bool,
    pub class: String,
}

impl SourceSurfaceHandle {
    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout {
            width: self.geometry.width,
            height: self.geometry.height,
            bytes_per_pixel: self.bytes_per_pixel,
        }
    }
}

/// Get or intern an atom
pub(crate) fn get_atom<C: Connection>(conn: &C, name: &str) -> CaptureResult<Atom> {
    let reply = conn.intern_atom(false, name.as_bytes())?.reply()?;
    Ok(reply.atom)
}

/// Get a property value, `None` when it is unset or empty
fn get_property_value<C: Connection>(
    conn: &C,
    window: Window,
    property: Atom,
    prop_type: Atom,
) -> CaptureResult<Option<GetPropertyReply>> {
    let reply = conn
        .get_property(false, window, property, prop_type, 0, u32::MAX)?
        .reply()?;

    if reply.value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(reply))
    }
}

/// Get window name using _NET_WM_NAME or WM_NAME
fn get_window_name<C: Connection>(conn: &C, window: Window) -> CaptureResult<String> {
    let net_wm_name = get_atom(conn, "_NET_WM_NAME")?;
    let utf8_string = get_atom(conn, "UTF8_STRING")?;

    if let Some(reply) = get_property_value(conn, window, net_wm_name, utf8_string)? {
        if let Ok(name) = String::from_utf8(reply.value) {
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }

    let wm_name = get_property_value(
        conn,
        window,
        AtomEnum::WM_NAME.into(),
        AtomEnum::STRING.into(),
    )?;
    Ok(wm_name
        .map(|reply| String::from_utf8_lossy(&reply.value).into_owned())
        .unwrap_or_default())
}

/// WM_CLASS holds two NUL-terminated strings, instance then class. Prefer
/// the class and fall back to the instance.
fn parse_wm_class(value: &[u8]) -> String {
    let mut parts = value.split(|&b| b == 0);
    let instance = parts.next().unwrap_or_default();
    let class = parts.next().unwrap_or_default();

    let picked = if class.is_empty() { instance } else { class };
    String::from_utf8_lossy(picked).into_owned()
}

fn get_wm_class<C: Connection>(conn: &C, window: Window) -> CaptureResult<String> {
    let reply = get_property_value(
        conn,
        window,
        AtomEnum::WM_CLASS.into(),
        AtomEnum::STRING.into(),
    )?;
    Ok(reply.map(|r| parse_wm_class(&r.value)).unwrap_or_default())
}

/// Bytes per pixel the server uses for images of the given depth
pub fn bytes_per_pixel_for_depth(formats: &[Format], depth: u8) -> Option<u32> {
    formats
        .iter()
        .find(|f| f.depth == depth)
        .filter(|f| f.bits_per_pixel > 0 && f.bits_per_pixel % 8 == 0)
        .map(|f| f.bits_per_pixel as u32 / 8)
}

/// Query the current state of a window.
///
/// A destroyed window maps to `WindowNotFound` rather than a raw protocol
/// error so the caller can tell the two apart.
pub fn query_surface<C: Connection>(
    conn: &C,
    root: Window,
    window: Window,
) -> CaptureResult<SourceSurfaceHandle> {
    let attrs = match conn.get_window_attributes(window)?.reply() {
        Ok(attrs) => attrs,
        Err(ReplyError::X11Error(e)) if matches!(e.error_kind, ErrorKind::Window) => {
            return Err(CaptureError::WindowNotFound(window))
        }
        Err(e) => return Err(e.into()),
    };

    let geom = conn.get_geometry(window)?.reply()?;

    // Absolute position of the window's inside corner
    let coords = conn.translate_coordinates(window, root, 0, 0)?.reply()?;

    let bytes_per_pixel = bytes_per_pixel_for_depth(&conn.setup().pixmap_formats, geom.depth)
        .ok_or(CaptureError::UnsupportedDepth(geom.depth))?;

    Ok(SourceSurfaceHandle {
        id: window,
        geometry: WindowGeometry {
            origin: Point {
                x: coords.dst_x as i32,
                y: coords.dst_y as i32,
            },
            width: geom.width as u32,
            height: geom.height as u32,
            border: geom.border_width as u32,
        },
        depth: geom.depth,
        bytes_per_pixel,
        viewable: attrs.map_state == MapState::VIEWABLE,
        class: get_wm_class(conn, window).unwrap_or_default(),
    })
}

/// Top-level windows managed by the window manager (`_NET_CLIENT_LIST`)
pub fn client_windows<C: Connection>(conn: &C, root: Window) -> CaptureResult<Vec<Window>> {
    let net_client_list = get_atom(conn, "_NET_CLIENT_LIST")?;
    let reply = get_property_value(conn, root, net_client_list, AtomEnum::WINDOW.into())?;

    Ok(reply
        .and_then(|r| r.value32().map(|iter| iter.collect()))
        .unwrap_or_default())
}

pub fn list_windows<C: Connection>(conn: &C, root: Window) -> CaptureResult<Vec<WindowInfo>> {
    let mut result = Vec::new();

    for window_id in client_windows(conn, root)? {
        // Windows can disappear between listing and querying
        let surface = match query_surface(conn, root, window_id) {
            Ok(surface) => surface,
            Err(e) => {
                log::debug!("skipping window 0x{window_id:x}: {e}");
                continue;
            }
        };

        result.push(WindowInfo {
            id: window_id,
            name: get_window_name(conn, window_id).unwrap_or_default(),
            class: surface.class,
            geometry: surface.geometry,
            viewable: surface.viewable,
        });
    }

    Ok(result)
}

/// Managed windows whose WM_CLASS matches `class`, ignoring case
pub fn find_windows_by_class<C: Connection>(
    conn: &C,
    root: Window,
    class: &str,
) -> CaptureResult<Vec<Window>> {
    let mut found = Vec::new();
    for window_id in client_windows(conn, root)? {
        let wm_class = get_wm_class(conn, window_id).unwrap_or_default();
        if wm_class.eq_ignore_ascii_case(class) {
            found.push(window_id);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(depth: u8, bits_per_pixel: u8) -> Format {
        Format {
            depth,
            bits_per_pixel,
            scanline_pad: 32,
        }
    }

    #[test]
    fn test_bytes_per_pixel_for_depth() {
        let formats = [format(1, 1), format(24, 32), format(32, 32), format(16, 16)];
        assert_eq!(bytes_per_pixel_for_depth(&formats, 24), Some(4));
        assert_eq!(bytes_per_pixel_for_depth(&formats, 32), Some(4));
        assert_eq!(bytes_per_pixel_for_depth(&formats, 16), Some(2));
        assert_eq!(bytes_per_pixel_for_depth(&formats, 1), None, "sub-byte pixels unsupported");
        assert_eq!(bytes_per_pixel_for_depth(&formats, 8), None);
    }

    #[test]
    fn test_parse_wm_class() {
        assert_eq!(parse_wm_class(b"xterm\0XTerm\0"), "XTerm");
        assert_eq!(parse_wm_class(b"navigator\0\0"), "navigator");
        assert_eq!(parse_wm_class(b""), "");
    }

    #[test]
    fn test_frame_layout_from_handle() {
        let handle = SourceSurfaceHandle {
            id: 0x1a00003,
            geometry: WindowGeometry {
                origin: Point { x: 10, y: 20 },
                width: 800,
                height: 600,
                border: 1,
            },
            depth: 24,
            bytes_per_pixel: 4,
            viewable: true,
            class: "XTerm".to_string(),
        };
        let layout = handle.frame_layout();
        assert_eq!(layout.byte_len().unwrap(), 1_920_000);
    }
}
