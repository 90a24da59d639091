//! Window rectangles and blit region computation

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub origin: Point,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            origin: Point { x, y },
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.origin.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.origin.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Overlapping area of two rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = (self.origin.x as i64).max(other.origin.x as i64);
        let top = (self.origin.y as i64).max(other.origin.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left || bottom <= top {
            return None;
        }

        Some(Rect::new(
            left as i32,
            top as i32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }
}

/// Geometry of a window in root-window coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WindowGeometry {
    pub origin: Point,
    pub width: u32,
    pub height: u32,
    pub border: u32,
}

impl WindowGeometry {
    pub fn rect(&self) -> Rect {
        Rect {
            origin: self.origin,
            width: self.width,
            height: self.height,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// How a source window is placed on the destination surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Scale the whole window to fill the destination
    #[default]
    Stretch,
    /// Draw the window 1:1 at its on-screen position
    Mirror,
}

/// Source and destination rectangles of a single blit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlitRegion {
    pub src: Rect,
    pub dst: Rect,
}

/// Largest area that can be written on the destination image.
///
/// A surface reporting `u32::MAX` has no fixed extent and defers to the
/// swapchain.
pub fn destination_bounds(surface: Extent, swapchain: Extent) -> Extent {
    let pick = |surface: u32, swapchain: u32| {
        if surface == u32::MAX {
            swapchain
        } else {
            surface.min(swapchain)
        }
    };
    Extent::new(
        pick(surface.width, swapchain.width),
        pick(surface.height, swapchain.height),
    )
}

impl BlitRegion {
    /// Compute the blit for one source window against the current
    /// destination extents. Returns `None` when nothing would be visible.
    pub fn compute(
        geometry: &WindowGeometry,
        layout: Layout,
        surface: Extent,
        swapchain: Extent,
    ) -> Option<BlitRegion> {
        let bounds = destination_bounds(surface, swapchain);
        if bounds.is_empty() || geometry.extent().is_empty() {
            return None;
        }

        match layout {
            Layout::Stretch => Some(BlitRegion {
                src: Rect::new(0, 0, geometry.width, geometry.height),
                dst: Rect::new(0, 0, bounds.width, bounds.height),
            }),
            Layout::Mirror => {
                let canvas = Rect::new(0, 0, bounds.width, bounds.height);
                let dst = geometry.rect().intersect(&canvas)?;
                let src = Rect::new(
                    dst.origin.x - geometry.origin.x,
                    dst.origin.y - geometry.origin.y,
                    dst.width,
                    dst.height,
                );
                Some(BlitRegion { src, dst })
            }
        }
    }
}
