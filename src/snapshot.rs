//! One-off window snapshot to a PNG file

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbaImage;
use rayon::prelude::*;

use crate::linux::{HostFrame, ShmCapture, WindowSystem, X11Session};

/// Convert tightly packed BGRX/BGRA rows to RGBA in place. Depth 24 has no
/// alpha channel, so alpha is forced opaque.
pub fn bgra_to_rgba(pixels: &mut [u8], opaque: bool) {
    pixels.par_chunks_exact_mut(4).for_each(|px| {
        px.swap(0, 2);
        if opaque {
            px[3] = 255;
        }
    });
}

fn to_image(frame: &HostFrame<'_>, depth: u8) -> Result<RgbaImage> {
    let layout = frame.layout();
    if layout.bytes_per_pixel != 4 {
        bail!(
            "cannot convert {} bytes per pixel to RGBA",
            layout.bytes_per_pixel
        );
    }
    let mut pixels = frame.bytes().to_vec();
    bgra_to_rgba(&mut pixels, depth != 32);
    RgbaImage::from_raw(layout.width, layout.height, pixels)
        .context("Snapshot does not match its dimensions")
}

pub fn save_window(x11: &X11Session, window: u32, output: &Path) -> Result<()> {
    let surface = x11
        .surface(window)
        .with_context(|| format!("Failed to query window 0x{window:x}"))?;
    let mut capture = ShmCapture::new().context("Failed to create shm segment")?;
    let frame = capture
        .capture(x11, &surface)
        .with_context(|| format!("Failed to capture window 0x{window:x}"))?;

    let image = to_image(&frame, surface.depth)?;
    image
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    log::info!(
        "saved {}x{} snapshot of window 0x{window:x} to {}",
        image.width(),
        image.height(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux::FrameLayout;

    #[test]
    fn test_bgra_to_rgba() {
        let mut px = vec![10, 20, 30, 0, 1, 2, 3, 128];
        bgra_to_rgba(&mut px, true);
        assert_eq!(px, vec![30, 20, 10, 255, 3, 2, 1, 255]);

        let mut px = vec![10, 20, 30, 64];
        bgra_to_rgba(&mut px, false);
        assert_eq!(px, vec![30, 20, 10, 64], "alpha kept for depth 32");
    }

    #[test]
    fn test_to_image() {
        let bytes = vec![0, 0, 255, 0].repeat(6);
        let layout = FrameLayout {
            width: 3,
            height: 2,
            bytes_per_pixel: 4,
        };
        let frame = HostFrame::new(&bytes, layout).unwrap();
        let image = to_image(&frame, 24).unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_to_image_rejects_16bpp() {
        let bytes = vec![0u8; 8];
        let layout = FrameLayout {
            width: 2,
            height: 2,
            bytes_per_pixel: 2,
        };
        let frame = HostFrame::new(&bytes, layout).unwrap();
        assert!(to_image(&frame, 16).is_err());
    }
}
