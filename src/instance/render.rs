//! Render geometry, native bitmaps and compositing
//!
//! Pixel sizes round up: a page of `p` points at `dpi` becomes
//! `ceil(p * dpi / 72)` pixels, so the whole page always fits.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, RgbaImage};
use tracing::warn;

use crate::error::{PdfiumError, Result};
use crate::memory::{Arena, FsMatrix, FsRectF};
use crate::native::Value;
use crate::types::{Bitmap, ImageFormat, PageSizeInPixels, RenderedPagesPage};

/// `FPDF_ANNOT`: render annotations
const FPDF_ANNOT: i32 = 0x01;
const WHITE: u32 = 0xFFFF_FFFF;
const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Points per inch
pub const POINTS_PER_INCH: f64 = 72.0;

/// Pixel size of a page rendered at `dpi`
pub fn size_for_dpi(width_points: f64, height_points: f64, dpi: u32) -> PageSizeInPixels {
    let dpi = f64::from(dpi);
    PageSizeInPixels {
        width: (width_points * dpi / POINTS_PER_INCH).ceil() as u32,
        height: (height_points * dpi / POINTS_PER_INCH).ceil() as u32,
        points_to_pixel_ratio: dpi / POINTS_PER_INCH,
    }
}

/// Pixel size of a page fitted into a box, keeping its aspect ratio
///
/// Missing or zero sides are derived from the other side. With both sides
/// given the page fits inside the box and the limiting side gets exactly the
/// requested value. Returns `None` when neither side is given.
pub fn size_for_box(
    width_points: f64,
    height_points: f64,
    width: Option<u32>,
    height: Option<u32>,
) -> Option<PageSizeInPixels> {
    let width = width.filter(|w| *w > 0).map(f64::from);
    let height = height.filter(|h| *h > 0).map(f64::from);

    let width_limited = match (width, height) {
        (None, None) => return None,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (Some(w), Some(h)) => w / width_points <= h / height_points,
    };

    let size = match (width_limited, width, height) {
        (true, Some(w), limit) => {
            let derived = (height_points * w / width_points).ceil();
            PageSizeInPixels {
                width: w as u32,
                height: limit.map_or(derived, |h| derived.min(h)) as u32,
                points_to_pixel_ratio: w / width_points,
            }
        }
        (false, limit, Some(h)) => {
            let derived = (width_points * h / height_points).ceil();
            PageSizeInPixels {
                width: limit.map_or(derived, |w| derived.min(w)) as u32,
                height: h as u32,
                points_to_pixel_ratio: h / height_points,
            }
        }
        _ => return None,
    };
    Some(size)
}

/// Vertical stacking of page images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLayout {
    pub width: u32,
    pub height: u32,
    /// Top-left corner of each page
    pub offsets: Vec<(u32, u32)>,
}

/// Stack pages top to bottom, `padding` pixels apart, left aligned
pub fn stack(sizes: &[(u32, u32)], padding: u32) -> StackLayout {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut y = 0u32;
    let mut width = 0u32;
    for (i, (w, h)) in sizes.iter().enumerate() {
        if i > 0 {
            y = y.saturating_add(padding);
        }
        offsets.push((0, y));
        y = y.saturating_add(*h);
        width = width.max(*w);
    }
    StackLayout {
        width,
        height: y,
        offsets,
    }
}

/// Page placements for a finished layout
pub fn placements(sizes: &[PageSizeInPixels], layout: &StackLayout) -> Vec<RenderedPagesPage> {
    sizes
        .iter()
        .zip(&layout.offsets)
        .map(|(size, (x, y))| RenderedPagesPage {
            points_to_pixel_ratio: size.points_to_pixel_ratio,
            width: size.width,
            height: size.height,
            x: *x,
            y: *y,
        })
        .collect()
}

/// Draw every page onto a transparent canvas at its layout offset
pub fn compose(pages: &[Bitmap], layout: &StackLayout) -> Result<Bitmap> {
    let mut canvas = RgbaImage::new(layout.width, layout.height);
    for (page, (x, y)) in pages.iter().zip(&layout.offsets) {
        let image = page
            .to_image()
            .ok_or_else(|| PdfiumError::Image("bitmap buffer does not match its size".into()))?;
        imageops::replace(&mut canvas, &image, i64::from(*x), i64::from(*y));
    }
    Ok(Bitmap::from_image(canvas))
}

/// Encode a bitmap as PNG or JPEG
pub fn encode_image(bitmap: &Bitmap, format: ImageFormat, quality: Option<u8>) -> Result<Vec<u8>> {
    let image = bitmap
        .to_image()
        .ok_or_else(|| PdfiumError::Image("bitmap buffer does not match its size".into()))?;
    let image = DynamicImage::ImageRgba8(image);

    let mut output = Vec::new();
    match format {
        ImageFormat::Png => {
            image.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)?;
        }
        ImageFormat::Jpeg => {
            let quality = quality.unwrap_or(DEFAULT_JPEG_QUALITY).clamp(1, 100);
            JpegEncoder::new_with_quality(&mut output, quality).encode_image(&image.to_rgb8())?;
        }
    }
    Ok(output)
}

fn dimension(value: u32, name: &str) -> Result<i32> {
    i32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| PdfiumError::InvalidArgument(format!("bitmap {name} {value} is out of range")))
}

/// A bitmap owned by the native library, destroyed on drop
struct NativeBitmap<'a> {
    arena: &'a Arena,
    handle: i32,
    width: u32,
    height: u32,
}

impl<'a> NativeBitmap<'a> {
    fn create(arena: &'a Arena, width: u32, height: u32) -> Result<Self> {
        let args = [
            Value::I32(dimension(width, "width")?),
            Value::I32(dimension(height, "height")?),
            Value::I32(1),
        ];
        let handle = arena.call_i32("FPDFBitmap_Create", &args)?;
        if handle == 0 {
            return Err(PdfiumError::Allocation {
                size: u64::from(width) * u64::from(height) * 4,
                reason: "FPDFBitmap_Create returned null".into(),
            });
        }
        let bitmap = Self {
            arena,
            handle,
            width,
            height,
        };
        bitmap.arena.call(
            "FPDFBitmap_FillRect",
            &[
                bitmap.arg(),
                Value::I32(0),
                Value::I32(0),
                Value::I32(width as i32),
                Value::I32(height as i32),
                Value::I32(WHITE as i32),
            ],
        )?;
        Ok(bitmap)
    }

    fn arg(&self) -> Value {
        Value::I32(self.handle)
    }

    /// Copy the BGRA buffer out of linear memory as packed RGBA
    fn read(&self) -> Result<Bitmap> {
        let buffer = self
            .arena
            .call_one("FPDFBitmap_GetBuffer", &[self.arg()])?
            .as_pointer()
            .ok_or_else(|| PdfiumError::native_call("FPDFBitmap_GetBuffer", "expected a pointer"))?;
        let stride = self.arena.call_i32("FPDFBitmap_GetStride", &[self.arg()])?;
        let stride = usize::try_from(stride)
            .map_err(|_| PdfiumError::native_call("FPDFBitmap_GetStride", "negative stride"))?;

        let row_bytes = self.width as usize * 4;
        let raw = self.arena.read(buffer, (stride * self.height as usize) as u64)?;
        let mut pixels = Vec::with_capacity(row_bytes * self.height as usize);
        for row in raw.chunks_exact(stride.max(1)).take(self.height as usize) {
            for bgra in row[..row_bytes.min(row.len())].chunks_exact(4) {
                pixels.extend_from_slice(&[bgra[2], bgra[1], bgra[0], bgra[3]]);
            }
        }

        Ok(Bitmap {
            width: self.width,
            height: self.height,
            pixels,
        })
    }
}

impl Drop for NativeBitmap<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.arena.call("FPDFBitmap_Destroy", &[self.arg()]) {
            warn!(handle = self.handle, error = %e, "failed to destroy native bitmap");
        }
    }
}

/// Render a loaded page into a white `width` × `height` bitmap
pub(crate) fn render_bitmap(arena: &Arena, page: i32, width: u32, height: u32) -> Result<Bitmap> {
    let bitmap = NativeBitmap::create(arena, width, height)?;
    arena.call(
        "FPDF_RenderPageBitmap",
        &[
            bitmap.arg(),
            Value::I32(page),
            Value::I32(0),
            Value::I32(0),
            Value::I32(width as i32),
            Value::I32(height as i32),
            Value::I32(0),
            Value::I32(FPDF_ANNOT),
        ],
    )?;
    bitmap.read()
}

/// Render a loaded page through `matrix`, limited to `clipping`
pub(crate) fn render_bitmap_with_matrix(
    arena: &Arena,
    page: i32,
    width: u32,
    height: u32,
    matrix: &FsMatrix,
    clipping: &FsRectF,
) -> Result<Bitmap> {
    let bitmap = NativeBitmap::create(arena, width, height)?;
    let matrix = arena.encode(Some(matrix))?;
    let clipping = arena.encode(Some(clipping))?;
    arena.call(
        "FPDF_RenderPageBitmapWithMatrix",
        &[
            bitmap.arg(),
            Value::I32(page),
            matrix.arg(),
            clipping.arg(),
            Value::I32(FPDF_ANNOT),
        ],
    )?;
    bitmap.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A4_WIDTH: f64 = 595.2755737304688;
    const A4_HEIGHT: f64 = 841.8897094726562;

    #[test]
    fn test_size_for_dpi() {
        let size = size_for_dpi(A4_WIDTH, A4_HEIGHT, 100);
        assert_eq!((size.width, size.height), (827, 1170));
        assert_eq!(size.points_to_pixel_ratio, 1.3888888888888888);

        let size = size_for_dpi(A4_WIDTH, A4_HEIGHT, 300);
        assert_eq!((size.width, size.height), (2481, 3508));
        assert_eq!(size.points_to_pixel_ratio, 4.166666666666667);
    }

    #[test]
    fn test_size_for_dpi_tracks_points() {
        for dpi in [72u32, 100, 150, 300] {
            let size = size_for_dpi(A4_WIDTH, A4_HEIGHT, dpi);
            let exact = A4_WIDTH * f64::from(dpi) / 72.0;
            assert!((f64::from(size.width) - exact).abs() <= 1.0, "dpi {dpi}");
            assert_eq!(size.points_to_pixel_ratio, f64::from(dpi) / 72.0);
        }
        let letter = size_for_dpi(612.0, 792.0, 72);
        assert_eq!((letter.width, letter.height), (612, 792));
    }

    #[test]
    fn test_size_for_box_width_only() {
        let size = size_for_box(A4_WIDTH, A4_HEIGHT, Some(2000), None).unwrap();
        assert_eq!((size.width, size.height), (2000, 2829));
        assert_eq!(size.points_to_pixel_ratio, 3.3597884547259587);
    }

    #[test]
    fn test_size_for_box_height_only() {
        let size = size_for_box(A4_WIDTH, A4_HEIGHT, None, Some(2000)).unwrap();
        assert_eq!((size.width, size.height), (1415, 2000));
        assert_eq!(size.points_to_pixel_ratio, 2.375608084404265);
    }

    #[test]
    fn test_size_for_box_fits_both() {
        // portrait page in a square box: height limits
        let size = size_for_box(A4_WIDTH, A4_HEIGHT, Some(2000), Some(2000)).unwrap();
        assert_eq!((size.width, size.height), (1415, 2000));

        // wide box: width still limits for a very wide page
        let size = size_for_box(1000.0, 100.0, Some(500), Some(500)).unwrap();
        assert_eq!((size.width, size.height), (500, 50));
    }

    #[test]
    fn test_size_for_box_requires_a_side() {
        assert!(size_for_box(A4_WIDTH, A4_HEIGHT, None, None).is_none());
        assert!(size_for_box(A4_WIDTH, A4_HEIGHT, Some(0), Some(0)).is_none());
    }

    #[test]
    fn test_stack_two_pages() {
        let layout = stack(&[(2481, 3508), (2481, 3508)], 50);
        assert_eq!((layout.width, layout.height), (2481, 7066));
        assert_eq!(layout.offsets, vec![(0, 0), (0, 3558)]);
    }

    #[test]
    fn test_stack_mixed_widths() {
        let layout = stack(&[(100, 10), (300, 20), (200, 30)], 5);
        assert_eq!(layout.width, 300);
        assert_eq!(layout.height, 70);
        assert_eq!(layout.offsets[2], (0, 40));
        assert_eq!(stack(&[], 10), StackLayout { width: 0, height: 0, offsets: vec![] });
    }

    #[test]
    fn test_compose_leaves_gaps_transparent() {
        let red = Bitmap {
            width: 2,
            height: 1,
            pixels: [255, 0, 0, 255].repeat(2),
        };
        let blue = Bitmap {
            width: 1,
            height: 1,
            pixels: vec![0, 0, 255, 255],
        };
        let layout = stack(&[(2, 1), (1, 1)], 1);
        let composite = compose(&[red, blue], &layout).unwrap();
        assert_eq!((composite.width, composite.height), (2, 3));
        assert_eq!(composite.pixel(1, 0), Some([255, 0, 0, 255]));
        assert_eq!(composite.pixel(0, 1), Some([0, 0, 0, 0]));
        assert_eq!(composite.pixel(0, 2), Some([0, 0, 255, 255]));
        assert_eq!(composite.pixel(1, 2), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_encode_png_and_jpeg() {
        let bitmap = Bitmap {
            width: 4,
            height: 4,
            pixels: [10, 20, 30, 255].repeat(16),
        };
        let png = encode_image(&bitmap, ImageFormat::Png, None).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let jpeg = encode_image(&bitmap, ImageFormat::Jpeg, Some(90)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
