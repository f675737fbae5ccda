use crate::store::ScaleMode;
use image::imageops::{self, FilterType};
use image::RgbaImage;

/// A source rectangle clamped into the image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamps a requested source rectangle into an image of the given pixel
/// dimensions. The origin is clamped into the image; a zero or out-of-range
/// extent means "from the origin to the image edge".
pub fn clamp_src_rect(
    src_x: u32,
    src_y: u32,
    src_width: u32,
    src_height: u32,
    pix_width: u32,
    pix_height: u32,
) -> SrcRect {
    let x = src_x.min(pix_width);
    let y = src_y.min(pix_height);
    let width = if src_width == 0 || src_width > pix_width - x {
        pix_width - x
    } else {
        src_width
    };
    let height = if src_height == 0 || src_height > pix_height - y {
        pix_height - y
    } else {
        src_height
    };
    SrcRect { x, y, width, height }
}

/// Computes the cell dimensions of a placement when one or both are left to
/// be inferred (zero).
pub fn infer_geometry(
    cols: u16,
    rows: u16,
    scale_mode: ScaleMode,
    src: SrcRect,
    cw: u16,
    ch: u16,
) -> (u16, u16) {
    if cw == 0 || ch == 0 || src.width == 0 || src.height == 0 {
        return (cols, rows);
    }
    match (cols, rows) {
        (0, 0) => (
            ceil_div(src.width, cw as u32) as u16,
            ceil_div(src.height, ch as u32) as u16,
        ),
        (0, rows) => {
            let cols = if scale_mode == ScaleMode::Contain {
                // Fit the aspect-preserved image into the given height.
                let box_h = rows as u64 * ch as u64;
                let scaled_w = src.width as u64 * box_h / src.height as u64;
                ceil_div64(scaled_w, cw as u64)
            } else {
                ceil_div(src.width, cw as u32) as u16
            };
            (cols, rows)
        }
        (cols, 0) => {
            let rows = if scale_mode == ScaleMode::Contain {
                let box_w = cols as u64 * cw as u64;
                let scaled_h = src.height as u64 * box_w / src.width as u64;
                ceil_div64(scaled_h, ch as u64)
            } else {
                ceil_div(src.height, ch as u32) as u16
            };
            (cols, rows)
        }
        (cols, rows) => (cols, rows),
    }
}

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

fn ceil_div64(a: u64, b: u64) -> u16 {
    ((a + b - 1) / b).min(u16::MAX as u64) as u16
}

/// Composes the scaled raster of a placement: the clamped source rectangle
/// rendered into a `scaled_w x scaled_h` target that starts out fully
/// transparent.
pub fn compose_scaled(
    original: &RgbaImage,
    src: SrcRect,
    scaled_w: u32,
    scaled_h: u32,
    mode: ScaleMode,
) -> RgbaImage {
    let mut target = RgbaImage::new(scaled_w, scaled_h);
    if src.width == 0 || src.height == 0 || scaled_w == 0 || scaled_h == 0 {
        log::warn!("composing a placement from an empty source rectangle");
        return target;
    }

    let mode = match mode {
        ScaleMode::NoneOrContain => {
            if src.width <= scaled_w && src.height <= scaled_h {
                ScaleMode::None
            } else {
                ScaleMode::Contain
            }
        }
        other => other,
    };

    let source = imageops::crop_imm(original, src.x, src.y, src.width, src.height).to_image();
    match mode {
        ScaleMode::None => {
            imageops::replace(&mut target, &source, 0, 0);
        }
        ScaleMode::Fill => {
            let resized = imageops::resize(&source, scaled_w, scaled_h, FilterType::Triangle);
            imageops::replace(&mut target, &resized, 0, 0);
        }
        ScaleMode::Contain | ScaleMode::NoneOrContain => {
            let (dest_x, dest_y, dest_w, dest_h) =
                contain_box(src.width, src.height, scaled_w, scaled_h);
            if dest_w == 0 || dest_h == 0 {
                return target;
            }
            let resized = imageops::resize(&source, dest_w, dest_h, FilterType::Triangle);
            imageops::replace(&mut target, &resized, dest_x as i64, dest_y as i64);
        }
    }
    target
}

/// The aspect-preserving destination box, centered along the loose axis.
fn contain_box(src_w: u32, src_h: u32, scaled_w: u32, scaled_h: u32) -> (u32, u32, u32, u32) {
    if scaled_w as u64 * src_h as u64 > src_w as u64 * scaled_h as u64 {
        // The box is wider than the source: fit to height.
        let dest_h = scaled_h;
        let dest_w = (src_w as u64 * scaled_h as u64 / src_h as u64) as u32;
        ((scaled_w - dest_w) / 2, 0, dest_w, dest_h)
    } else {
        // Otherwise fit to width.
        let dest_w = scaled_w;
        let dest_h = (src_h as u64 * scaled_w as u64 / src_w as u64) as u32;
        (0, (scaled_h - dest_h) / 2, dest_w, dest_h)
    }
}
