//! Geometric stages: resize, crop, rotate, flip, mirror.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use super::PipelineError;
use crate::model::{CropParams, ResizeParams};

/// Angles closer than this to a multiple of 90 degrees are treated as exact
const RIGHT_ANGLE_EPSILON: f64 = 1e-9;

/// Lanczos3 resize to exactly the requested dimensions
pub fn resize(image: &RgbaImage, params: &ResizeParams) -> RgbaImage {
    if image.dimensions() == (params.width, params.height) {
        return image.clone();
    }
    imageops::resize(image, params.width, params.height, FilterType::Lanczos3)
}

/// Cut out the requested rectangle, which must lie inside the image
pub fn crop(image: &RgbaImage, params: &CropParams) -> Result<RgbaImage, PipelineError> {
    let (width, height) = image.dimensions();
    let right = params.x as u64 + params.width as u64;
    let bottom = params.y as u64 + params.height as u64;
    if right > width as u64 || bottom > height as u64 {
        return Err(PipelineError::invalid_params(
            "crop",
            format!(
                "rectangle {}x{}+{}+{} exceeds image bounds {}x{}",
                params.width, params.height, params.x, params.y, width, height
            ),
        ));
    }
    Ok(imageops::crop_imm(image, params.x, params.y, params.width, params.height).to_image())
}

/// Size of the canvas holding `width`x`height` rotated by `degrees`
pub fn rotated_dimensions(width: u32, height: u32, degrees: f64) -> (u32, u32) {
    let radians = degrees.to_radians();
    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
    let w = width as f64 * cos + height as f64 * sin;
    let h = width as f64 * sin + height as f64 * cos;
    // Trim floating point noise before rounding up
    (((w - 1e-6).ceil().max(1.0)) as u32, ((h - 1e-6).ceil().max(1.0)) as u32)
}

/// Rotate counter-clockwise by `degrees`.
///
/// Multiples of 90 are exact pixel permutations. Other angles enlarge the
/// canvas to fit the rotated image; uncovered corners are transparent.
pub fn rotate(image: &RgbaImage, degrees: f64) -> RgbaImage {
    let normalized = degrees.rem_euclid(360.0);
    let quarter_turns = (normalized / 90.0).round();
    if (normalized - quarter_turns * 90.0).abs() < RIGHT_ANGLE_EPSILON {
        return match quarter_turns as u32 % 4 {
            0 => image.clone(),
            1 => imageops::rotate270(image),
            2 => imageops::rotate180(image),
            _ => imageops::rotate90(image),
        };
    }
    rotate_bilinear(image, normalized)
}

fn rotate_bilinear(image: &RgbaImage, degrees: f64) -> RgbaImage {
    let (src_w, src_h) = image.dimensions();
    let (dst_w, dst_h) = rotated_dimensions(src_w, src_h, degrees);

    let radians = degrees.to_radians();
    let (sin, cos) = radians.sin_cos();
    let src_cx = src_w as f64 / 2.0;
    let src_cy = src_h as f64 / 2.0;
    let dst_cx = dst_w as f64 / 2.0;
    let dst_cy = dst_h as f64 / 2.0;

    RgbaImage::from_fn(dst_w, dst_h, |x, y| {
        // Inverse mapping: rotate the destination pixel centre clockwise
        // back into source space (y grows downwards).
        let dx = x as f64 + 0.5 - dst_cx;
        let dy = y as f64 + 0.5 - dst_cy;
        let sx = dx * cos - dy * sin + src_cx - 0.5;
        let sy = dx * sin + dy * cos + src_cy - 0.5;
        sample_bilinear(image, sx, sy)
    })
}

/// Bilinear sample treating everything outside the image as transparent.
/// Colors are interpolated premultiplied so transparent texels do not
/// darken edges.
fn sample_bilinear(image: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let mut acc = [0.0f64; 4];
    let taps = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x0 + 1.0, y0, fx * (1.0 - fy)),
        (x0, y0 + 1.0, (1.0 - fx) * fy),
        (x0 + 1.0, y0 + 1.0, fx * fy),
    ];
    for (tx, ty, weight) in taps {
        if weight == 0.0
            || tx < 0.0
            || ty < 0.0
            || tx >= image.width() as f64
            || ty >= image.height() as f64
        {
            continue;
        }
        let px = image.get_pixel(tx as u32, ty as u32);
        let alpha = px[3] as f64 / 255.0 * weight;
        acc[0] += px[0] as f64 * alpha;
        acc[1] += px[1] as f64 * alpha;
        acc[2] += px[2] as f64 * alpha;
        acc[3] += alpha;
    }

    if acc[3] <= f64::EPSILON {
        return Rgba([0, 0, 0, 0]);
    }
    let channel = |v: f64| (v / acc[3]).round().clamp(0.0, 255.0) as u8;
    Rgba([
        channel(acc[0]),
        channel(acc[1]),
        channel(acc[2]),
        (acc[3] * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

/// Vertical flip (top row becomes bottom row)
pub fn flip(image: &RgbaImage) -> RgbaImage {
    imageops::flip_vertical(image)
}

/// Horizontal flip (left column becomes right column)
pub fn mirror(image: &RgbaImage) -> RgbaImage {
    imageops::flip_horizontal(image)
}
