//! Text watermark rendering.
//!
//! Text is drawn in white with alpha `opacity`, its box's top-left corner at
//! `(x, y)`. Anything past the image edge is clipped.

use std::path::Path;

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};

use super::font::{self, CELL_HEIGHT, CELL_WIDTH};
use super::PipelineError;
use crate::model::WatermarkParams;

/// Watermark glyph source
pub enum WatermarkFont {
    /// Built-in 5x7 bitmap font, scaled to the requested size
    Bitmap,
    /// TrueType/OpenType font loaded at startup
    TrueType(FontVec),
}

impl std::fmt::Debug for WatermarkFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkFont::Bitmap => f.write_str("Bitmap"),
            WatermarkFont::TrueType(_) => f.write_str("TrueType"),
        }
    }
}

impl WatermarkFont {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let data = std::fs::read(path).map_err(|e| {
            PipelineError::invalid_params(
                "watermark_font",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        let font = FontVec::try_from_vec(data).map_err(|e| {
            PipelineError::invalid_params(
                "watermark_font",
                format!("{} is not a usable font: {}", path.display(), e),
            )
        })?;
        Ok(WatermarkFont::TrueType(font))
    }

    /// Draw the watermark onto `image` in place
    pub fn draw(&self, image: &mut RgbaImage, params: &WatermarkParams) {
        let alpha = (params.opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
        if alpha == 0 {
            return;
        }
        match self {
            WatermarkFont::Bitmap => draw_bitmap(image, params, alpha),
            WatermarkFont::TrueType(font) => draw_truetype(image, font, params, alpha),
        }
    }
}

fn draw_bitmap(image: &mut RgbaImage, params: &WatermarkParams, alpha: u8) {
    let scale = params.font_size / CELL_HEIGHT as f64;
    let chars: Vec<char> = params.text.chars().collect();
    let box_width = (chars.len() as f64 * CELL_WIDTH as f64 * scale).ceil() as u64;
    let box_height = (CELL_HEIGHT as f64 * scale).ceil() as u64;

    let (width, height) = image.dimensions();
    let x_end = (params.x as u64 + box_width).min(width as u64);
    let y_end = (params.y as u64 + box_height).min(height as u64);

    for py in params.y as u64..y_end {
        let row = ((py - params.y as u64) as f64 / scale) as u32;
        for px in params.x as u64..x_end {
            let gx = ((px - params.x as u64) as f64 / scale) as u32;
            let Some(&c) = chars.get((gx / CELL_WIDTH) as usize) else {
                continue;
            };
            if font::is_set(c, gx % CELL_WIDTH, row) {
                blend_white(image, px as u32, py as u32, alpha);
            }
        }
    }
}

fn draw_truetype(image: &mut RgbaImage, font: &FontVec, params: &WatermarkParams, alpha: u8) {
    let scale = PxScale::from(params.font_size as f32);
    let scaled_font = font.as_scaled(scale);
    let (width, height) = image.dimensions();

    let baseline_y = params.y as f32 + scaled_font.ascent();
    let mut cursor_x = params.x as f32;
    let mut prev_glyph: Option<ab_glyph::GlyphId> = None;

    for c in params.text.chars() {
        let glyph_id = scaled_font.glyph_id(c);
        if let Some(prev) = prev_glyph {
            cursor_x += scaled_font.kern(prev, glyph_id);
        }

        let glyph = glyph_id.with_scale_and_position(scale, ab_glyph::point(cursor_x, baseline_y));
        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                let x = gx as i64 + bounds.min.x as i64;
                let y = gy as i64 + bounds.min.y as i64;
                if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
                    let a = (coverage.clamp(0.0, 1.0) * alpha as f32).round() as u8;
                    if a > 0 {
                        blend_white(image, x as u32, y as u32, a);
                    }
                }
            });
        }

        cursor_x += scaled_font.h_advance(glyph_id);
        prev_glyph = Some(glyph_id);
    }
}

/// Source-over composite of white with the given alpha
fn blend_white(image: &mut RgbaImage, x: u32, y: u32, alpha: u8) {
    let bottom = *image.get_pixel(x, y);
    image.put_pixel(x, y, blend_pixels(bottom, Rgba([255, 255, 255, alpha])));
}

fn blend_pixels(bottom: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    let top_alpha = top[3] as f32 / 255.0;
    let bottom_alpha = bottom[3] as f32 / 255.0;
    let out_alpha = top_alpha + bottom_alpha * (1.0 - top_alpha);
    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let blend = |t: u8, b: u8| -> u8 {
        let result = (t as f32 * top_alpha + b as f32 * bottom_alpha * (1.0 - top_alpha)) / out_alpha;
        result.round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        blend(top[0], bottom[0]),
        blend(top[1], bottom[1]),
        blend(top[2], bottom[2]),
        (out_alpha * 255.0).round() as u8,
    ])
}
