//! Color and convolution filters. Alpha is preserved by every filter.

use image::{imageops, RgbaImage};

use crate::model::FilterParams;

/// Apply the enabled filters in their fixed order:
/// grayscale, sepia, blur, sharpen
pub fn apply(image: RgbaImage, filters: &FilterParams) -> RgbaImage {
    let mut image = image;
    if filters.grayscale {
        grayscale(&mut image);
    }
    if filters.sepia {
        sepia(&mut image);
    }
    if let Some(sigma) = filters.blur {
        image = imageops::blur(&image, sigma as f32);
    }
    if let Some(sigma) = filters.sharpen {
        image = imageops::unsharpen(&image, sigma as f32, 0);
    }
    image
}

/// Rec.601 luma
pub fn grayscale(image: &mut RgbaImage) {
    for px in image.pixels_mut() {
        let [r, g, b, _] = px.0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        let luma = luma.min(255) as u8;
        px.0[0] = luma;
        px.0[1] = luma;
        px.0[2] = luma;
    }
}

/// Classic sepia tone matrix, clamped
pub fn sepia(image: &mut RgbaImage) {
    for px in image.pixels_mut() {
        let [r, g, b, _] = px.0;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let tone = |v: f32| v.round().clamp(0.0, 255.0) as u8;
        px.0[0] = tone(0.393 * r + 0.769 * g + 0.189 * b);
        px.0[1] = tone(0.349 * r + 0.686 * g + 0.168 * b);
        px.0[2] = tone(0.272 * r + 0.534 * g + 0.131 * b);
    }
}
