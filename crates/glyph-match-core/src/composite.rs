use std::fmt::{Display, Formatter};
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::GlyphError;

/// Per-channel deviation from the naive resize beyond which a recovered
/// colour is discarded.
pub const DEFAULT_RESTORE_THRESHOLD: u8 = 20;

const OPAQUE: u8 = u8::MAX;

/// Linear alpha compositing onto a solid background, truncated to `u8`.
#[must_use]
pub fn flatten(image: &RgbaImage, background: [u8; 3]) -> RgbImage {
    let mut out = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let alpha = u32::from(pixel.0[3]);
        let mut rgb = [0_u8; 3];
        for (channel, value) in rgb.iter_mut().enumerate() {
            let composited = (alpha * u32::from(pixel.0[channel])
                + (255 - alpha) * u32::from(background[channel]))
                / 255;
            *value = u8::try_from(composited).unwrap_or(u8::MAX);
        }
        out.put_pixel(x, y, Rgb(rgb));
    }
    out
}

/// The alpha channel as a grayscale RGB image.
#[must_use]
pub fn alpha_mask(image: &RgbaImage) -> RgbImage {
    let mut out = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        out.put_pixel(x, y, Rgb([pixel.0[3]; 3]));
    }
    out
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreStats {
    pub transparent: u64,
    pub opaque: u64,
    pub decomposited: u64,
    pub fallback: u64,
}

impl RestoreStats {
    pub fn absorb(&mut self, other: &Self) {
        self.transparent += other.transparent;
        self.opaque += other.opaque;
        self.decomposited += other.decomposited;
        self.fallback += other.fallback;
    }
}

/// Puts the source glyph's alpha back onto a super-resolved image that was
/// produced from the glyph flattened onto `background`.
///
/// Semi-transparent pixels are decomposited with
/// `C = (C' - (255 - A) * S / 255) * 255 / A`. A channel that leaves
/// `0..=255` or strays more than `threshold` from the bilinear upscale of the
/// source replaces the whole pixel with that upscale.
#[must_use]
pub fn restore_alpha(
    enlarged: &RgbImage,
    source: &RgbaImage,
    background: [u8; 3],
    threshold: u8,
) -> (RgbaImage, RestoreStats) {
    let (width, height) = enlarged.dimensions();
    let naive = imageops::resize(source, width, height, FilterType::Triangle);
    let mut out = RgbaImage::new(width, height);
    let mut stats = RestoreStats::default();

    for (x, y, pixel) in enlarged.enumerate_pixels() {
        let reference = naive.get_pixel(x, y).0;
        let alpha = reference[3];
        let [r, g, b] = pixel.0;

        let restored = match alpha {
            0 => {
                stats.transparent += 1;
                [r, g, b, 0]
            }
            OPAQUE => {
                stats.opaque += 1;
                [r, g, b, OPAQUE]
            }
            _ => {
                if let Some(rgb) = decomposite(pixel.0, reference, background, threshold) {
                    stats.decomposited += 1;
                    [rgb[0], rgb[1], rgb[2], alpha]
                } else {
                    stats.fallback += 1;
                    [reference[0], reference[1], reference[2], alpha]
                }
            }
        };
        out.put_pixel(x, y, Rgba(restored));
    }
    (out, stats)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn decomposite(
    composited: [u8; 3],
    reference: [u8; 4],
    background: [u8; 3],
    threshold: u8,
) -> Option<[u8; 3]> {
    let mut rgb = [0_u8; 3];
    for (channel, value) in rgb.iter_mut().enumerate() {
        let recovered = unblend(composited[channel], reference[3], background[channel]);
        if !(0.0..=255.0).contains(&recovered) {
            return None;
        }
        if (recovered - f64::from(reference[channel])).abs() > f64::from(threshold) {
            return None;
        }
        *value = recovered as u8;
    }
    Some(rgb)
}

/// Inverts `C' = (A * C + (255 - A) * S) / 255` for one channel, rounded.
fn unblend(composited: u8, alpha: u8, background: u8) -> f64 {
    let alpha = f64::from(alpha);
    let bg_offset = (255.0 - alpha) * f64::from(background) / 255.0;
    ((f64::from(composited) - bg_offset) * 255.0 / alpha).round()
}

/// Attaches a super-resolved alpha mask (its red channel) to an enlarged,
/// flattened image and decomposites the semi-transparent pixels against
/// `background`.
///
/// There is no naive colour to fall back to here, so channels that leave
/// `0..=255` are clamped and the pixel is counted as a fallback.
///
/// # Errors
/// Returns [`GlyphError::Validation`] when the mask and image sizes differ.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn merge_alpha(
    enlarged: &RgbImage,
    mask: &RgbImage,
    background: [u8; 3],
) -> Result<(RgbaImage, RestoreStats), GlyphError> {
    if enlarged.dimensions() != mask.dimensions() {
        return Err(GlyphError::Validation(format!(
            "alpha mask is {:?} but enlarged image is {:?}",
            mask.dimensions(),
            enlarged.dimensions()
        )));
    }

    let mut out = RgbaImage::new(enlarged.width(), enlarged.height());
    let mut stats = RestoreStats::default();
    for (x, y, pixel) in enlarged.enumerate_pixels() {
        let alpha = mask.get_pixel(x, y).0[0];
        let [r, g, b] = pixel.0;
        let merged = match alpha {
            0 => {
                stats.transparent += 1;
                [r, g, b, 0]
            }
            OPAQUE => {
                stats.opaque += 1;
                [r, g, b, OPAQUE]
            }
            _ => {
                let mut rgba = [0, 0, 0, alpha];
                let mut clamped = false;
                for (channel, value) in rgba[..3].iter_mut().enumerate() {
                    let recovered = unblend(pixel.0[channel], alpha, background[channel]);
                    clamped |= !(0.0..=255.0).contains(&recovered);
                    *value = recovered.clamp(0.0, 255.0) as u8;
                }
                if clamped {
                    stats.fallback += 1;
                } else {
                    stats.decomposited += 1;
                }
                rgba
            }
        };
        out.put_pixel(x, y, Rgba(merged));
    }
    Ok((out, stats))
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PixelBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelBox {
    /// # Errors
    /// Returns [`GlyphError::InvalidBox`] when the box is empty.
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Self, GlyphError> {
        if x1 <= x0 || y1 <= y0 {
            return Err(GlyphError::InvalidBox(format!(
                "empty box {x0},{y0},{x1},{y1}"
            )));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

impl Display for PixelBox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.x0, self.y0, self.x1, self.y1)
    }
}

impl FromStr for PixelBox {
    type Err = GlyphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let coords = value
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| GlyphError::InvalidBox(format!("{value}: {err}")))?;
        match coords.as_slice() {
            [x0, y0, x1, y1] => Self::new(*x0, *y0, *x1, *y1),
            _ => Err(GlyphError::InvalidBox(format!(
                "expected x0,y0,x1,y1, got {value}"
            ))),
        }
    }
}

/// Scales a box uniformly. Truncation is an error unless `allow_rounding`,
/// in which case it is rounded down and logged.
///
/// # Errors
/// Returns [`GlyphError::InvalidBox`] for a non-positive scale, a result that
/// needs rounding, or one that collapses to an empty box.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::float_cmp
)]
pub fn scale_box(bounds: PixelBox, scale: f64, allow_rounding: bool) -> Result<PixelBox, GlyphError> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(GlyphError::InvalidBox(format!("invalid scale {scale}")));
    }

    let scaled = [bounds.x0, bounds.y0, bounds.x1, bounds.y1].map(|coord| f64::from(coord) * scale);
    let truncated = scaled.map(|value| value as u32);
    let rounded = scaled
        .iter()
        .zip(truncated)
        .any(|(value, int)| f64::from(int) != *value);
    if rounded {
        if !allow_rounding {
            return Err(GlyphError::InvalidBox(format!(
                "scale={scale} for box={bounds} gives a rounding error: {scaled:?}"
            )));
        }
        tracing::warn!(%bounds, scale, "rounding down occurred while scaling box");
    }

    let [x0, y0, x1, y1] = truncated;
    PixelBox::new(x0, y0, x1, y1)
}

/// # Errors
/// Returns [`GlyphError::InvalidBox`] when the box leaves the image.
pub fn crop(image: &RgbaImage, bounds: PixelBox) -> Result<RgbaImage, GlyphError> {
    if bounds.x1 > image.width() || bounds.y1 > image.height() {
        return Err(GlyphError::InvalidBox(format!(
            "box {bounds} exceeds image {}x{}",
            image.width(),
            image.height()
        )));
    }
    Ok(imageops::crop_imm(image, bounds.x0, bounds.y0, bounds.width(), bounds.height()).to_image())
}

/// Side-by-side view of a source region (nearest-neighbour upscaled) and the
/// matching region of its enlargement.
///
/// # Errors
/// Returns [`GlyphError::InvalidBox`] when the enlargement is not a uniform
/// scale of the source or the box does not fit either image.
#[allow(clippy::cast_precision_loss)]
pub fn subview(
    source: &RgbaImage,
    enlarged: &RgbaImage,
    bounds: PixelBox,
    allow_rounding: bool,
) -> Result<RgbaImage, GlyphError> {
    if source.width() == 0 || source.height() == 0 {
        return Err(GlyphError::InvalidBox("empty source image".to_string()));
    }
    let scale_x = f64::from(enlarged.width()) / f64::from(source.width());
    let scale_y = f64::from(enlarged.height()) / f64::from(source.height());
    if (scale_x - scale_y).abs() > f64::EPSILON {
        return Err(GlyphError::InvalidBox(format!(
            "non-uniform scale {scale_x} x {scale_y}"
        )));
    }

    let enlarged_bounds = scale_box(bounds, scale_x, allow_rounding)?;
    let left = imageops::resize(
        &crop(source, bounds)?,
        enlarged_bounds.width(),
        enlarged_bounds.height(),
        FilterType::Nearest,
    );
    let right = crop(enlarged, enlarged_bounds)?;

    let mut canvas = RgbaImage::new(left.width() + right.width(), left.height().max(right.height()));
    imageops::replace(&mut canvas, &left, 0, 0);
    imageops::replace(&mut canvas, &right, i64::from(left.width()), 0);
    Ok(canvas)
}
