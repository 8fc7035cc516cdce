use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, RgbaImage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::GlyphError;

/// Hue bins used by [`color_hash`]; edges follow `linspace(0, 255, 7)`.
const HUE_BINS: usize = 6;
const BLACK_LUMA_BELOW: u8 = 32;
const GRAY_SATURATION_BELOW: u8 = 85;
const FAINT_SATURATION_BELOW: u8 = 170;

/// A perceptual hash stored as row-major bits, most significant bit first.
///
/// The hex form matches Python `imagehash`: the bits are read as one
/// big-endian binary number and zero-padded to `ceil(bits / 4)` digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHash {
    bits: Vec<bool>,
}

impl ImageHash {
    #[must_use]
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Parses a hex string into a hash of `4 * hex.len()` bits.
    ///
    /// # Errors
    /// Returns [`GlyphError::InvalidHash`] for empty input or non-hex digits.
    pub fn from_hex(hex: &str) -> Result<Self, GlyphError> {
        let hex = hex.trim();
        if hex.is_empty() {
            return Err(GlyphError::InvalidHash("empty hex string".to_string()));
        }

        let mut bits = Vec::with_capacity(hex.len() * 4);
        for ch in hex.chars() {
            let nibble = ch
                .to_digit(16)
                .ok_or_else(|| GlyphError::InvalidHash(format!("non-hex digit {ch:?} in {hex}")))?;
            for shift in (0..4).rev() {
                bits.push((nibble >> shift) & 1 == 1);
            }
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let width = self.bits.len().div_ceil(4);
        let padding = width * 4 - self.bits.len();
        let padded = std::iter::repeat(false)
            .take(padding)
            .chain(self.bits.iter().copied())
            .collect::<Vec<_>>();

        padded
            .chunks(4)
            .map(|nibble| {
                let value = nibble
                    .iter()
                    .fold(0_u32, |acc, bit| (acc << 1) | u32::from(*bit));
                char::from_digit(value, 16).unwrap_or('0')
            })
            .collect()
    }

    #[must_use]
    pub fn is_comparable(&self, other: &Self) -> bool {
        self.bits.len() == other.bits.len()
    }

    /// Hamming distance between two hashes of the same shape.
    ///
    /// # Errors
    /// Returns [`GlyphError::IncomparableHashes`] when the bit lengths differ.
    pub fn distance(&self, other: &Self) -> Result<u32, GlyphError> {
        if !self.is_comparable(other) {
            return Err(GlyphError::IncomparableHashes {
                left: self.bits.len(),
                right: other.bits.len(),
            });
        }
        let differing = self
            .bits
            .iter()
            .zip(&other.bits)
            .filter(|(lhs, rhs)| lhs != rhs)
            .count();
        u32::try_from(differing)
            .map_err(|_| GlyphError::InvalidHash(format!("hash too long: {differing} bits")))
    }
}

impl Display for ImageHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ImageHash {
    type Err = GlyphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_hex(value)
    }
}

impl Serialize for ImageHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ImageHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HashConfig {
    /// Side of the square thumbnail every hash is computed from.
    pub resize: u32,
    pub hash_size: u32,
    pub color_bits: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            resize: 32,
            hash_size: 16,
            color_bits: 12,
        }
    }
}

impl HashConfig {
    /// # Errors
    /// Returns [`GlyphError::Validation`] for zero sizes or an unsupported
    /// colour bit width.
    pub fn validate(&self) -> Result<(), GlyphError> {
        if self.resize == 0 {
            return Err(GlyphError::Validation("resize must be > 0".to_string()));
        }
        if self.hash_size < 2 {
            return Err(GlyphError::Validation("hash_size must be >= 2".to_string()));
        }
        if !(1..=32).contains(&self.color_bits) {
            return Err(GlyphError::Validation(
                "color_bits must be between 1 and 32".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlyphHashes {
    pub average: ImageHash,
    pub color: ImageHash,
    pub difference: ImageHash,
}

/// Luma with PIL's fixed-point ITU-R 601-2 weights. Alpha is ignored.
#[must_use]
pub fn luma(image: &RgbaImage) -> GrayImage {
    let mut gray = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        gray.put_pixel(x, y, Luma([luma_value(r, g, b)]));
    }
    gray
}

fn luma_value(r: u8, g: u8, b: u8) -> u8 {
    let weighted = u32::from(r) * 19_595 + u32::from(g) * 38_470 + u32::from(b) * 7_471 + 0x8000;
    u8::try_from(weighted >> 16).unwrap_or(u8::MAX)
}

/// Hue and saturation on a 0..=255 scale, truncated the way PIL's HSV mode is.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hue_saturation(r: u8, g: u8, b: u8) -> (u8, u8) {
    let maxc = r.max(g).max(b);
    let minc = r.min(g).min(b);
    if maxc == minc {
        return (0, 0);
    }

    let cr = f32::from(maxc - minc);
    let s = cr / f32::from(maxc);
    let rc = f32::from(maxc - r) / cr;
    let gc = f32::from(maxc - g) / cr;
    let bc = f32::from(maxc - b) / cr;
    let h = if r == maxc {
        bc - gc
    } else if g == maxc {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    let h = (h / 6.0 + 1.0) % 1.0;

    let clip = |value: f32| ((value * 255.0) as i32).clamp(0, 255) as u8;
    (clip(h), clip(s))
}

fn hue_bin(hue: u8) -> usize {
    (usize::from(hue) * 2 / 85).min(HUE_BINS - 1)
}

/// Mean-threshold hash over an `n x n` Lanczos thumbnail.
#[must_use]
pub fn average_hash(gray: &GrayImage, hash_size: u32) -> ImageHash {
    let small = imageops::resize(gray, hash_size, hash_size, FilterType::Lanczos3);
    let values = small.pixels().map(|p| f64::from(p.0[0])).collect::<Vec<_>>();
    #[allow(clippy::cast_precision_loss)]
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    ImageHash::from_bits(values.iter().map(|value| *value > mean).collect())
}

/// Gradient hash: a bit is set where the right neighbour is strictly brighter.
#[must_use]
pub fn difference_hash(gray: &GrayImage, hash_size: u32) -> ImageHash {
    let small = imageops::resize(gray, hash_size + 1, hash_size, FilterType::Lanczos3);
    let mut bits = Vec::with_capacity((hash_size * hash_size) as usize);
    for y in 0..hash_size {
        for x in 0..hash_size {
            let left = small.get_pixel(x, y).0[0];
            let right = small.get_pixel(x + 1, y).0[0];
            bits.push(right > left);
        }
    }
    ImageHash::from_bits(bits)
}

/// Colour-distribution hash: 14 values of `binbits` bits each.
///
/// The values are the black fraction, the gray fraction, then six faint-hue
/// and six bright-hue bins relative to the coloured pixel count.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn color_hash(image: &RgbaImage, binbits: u32) -> ImageHash {
    let total = (u64::from(image.width()) * u64::from(image.height())).max(1) as f64;
    let mut black = 0_u64;
    let mut gray = 0_u64;
    let mut colored = 0_u64;
    let mut faint = [0_u64; HUE_BINS];
    let mut bright = [0_u64; HUE_BINS];

    for pixel in image.pixels() {
        let [r, g, b, _] = pixel.0;
        if luma_value(r, g, b) < BLACK_LUMA_BELOW {
            black += 1;
            continue;
        }
        let (hue, saturation) = hue_saturation(r, g, b);
        if saturation < GRAY_SATURATION_BELOW {
            gray += 1;
            continue;
        }
        colored += 1;
        if saturation < FAINT_SATURATION_BELOW {
            faint[hue_bin(hue)] += 1;
        } else if saturation > FAINT_SATURATION_BELOW {
            bright[hue_bin(hue)] += 1;
        }
    }

    let max_value = 1_u64 << binbits;
    let cap = |value: u64| value.min(max_value - 1);
    let colored = colored.max(1) as f64;

    let mut values = Vec::with_capacity(2 + 2 * HUE_BINS);
    values.push(cap((black as f64 / total * max_value as f64) as u64));
    values.push(cap((gray as f64 / total * max_value as f64) as u64));
    for count in faint.iter().chain(bright.iter()) {
        values.push(cap(((count * max_value) as f64 / colored) as u64));
    }

    let mut bits = Vec::with_capacity(values.len() * binbits as usize);
    for value in values {
        for i in 0..binbits {
            let shifted = value >> (binbits - i - 1);
            bits.push(shifted % (1_u64 << (binbits - i)) > 0);
        }
    }
    ImageHash::from_bits(bits)
}

/// Catmull-Rom thumbnail resampled on premultiplied alpha, as PIL resizes
/// RGBA. An image already at the target size is returned unchanged.
#[must_use]
pub fn thumbnail(image: &DynamicImage, size: u32) -> RgbaImage {
    let rgba = image.to_rgba8();
    if rgba.dimensions() == (size, size) {
        return rgba;
    }
    let mut premultiplied = rgba;
    for pixel in premultiplied.pixels_mut() {
        let alpha = u32::from(pixel.0[3]);
        for channel in &mut pixel.0[..3] {
            *channel = mul_div_255(u32::from(*channel), alpha);
        }
    }

    let mut resized = imageops::resize(&premultiplied, size, size, FilterType::CatmullRom);
    for pixel in resized.pixels_mut() {
        let alpha = u32::from(pixel.0[3]);
        if alpha == 0 || alpha == 255 {
            continue;
        }
        for channel in &mut pixel.0[..3] {
            *channel = u8::try_from(u32::from(*channel) * 255 / alpha).unwrap_or(u8::MAX);
        }
    }
    resized
}

/// PIL's rounded `a * b / 255`.
fn mul_div_255(a: u32, b: u32) -> u8 {
    let tmp = a * b + 128;
    u8::try_from(((tmp >> 8) + tmp) >> 8).unwrap_or(u8::MAX)
}

/// Thumbnails the glyph and computes all three hashes.
#[must_use]
pub fn hash_glyph(image: &DynamicImage, config: &HashConfig) -> GlyphHashes {
    let mini = thumbnail(image, config.resize);
    let gray = luma(&mini);
    GlyphHashes {
        average: average_hash(&gray, config.hash_size),
        color: color_hash(&mini, config.color_bits),
        difference: difference_hash(&gray, config.hash_size),
    }
}

/// # Errors
/// Returns [`GlyphError::Validation`] for an invalid config and
/// [`GlyphError::Image`] when the file cannot be decoded.
pub fn hash_file(path: &Path, config: &HashConfig) -> Result<GlyphHashes, GlyphError> {
    config.validate()?;
    let image = image::open(path).map_err(|source| GlyphError::Image {
        path: path.display().to_string(),
        source,
    })?;
    Ok(hash_glyph(&image, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, GlyphError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(rgba))
    }

    #[test]
    fn hex_is_zero_padded_and_msb_first() {
        let hash = ImageHash::from_bits(vec![true, false, true, true, false, true]);
        assert_eq!(hash.to_hex(), "2d");

        let hash = ImageHash::from_bits(vec![true, false, true, true]);
        assert_eq!(hash.to_string(), "b");
    }

    #[test]
    fn from_hex_expands_four_bits_per_digit() {
        let hash = must(ImageHash::from_hex("a0"));
        assert_eq!(
            hash.bits(),
            &[true, false, true, false, false, false, false, false]
        );
        assert_eq!(hash.to_hex(), "a0");
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            ImageHash::from_hex("xyz"),
            Err(GlyphError::InvalidHash(_))
        ));
        assert!(matches!(
            ImageHash::from_hex("  "),
            Err(GlyphError::InvalidHash(_))
        ));
    }

    #[test]
    fn distance_counts_differing_bits() {
        let lhs = must(ImageHash::from_hex("ff00"));
        let rhs = must(ImageHash::from_hex("f0f0"));
        assert_eq!(must(lhs.distance(&rhs)), 8);
        assert_eq!(must(lhs.distance(&lhs)), 0);
    }

    #[test]
    fn distance_rejects_different_shapes() {
        let lhs = must(ImageHash::from_hex("ff"));
        let rhs = must(ImageHash::from_hex("fff"));
        assert!(!lhs.is_comparable(&rhs));
        assert!(matches!(
            lhs.distance(&rhs),
            Err(GlyphError::IncomparableHashes { left: 8, right: 12 })
        ));
    }

    #[test]
    fn serde_uses_hex_strings() {
        let hash = must(ImageHash::from_hex("0f3c"));
        let encoded = match serde_json::to_string(&hash) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(encoded, "\"0f3c\"");
    }

    #[test]
    fn luma_matches_pil_weights() {
        let gray = luma(&solid(1, 1, [255, 0, 0, 255]));
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        let gray = luma(&solid(1, 1, [0, 255, 0, 0]));
        assert_eq!(gray.get_pixel(0, 0).0[0], 150);
    }

    #[test]
    fn pil_hsv_for_red_and_gray() {
        assert_eq!(hue_saturation(255, 0, 0), (0, 255));
        assert_eq!(hue_saturation(128, 0, 0), (0, 255));
        assert_eq!(hue_saturation(90, 90, 90), (0, 0));
    }

    #[test]
    fn color_hash_lengths_match_database_columns() {
        let hash = color_hash(&solid(32, 32, [10, 200, 30, 255]), 12);
        assert_eq!(hash.len(), 168);
        assert_eq!(hash.to_hex().len(), 42);
    }

    #[test]
    fn color_hash_of_black_sets_first_bin_only() {
        let hash = color_hash(&solid(32, 32, [0, 0, 0, 255]), 12);
        assert_eq!(hash.to_hex(), format!("fff{}", "0".repeat(39)));
    }

    #[test]
    fn color_hash_of_white_sets_gray_bin() {
        let hash = color_hash(&solid(32, 32, [255, 255, 255, 255]), 12);
        assert_eq!(hash.to_hex(), format!("000fff{}", "0".repeat(36)));
    }

    #[test]
    fn color_hash_of_red_sets_first_bright_hue_bin() {
        let hash = color_hash(&solid(32, 32, [255, 0, 0, 255]), 12);
        assert_eq!(
            hash.to_hex(),
            format!("{}fff{}", "0".repeat(24), "0".repeat(15))
        );
    }

    #[test]
    fn average_hash_of_uniform_image_is_all_zero() {
        let gray = luma(&solid(32, 32, [120, 120, 120, 255]));
        let hash = average_hash(&gray, 16);
        assert_eq!(hash.to_hex(), "0".repeat(64));
    }

    #[test]
    fn average_hash_splits_dark_and_bright_halves() {
        let mut image = solid(32, 32, [0, 0, 0, 255]);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            if x >= 16 {
                *pixel = Rgba([255, 255, 255, 255]);
            }
        }
        let hash = average_hash(&luma(&image), 16);
        assert_eq!(hash.to_hex(), "00ff".repeat(16));
    }

    #[test]
    fn difference_hash_sees_a_rising_edge_in_every_row() {
        let flat = difference_hash(&luma(&solid(34, 32, [80, 80, 80, 255])), 16);
        assert!(flat.bits().iter().all(|bit| !bit));

        let mut image = solid(34, 32, [0, 0, 0, 255]);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            if x >= 17 {
                *pixel = Rgba([255, 255, 255, 255]);
            }
        }
        let hash = difference_hash(&luma(&image), 16);
        for row in hash.bits().chunks(16) {
            assert!(row.iter().any(|bit| *bit));
        }
    }

    #[test]
    fn hash_glyph_uses_configured_sizes() {
        let image = DynamicImage::ImageRgba8(solid(64, 48, [200, 40, 40, 255]));
        let hashes = hash_glyph(&image, &HashConfig::default());
        assert_eq!(hashes.average.to_hex().len(), 64);
        assert_eq!(hashes.difference.to_hex().len(), 64);
        assert_eq!(hashes.color.to_hex().len(), 42);
    }

    #[test]
    fn thumbnail_drops_colour_of_transparent_pixels() {
        let image = DynamicImage::ImageRgba8(solid(64, 64, [255, 255, 255, 0]));
        let mini = thumbnail(&image, 32);
        assert!(mini.pixels().all(|pixel| pixel.0 == [0, 0, 0, 0]));
        let hashes = hash_glyph(&image, &HashConfig::default());
        assert_eq!(hashes.color.to_hex(), format!("fff{}", "0".repeat(39)));
    }

    #[test]
    fn thumbnail_keeps_images_already_at_target_size() {
        let image = DynamicImage::ImageRgba8(solid(32, 32, [255, 255, 255, 0]));
        assert_eq!(thumbnail(&image, 32), solid(32, 32, [255, 255, 255, 0]));
        let hashes = hash_glyph(&image, &HashConfig::default());
        assert_eq!(hashes.color.to_hex(), format!("000fff{}", "0".repeat(36)));
    }

    #[test]
    fn thumbnail_preserves_opaque_and_half_transparent_colour() {
        let image = DynamicImage::ImageRgba8(solid(64, 64, [200, 100, 50, 255]));
        assert!(thumbnail(&image, 32)
            .pixels()
            .all(|pixel| pixel.0 == [200, 100, 50, 255]));

        let image = DynamicImage::ImageRgba8(solid(64, 64, [200, 100, 50, 128]));
        for pixel in thumbnail(&image, 32).pixels() {
            let [r, g, b, a] = pixel.0;
            assert_eq!(a, 128);
            assert!(r.abs_diff(200) <= 2 && g.abs_diff(100) <= 2 && b.abs_diff(50) <= 2);
        }
    }

    #[test]
    fn config_validation_rejects_bad_sizes() {
        let config = HashConfig {
            color_bits: 0,
            ..HashConfig::default()
        };
        assert!(config.validate().is_err());
        let config = HashConfig {
            resize: 0,
            ..HashConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(HashConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn distance_is_a_symmetric_metric(
            a in proptest::collection::vec(any::<bool>(), 64),
            b in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let a = ImageHash::from_bits(a);
            let b = ImageHash::from_bits(b);
            let ab = must(a.distance(&b));
            prop_assert_eq!(ab, must(b.distance(&a)));
            prop_assert_eq!(must(a.distance(&a)), 0);
            prop_assert!(ab <= 64);
        }

        #[test]
        fn hex_text_parses_back_to_the_same_hash(hex in "[0-9a-f]{1,48}") {
            let hash = must(ImageHash::from_hex(&hex));
            prop_assert_eq!(hash.to_hex(), hex);
        }
    }
}
