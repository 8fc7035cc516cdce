use std::collections::BTreeSet;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Candidate gray backgrounds, black to white.
pub const GRAY_SHADES: [u8; 8] = [0, 36, 72, 108, 144, 180, 216, 255];

/// Per-channel levels of the 125-colour RGB cloud.
pub const RGB_CLOUD_LEVELS: [u8; 5] = [0, 63, 127, 191, 255];

const WHITE: u8 = 255;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadeStat {
    pub shade: u8,
    /// Some semi-transparent pixel has exactly this gray.
    pub present: bool,
    pub mean_distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrayBackground {
    pub shades: Vec<ShadeStat>,
    pub furthest_shade: Option<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RgbBackground {
    pub rgb: [u8; 3],
    pub min_distance: u32,
    pub max_distance: u32,
    pub mean_distance: u32,
}

/// Unique colours of pixels that are neither transparent nor opaque.
#[must_use]
pub fn semi_visible_colors(image: &RgbaImage) -> Vec<[u8; 3]> {
    image
        .pixels()
        .filter(|pixel| pixel.0[3] > 0 && pixel.0[3] < u8::MAX)
        .map(|pixel| [pixel.0[0], pixel.0[1], pixel.0[2]])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn euclidean(lhs: [u8; 3], rhs: [u8; 3]) -> f64 {
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| (f64::from(*a) - f64::from(b)).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn truncate(value: f64) -> u32 {
    value as u32
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

/// Scores the eight gray shades against the semi-transparent colours.
///
/// The furthest shade is the absent shade with the greatest mean distance,
/// the lighter one on ties.
#[must_use]
pub fn analyze_gray_background(image: &RgbaImage) -> GrayBackground {
    let colors = semi_visible_colors(image);
    if colors.is_empty() {
        return GrayBackground {
            shades: GRAY_SHADES
                .iter()
                .map(|shade| ShadeStat {
                    shade: *shade,
                    present: false,
                    mean_distance: 0,
                })
                .collect(),
            furthest_shade: Some(WHITE),
        };
    }

    let shades = GRAY_SHADES
        .iter()
        .map(|shade| {
            let gray = [*shade; 3];
            let distances = colors
                .iter()
                .map(|color| euclidean(gray, *color))
                .collect::<Vec<_>>();
            ShadeStat {
                shade: *shade,
                present: colors.contains(&gray),
                mean_distance: truncate(mean(&distances)),
            }
        })
        .collect::<Vec<_>>();

    let furthest_shade = shades
        .iter()
        .filter(|stat| !stat.present)
        .fold(None::<&ShadeStat>, |best, stat| match best {
            Some(current) if current.mean_distance > stat.mean_distance => Some(current),
            _ => Some(stat),
        })
        .map(|stat| stat.shade);

    GrayBackground {
        shades,
        furthest_shade,
    }
}

/// Picks the cloud colour furthest from every semi-transparent colour,
/// ranked by `(min, max, mean)` distance with later colours winning ties.
///
/// Returns `None` when every cloud colour coincides with some
/// semi-transparent pixel.
#[must_use]
pub fn choose_rgb_background(image: &RgbaImage) -> Option<RgbBackground> {
    let colors = semi_visible_colors(image);
    if colors.is_empty() {
        return Some(RgbBackground {
            rgb: [WHITE; 3],
            min_distance: 0,
            max_distance: 0,
            mean_distance: 0,
        });
    }

    let key = |bg: &RgbBackground| (bg.min_distance, bg.max_distance, bg.mean_distance);
    let mut best: Option<RgbBackground> = None;
    for r in RGB_CLOUD_LEVELS {
        for g in RGB_CLOUD_LEVELS {
            for b in RGB_CLOUD_LEVELS {
                let candidate = [r, g, b];
                if colors.contains(&candidate) {
                    continue;
                }
                let distances = colors
                    .iter()
                    .map(|color| euclidean(candidate, *color))
                    .collect::<Vec<_>>();

                let scored = RgbBackground {
                    rgb: candidate,
                    min_distance: truncate(distances.iter().copied().fold(f64::MAX, f64::min)),
                    max_distance: truncate(distances.iter().copied().fold(0.0, f64::max)),
                    mean_distance: truncate(mean(&distances)),
                };
                let better = match &best {
                    None => true,
                    Some(current) => key(&scored) >= key(current),
                };
                if better {
                    best = Some(scored);
                }
            }
        }
    }
    best
}
