//! Perceptual-hash matching of emoji glyph corpora.
//!
//! The crate is split by concern:
//! - [`hash`]: `imagehash`-compatible average, difference and colour hashes.
//! - [`naming`]: filename conventions of the glyph and reference corpora.
//! - [`codepoint`]: codepoint-string heuristics used before any hashing.
//! - [`matcher`]: the multi-pass join that assigns reference glyphs.
//! - [`background`] and [`composite`]: flatten backgrounds and alpha recovery
//!   for super-resolved glyphs.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub mod background;
pub mod codepoint;
pub mod composite;
pub mod hash;
pub mod matcher;
pub mod naming;

pub use background::{
    analyze_gray_background, choose_rgb_background, semi_visible_colors, GrayBackground,
    RgbBackground, ShadeStat, GRAY_SHADES, RGB_CLOUD_LEVELS,
};
pub use codepoint::{CodepointIndex, CodepointRule};
pub use composite::{
    alpha_mask, crop, flatten, merge_alpha, restore_alpha, scale_box, subview, PixelBox,
    RestoreStats, DEFAULT_RESTORE_THRESHOLD,
};
pub use hash::{
    average_hash, color_hash, difference_hash, hash_file, hash_glyph, luma, thumbnail,
    GlyphHashes, HashConfig, ImageHash,
};
pub use matcher::{
    match_glyphs, pairwise_distances, GlyphHashRow, GlyphMatch, MatchCandidate, MatchMethod,
    MatchOptions, MatchReport, MatchSummary, PairDistance, ReferenceHashRow, TieBreakStage,
};
pub use naming::{list_pngs, Gender, GlyphName, GlyphTraits, ReferenceName, SkinTone};

#[derive(Debug, thiserror::Error)]
pub enum GlyphError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid hash: {0}")]
    InvalidHash(String),
    #[error("hashes are not comparable: {left} bits vs {right} bits")]
    IncomparableHashes { left: usize, right: usize },
    #[error("invalid pixel box: {0}")]
    InvalidBox(String),
    #[error("image error for {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("io error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Formats a timestamp the way every table and report stores it.
///
/// # Errors
/// Returns [`GlyphError::Validation`] if the timestamp cannot be represented
/// as RFC 3339.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GlyphError> {
    value
        .format(&Rfc3339)
        .map_err(|err| GlyphError::Validation(format!("invalid timestamp: {err}")))
}
