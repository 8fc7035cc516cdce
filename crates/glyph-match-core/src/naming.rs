use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::GlyphError;

const GLYPH_PREFIX: &str = "glyph-";
const PNG_SUFFIX: &str = ".png";

const ZWJ: u32 = 0x200D;
const FEMALE_SIGN: u32 = 0x2640;
const MALE_SIGN: u32 = 0x2642;
const SKIN_TONE_FIRST: u32 = 0x1F3FB;
const SKIN_TONE_LAST: u32 = 0x1F3FF;

/// A glyph from the macOS `sbix` strike, named `glyph-<codepoint_part>.png`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlyphName {
    pub filename: String,
    pub codepoint_part: String,
}

impl GlyphName {
    /// # Errors
    /// Returns [`GlyphError::Validation`] when the name lacks the `glyph-`
    /// prefix or the `.png` suffix.
    pub fn parse(filename: &str) -> Result<Self, GlyphError> {
        let codepoint_part = filename
            .strip_prefix(GLYPH_PREFIX)
            .and_then(|rest| rest.strip_suffix(PNG_SUFFIX))
            .filter(|part| !part.is_empty())
            .ok_or_else(|| {
                GlyphError::Validation(format!(
                    "expected glyph-<codepoints>.png, got {filename}"
                ))
            })?;
        Ok(Self {
            filename: filename.to_string(),
            codepoint_part: codepoint_part.to_string(),
        })
    }

    #[must_use]
    pub fn traits(&self) -> GlyphTraits {
        GlyphTraits::from_glyph_part(&self.codepoint_part)
    }
}

/// A reference image named `<descriptor>_<codepoint>.png`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceName {
    pub filename: String,
    pub descriptor: String,
    pub codepoint: String,
}

impl ReferenceName {
    /// # Errors
    /// Returns [`GlyphError::Validation`] when the stem has no underscore.
    pub fn parse(filename: &str) -> Result<Self, GlyphError> {
        let stem = filename.strip_suffix(PNG_SUFFIX).unwrap_or(filename);
        let (descriptor, codepoint) = stem.split_once('_').ok_or_else(|| {
            GlyphError::Validation(format!(
                "expected <descriptor>_<codepoint>.png, got {filename}"
            ))
        })?;
        Ok(Self {
            filename: filename.to_string(),
            descriptor: descriptor.to_string(),
            codepoint: codepoint.to_string(),
        })
    }

    #[must_use]
    pub fn traits(&self) -> GlyphTraits {
        GlyphTraits::from_reference(&self.codepoint, &self.descriptor)
    }
}

/// Fitzpatrick modifiers `U+1F3FB..=U+1F3FF`, light to dark.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SkinTone {
    Light,
    MediumLight,
    Medium,
    MediumDark,
    Dark,
}

impl SkinTone {
    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            1 => Some(Self::Light),
            2 => Some(Self::MediumLight),
            3 => Some(Self::Medium),
            4 => Some(Self::MediumDark),
            5 => Some(Self::Dark),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_modifier(codepoint: u32) -> Option<Self> {
        if (SKIN_TONE_FIRST..=SKIN_TONE_LAST).contains(&codepoint) {
            Self::from_index(codepoint - SKIN_TONE_FIRST + 1)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::MediumLight => "medium_light",
            Self::Medium => "medium",
            Self::MediumDark => "medium_dark",
            Self::Dark => "dark",
        }
    }

    fn from_descriptor(descriptor: &str) -> Option<Self> {
        // Longest phrases first: "light-skin-tone" is a suffix of "medium-light-skin-tone".
        [
            ("medium-light-skin-tone", Self::MediumLight),
            ("medium-dark-skin-tone", Self::MediumDark),
            ("medium-skin-tone", Self::Medium),
            ("light-skin-tone", Self::Light),
            ("dark-skin-tone", Self::Dark),
        ]
        .into_iter()
        .find(|(phrase, _)| descriptor.contains(phrase))
        .map(|(_, tone)| tone)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    fn from_codepoint(codepoint: u32) -> Option<Self> {
        match codepoint {
            FEMALE_SIGN => Some(Self::Female),
            MALE_SIGN => Some(Self::Male),
            _ => None,
        }
    }

    fn from_descriptor(descriptor: &str) -> Option<Self> {
        descriptor.split(['-', ' ']).find_map(|word| match word {
            "woman" | "women" | "female" | "girl" | "lady" => Some(Self::Female),
            "man" | "men" | "male" | "boy" => Some(Self::Male),
            _ => None,
        })
    }
}

/// Variant features read off a filename, used to break ties between
/// otherwise equally close hash matches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GlyphTraits {
    pub skin_tone: Option<SkinTone>,
    pub gender: Option<Gender>,
}

impl GlyphTraits {
    /// Reads `u`-prefixed units such as `u1F46E_u200D_u2640` and dotted
    /// suffixes such as `.3` (tone) or `.W` / `.M` (gender).
    #[must_use]
    pub fn from_glyph_part(codepoint_part: &str) -> Self {
        let mut pieces = codepoint_part.split('.');
        let units = pieces.next().unwrap_or_default();
        let mut traits = Self::from_units(units.split('_').filter_map(|unit| {
            let digits = unit.trim_start_matches(['u', 'U']);
            u32::from_str_radix(digits, 16).ok()
        }));

        for token in pieces {
            match token {
                "M" | "m" => traits.gender = traits.gender.or(Some(Gender::Male)),
                "W" | "w" => traits.gender = traits.gender.or(Some(Gender::Female)),
                digits => {
                    if let Ok(index) = digits.parse::<u32>() {
                        traits.skin_tone = traits.skin_tone.or(SkinTone::from_index(index));
                    }
                }
            }
        }
        traits
    }

    /// Codepoint units win; the descriptor fills whatever they leave open.
    #[must_use]
    pub fn from_reference(codepoint: &str, descriptor: &str) -> Self {
        let mut traits = Self::from_units(
            codepoint
                .split('-')
                .filter_map(|unit| u32::from_str_radix(unit, 16).ok()),
        );
        let descriptor = descriptor.to_ascii_lowercase();
        traits.skin_tone = traits.skin_tone.or(SkinTone::from_descriptor(&descriptor));
        traits.gender = traits.gender.or(Gender::from_descriptor(&descriptor));
        traits
    }

    fn from_units(units: impl Iterator<Item = u32>) -> Self {
        let mut traits = Self::default();
        for unit in units {
            if unit == ZWJ {
                continue;
            }
            if let Some(tone) = SkinTone::from_modifier(unit) {
                traits.skin_tone.get_or_insert(tone);
            }
            if let Some(gender) = Gender::from_codepoint(unit) {
                traits.gender.get_or_insert(gender);
            }
        }
        traits
    }
}

/// Regular `.png` files directly under `dir`, sorted by file name.
///
/// # Errors
/// Returns [`GlyphError::Io`] when the directory cannot be read.
pub fn list_pngs(dir: &Path) -> Result<Vec<PathBuf>, GlyphError> {
    let io_err = |source| GlyphError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut pngs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_png = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if path.is_file() && is_png {
            pngs.push(path);
        }
    }
    pngs.sort();
    Ok(pngs)
}
