use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// String heuristics that line a glyph's `codepoint_part` up with a
/// reference codepoint, in the order they are tried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodepointRule {
    /// `u1F469_u1F52C` vs `1f469-1f52c`.
    Plain,
    /// Default skin-tone variant: `u1F44D.0` vs `1f44d`, dropping a trailing `-fe0f`.
    DefaultVariant,
    /// Underscores stand for a zero width joiner: `u1F469_u1F52C` vs `1f469-200d-1f52c`.
    Joined,
    JoinedDefaultVariant,
}

impl CodepointRule {
    pub const ALL: [Self; 4] = [
        Self::Plain,
        Self::DefaultVariant,
        Self::Joined,
        Self::JoinedDefaultVariant,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::DefaultVariant => "default_variant",
            Self::Joined => "joined",
            Self::JoinedDefaultVariant => "joined_default_variant",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(Self::Plain),
            "default_variant" => Some(Self::DefaultVariant),
            "joined" => Some(Self::Joined),
            "joined_default_variant" => Some(Self::JoinedDefaultVariant),
            _ => None,
        }
    }

    fn joins_with_zwj(self) -> bool {
        matches!(self, Self::Joined | Self::JoinedDefaultVariant)
    }

    fn uses_default_variant(self) -> bool {
        matches!(self, Self::DefaultVariant | Self::JoinedDefaultVariant)
    }

    /// Glyph side of the comparison. The `u` strip is case sensitive and
    /// runs before lowercasing.
    #[must_use]
    pub fn glyph_key(self, codepoint_part: &str) -> String {
        let separator = if self.joins_with_zwj() { "-200d-" } else { "-" };
        codepoint_part
            .replace("_u", separator)
            .replace('u', "")
            .to_lowercase()
    }

    /// Reference side of the comparison.
    #[must_use]
    pub fn reference_key(self, codepoint: &str) -> String {
        if self.uses_default_variant() {
            format!("{codepoint}.0").replace("-fe0f.0", ".0")
        } else {
            codepoint.to_string()
        }
    }
}

/// Precomputed reference keys. Each key maps to the first reference (in
/// corpus order) that produces it.
#[derive(Debug, Clone, Default)]
pub struct CodepointIndex {
    plain: HashMap<String, usize>,
    default_variant: HashMap<String, usize>,
}

impl CodepointIndex {
    pub fn build<'a>(codepoints: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = Self::default();
        for (position, codepoint) in codepoints.into_iter().enumerate() {
            index
                .plain
                .entry(CodepointRule::Plain.reference_key(codepoint))
                .or_insert(position);
            index
                .default_variant
                .entry(CodepointRule::DefaultVariant.reference_key(codepoint))
                .or_insert(position);
        }
        index
    }

    /// Position of the matching reference and the rule that found it.
    #[must_use]
    pub fn lookup(&self, codepoint_part: &str) -> Option<(usize, CodepointRule)> {
        CodepointRule::ALL.into_iter().find_map(|rule| {
            let keys = if rule.uses_default_variant() {
                &self.default_variant
            } else {
                &self.plain
            };
            keys.get(&rule.glyph_key(codepoint_part))
                .map(|position| (*position, rule))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty()
    }
}
