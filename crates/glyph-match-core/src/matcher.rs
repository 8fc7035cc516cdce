use std::cmp::Ordering;
use std::collections::HashSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codepoint::{CodepointIndex, CodepointRule};
use crate::hash::GlyphHashes;
use crate::naming::GlyphTraits;

/// One row of the glyph corpus as stored in `glyph_hashes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlyphHashRow {
    pub filename: String,
    pub codepoint_part: String,
    pub hashes: GlyphHashes,
}

/// One row of the reference corpus as stored in `reference_hashes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceHashRow {
    pub filename: String,
    pub descriptor: String,
    pub codepoint: String,
    pub hashes: GlyphHashes,
}

impl ReferenceHashRow {
    #[must_use]
    pub fn traits(&self) -> GlyphTraits {
        GlyphTraits::from_reference(&self.codepoint, &self.descriptor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchMethod {
    Codepoint { rule: CodepointRule },
    Hash,
}

impl MatchMethod {
    /// Column value in `top_hash_matches.match_method`.
    #[must_use]
    pub fn as_column(self) -> String {
        match self {
            Self::Codepoint { rule } => format!("codepoint:{}", rule.as_str()),
            Self::Hash => "hash".to_string(),
        }
    }

    #[must_use]
    pub fn parse_column(value: &str) -> Option<Self> {
        if value == "hash" {
            return Some(Self::Hash);
        }
        let rule = value.strip_prefix("codepoint:")?;
        CodepointRule::parse(rule).map(|rule| Self::Codepoint { rule })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakStage {
    /// Skin tone and gender both agree with the glyph.
    Traits,
    /// Only the skin tone agrees.
    SkinTone,
    DifferenceHash,
}

impl TieBreakStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Traits => "traits",
            Self::SkinTone => "skin_tone",
            Self::DifferenceHash => "difference_hash",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "traits" => Some(Self::Traits),
            "skin_tone" => Some(Self::SkinTone),
            "difference_hash" => Some(Self::DifferenceHash),
            _ => None,
        }
    }
}

/// Distances are `None` for codepoint matches, which are never scored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchCandidate {
    pub filename: String,
    pub average_distance: Option<u32>,
    pub color_distance: Option<u32>,
    pub difference_distance: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlyphMatch {
    pub glyph_filename: String,
    pub method: MatchMethod,
    pub candidates: Vec<MatchCandidate>,
    pub tie_break: Vec<TieBreakStage>,
}

impl GlyphMatch {
    #[must_use]
    pub fn is_multimatch(&self) -> bool {
        self.candidates.len() > 1
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MatchOptions {
    /// Narrow hash multimatches by filename traits and difference hash.
    pub tie_break: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { tie_break: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchReport {
    pub matches: Vec<GlyphMatch>,
    /// Reference filenames taken by the codepoint pass, in first-claim order.
    pub codepoint_claimed: Vec<String>,
    pub unmatched: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchSummary {
    pub glyphs: usize,
    pub codepoint_matches: usize,
    pub hash_matches: usize,
    pub multimatches: usize,
    pub tie_broken: usize,
    pub unmatched: usize,
    pub claimed_references: usize,
}

impl MatchReport {
    #[must_use]
    pub fn summary(&self) -> MatchSummary {
        let mut summary = MatchSummary {
            glyphs: self.matches.len() + self.unmatched.len(),
            unmatched: self.unmatched.len(),
            claimed_references: self.codepoint_claimed.len(),
            ..MatchSummary::default()
        };
        for glyph_match in &self.matches {
            match glyph_match.method {
                MatchMethod::Codepoint { .. } => summary.codepoint_matches += 1,
                MatchMethod::Hash => summary.hash_matches += 1,
            }
            if glyph_match.is_multimatch() {
                summary.multimatches += 1;
            }
            if !glyph_match.tie_break.is_empty() {
                summary.tie_broken += 1;
            }
        }
        summary
    }
}

/// Assigns reference glyphs to every glyph in three passes.
///
/// 1. Codepoint heuristics; references hit here are withheld from pass 2.
/// 2. Lexicographic `(average, color)` Hamming distance over the remaining
///    references, keeping every reference that shares the best score.
/// 3. Optional tie-breaking of pass 2 multimatches.
#[must_use]
pub fn match_glyphs(
    glyphs: &[GlyphHashRow],
    references: &[ReferenceHashRow],
    options: &MatchOptions,
) -> MatchReport {
    let index = CodepointIndex::build(references.iter().map(|row| row.codepoint.as_str()));

    let mut codepoint_claimed = Vec::new();
    let mut claimed = HashSet::new();
    let codepoint_hits = glyphs
        .iter()
        .map(|glyph| {
            let (position, rule) = index.lookup(&glyph.codepoint_part)?;
            let reference = &references[position];
            if claimed.insert(reference.filename.as_str()) {
                codepoint_claimed.push(reference.filename.clone());
            }
            Some(GlyphMatch {
                glyph_filename: glyph.filename.clone(),
                method: MatchMethod::Codepoint { rule },
                candidates: vec![MatchCandidate {
                    filename: reference.filename.clone(),
                    average_distance: None,
                    color_distance: None,
                    difference_distance: None,
                }],
                tie_break: Vec::new(),
            })
        })
        .collect::<Vec<_>>();
    tracing::debug!(
        claimed = codepoint_claimed.len(),
        "codepoint pass complete"
    );

    let resolved = glyphs
        .par_iter()
        .zip(codepoint_hits)
        .map(|(glyph, hit)| hit.or_else(|| hash_match(glyph, references, &claimed, options)))
        .collect::<Vec<_>>();

    let mut report = MatchReport {
        codepoint_claimed,
        ..MatchReport::default()
    };
    for (glyph, resolved) in glyphs.iter().zip(resolved) {
        match resolved {
            Some(glyph_match) => report.matches.push(glyph_match),
            None => report.unmatched.push(glyph.filename.clone()),
        }
    }
    report
}

fn hash_match(
    glyph: &GlyphHashRow,
    references: &[ReferenceHashRow],
    claimed: &HashSet<&str>,
    options: &MatchOptions,
) -> Option<GlyphMatch> {
    let mut best: Option<(u32, u32)> = None;
    let mut picks = Vec::new();

    for (position, reference) in references.iter().enumerate() {
        if claimed.contains(reference.filename.as_str()) {
            continue;
        }
        let (Ok(average), Ok(color)) = (
            glyph.hashes.average.distance(&reference.hashes.average),
            glyph.hashes.color.distance(&reference.hashes.color),
        ) else {
            continue;
        };

        let score = (average, color);
        match best.map(|current| score.cmp(&current)) {
            None | Some(Ordering::Less) => {
                best = Some(score);
                picks.clear();
                picks.push(position);
            }
            Some(Ordering::Equal) => picks.push(position),
            Some(Ordering::Greater) => {}
        }
    }

    let (average, color) = best?;
    let outcome = if options.tie_break {
        break_ties(glyph, references, &mut picks)
    } else {
        TieBreakOutcome::default()
    };

    let candidates = picks
        .into_iter()
        .map(|position| MatchCandidate {
            filename: references[position].filename.clone(),
            average_distance: Some(average),
            color_distance: Some(color),
            difference_distance: outcome.difference_distance(position),
        })
        .collect();

    Some(GlyphMatch {
        glyph_filename: glyph.filename.clone(),
        method: MatchMethod::Hash,
        candidates,
        tie_break: outcome.stages,
    })
}

#[derive(Debug, Default)]
struct TieBreakOutcome {
    stages: Vec<TieBreakStage>,
    /// `(reference position, distance)`; empty unless the difference hash was consulted.
    difference: Vec<(usize, u32)>,
}

impl TieBreakOutcome {
    fn difference_distance(&self, position: usize) -> Option<u32> {
        self.difference
            .iter()
            .find(|(candidate, _)| *candidate == position)
            .map(|(_, distance)| *distance)
    }
}

fn break_ties(
    glyph: &GlyphHashRow,
    references: &[ReferenceHashRow],
    picks: &mut Vec<usize>,
) -> TieBreakOutcome {
    let mut outcome = TieBreakOutcome::default();
    if picks.len() < 2 {
        return outcome;
    }

    let traits = GlyphTraits::from_glyph_part(&glyph.codepoint_part);
    let same_traits = narrowed(picks, |position| references[position].traits() == traits);
    if let Some(kept) = same_traits {
        *picks = kept;
        outcome.stages.push(TieBreakStage::Traits);
    } else if let Some(kept) = narrowed(picks, |position| {
        references[position].traits().skin_tone == traits.skin_tone
    }) {
        *picks = kept;
        outcome.stages.push(TieBreakStage::SkinTone);
    }

    if picks.len() > 1 {
        let distances = picks
            .iter()
            .map(|position| {
                glyph
                    .hashes
                    .difference
                    .distance(&references[*position].hashes.difference)
                    .map(|distance| (*position, distance))
            })
            .collect::<Result<Vec<_>, _>>();
        if let Ok(distances) = distances {
            let closest = distances
                .iter()
                .map(|(_, distance)| *distance)
                .min()
                .unwrap_or_default();
            let kept = distances
                .iter()
                .filter(|(_, distance)| *distance == closest)
                .map(|(position, _)| *position)
                .collect::<Vec<_>>();
            if kept.len() < picks.len() {
                *picks = kept;
                outcome.stages.push(TieBreakStage::DifferenceHash);
            }
            outcome.difference = distances;
        }
    }
    outcome
}

/// The subset satisfying `keep`, if it is non-empty and strictly smaller.
fn narrowed(picks: &[usize], keep: impl Fn(usize) -> bool) -> Option<Vec<usize>> {
    let kept = picks
        .iter()
        .copied()
        .filter(|position| keep(*position))
        .collect::<Vec<_>>();
    (!kept.is_empty() && kept.len() < picks.len()).then_some(kept)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairDistance {
    pub glyph_filename: String,
    pub reference_filename: String,
    pub average: u32,
    pub color: u32,
    pub difference: u32,
}

/// Every glyph/reference pair whose three hashes are comparable, glyphs in
/// filename order.
pub fn pairwise_distances<'a>(
    glyphs: &'a [GlyphHashRow],
    references: &'a [ReferenceHashRow],
) -> impl Iterator<Item = PairDistance> + 'a {
    let mut ordered = glyphs.iter().collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| lhs.filename.cmp(&rhs.filename));

    ordered.into_iter().flat_map(move |glyph| {
        references.iter().filter_map(move |reference| {
            Some(PairDistance {
                glyph_filename: glyph.filename.clone(),
                reference_filename: reference.filename.clone(),
                average: glyph.hashes.average.distance(&reference.hashes.average).ok()?,
                color: glyph.hashes.color.distance(&reference.hashes.color).ok()?,
                difference: glyph
                    .hashes
                    .difference
                    .distance(&reference.hashes.difference)
                    .ok()?,
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ImageHash;
    use crate::GlyphError;

    fn must<T>(result: Result<T, GlyphError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn hashes(average: &str, color: &str, difference: &str) -> GlyphHashes {
        GlyphHashes {
            average: must(ImageHash::from_hex(average)),
            color: must(ImageHash::from_hex(color)),
            difference: must(ImageHash::from_hex(difference)),
        }
    }

    fn glyph(filename: &str, average: &str, color: &str, difference: &str) -> GlyphHashRow {
        let codepoint_part = filename
            .trim_start_matches("glyph-")
            .trim_end_matches(".png")
            .to_string();
        GlyphHashRow {
            filename: filename.to_string(),
            codepoint_part,
            hashes: hashes(average, color, difference),
        }
    }

    fn reference(filename: &str, average: &str, color: &str, difference: &str) -> ReferenceHashRow {
        let stem = filename.trim_end_matches(".png");
        let (descriptor, codepoint) = stem.split_once('_').unwrap_or((stem, ""));
        ReferenceHashRow {
            filename: filename.to_string(),
            descriptor: descriptor.to_string(),
            codepoint: codepoint.to_string(),
            hashes: hashes(average, color, difference),
        }
    }

    fn candidate_names(glyph_match: &GlyphMatch) -> Vec<&str> {
        glyph_match
            .candidates
            .iter()
            .map(|candidate| candidate.filename.as_str())
            .collect()
    }

    #[test]
    fn codepoint_pass_claims_references_before_hashing() {
        let glyphs = vec![
            glyph("glyph-u1F600.png", "00", "00", "00"),
            glyph("glyph-u1F601.png", "00", "00", "00"),
        ];
        let references = vec![
            reference("grinning-face_1f600.png", "00", "00", "00"),
            reference("beaming-face_1f602.png", "01", "00", "00"),
        ];

        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        assert_eq!(report.codepoint_claimed, vec!["grinning-face_1f600.png"]);
        assert_eq!(report.matches.len(), 2);
        assert_eq!(
            report.matches[0].method,
            MatchMethod::Codepoint {
                rule: CodepointRule::Plain
            }
        );
        assert_eq!(report.matches[0].candidates[0].average_distance, None);

        // The exact hash twin was claimed, so the second glyph falls to the next best.
        assert_eq!(report.matches[1].method, MatchMethod::Hash);
        assert_eq!(candidate_names(&report.matches[1]), vec!["beaming-face_1f602.png"]);
        assert_eq!(report.matches[1].candidates[0].average_distance, Some(1));
    }

    #[test]
    fn hash_pass_orders_lexicographically_and_keeps_ties() {
        let glyphs = vec![glyph("glyph-hidden.png", "00", "00", "00")];
        let references = vec![
            reference("a_x1.png", "03", "00", "00"),
            reference("b_x2.png", "01", "07", "00"),
            reference("c_x3.png", "01", "03", "00"),
            reference("d_x4.png", "06", "00", "00"),
            reference("e_x5.png", "01", "03", "00"),
        ];

        let options = MatchOptions { tie_break: false };
        let report = match_glyphs(&glyphs, &references, &options);
        let glyph_match = &report.matches[0];
        assert!(glyph_match.is_multimatch());
        assert_eq!(candidate_names(glyph_match), vec!["c_x3.png", "e_x5.png"]);
        assert_eq!(glyph_match.candidates[0].average_distance, Some(1));
        assert_eq!(glyph_match.candidates[0].color_distance, Some(2));
    }

    #[test]
    fn incomparable_references_are_skipped_and_can_leave_glyph_unmatched() {
        let glyphs = vec![
            glyph("glyph-one.png", "00", "00", "00"),
            glyph("glyph-two.png", "0000", "00", "00"),
        ];
        let references = vec![reference("a_x.png", "00", "000", "00")];

        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        assert!(report.matches.is_empty());
        assert_eq!(report.unmatched, vec!["glyph-one.png", "glyph-two.png"]);
        assert_eq!(report.summary().unmatched, 2);
    }

    #[test]
    fn tie_break_prefers_matching_skin_tone_and_gender() {
        let glyphs = vec![glyph("glyph-u1F46E.3.W.png", "00", "00", "00")];
        let references = vec![
            reference("police-officer-medium-skin-tone_1f46e-1f3fd.png", "01", "00", "00"),
            reference(
                "woman-police-officer-medium-skin-tone_1f46e-1f3fd-200d-2640-fe0f.png",
                "01",
                "00",
                "00",
            ),
            reference(
                "woman-police-officer-dark-skin-tone_1f46e-1f3ff-200d-2640-fe0f.png",
                "01",
                "00",
                "00",
            ),
        ];

        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        let glyph_match = &report.matches[0];
        assert_eq!(
            candidate_names(glyph_match),
            vec!["woman-police-officer-medium-skin-tone_1f46e-1f3fd-200d-2640-fe0f.png"]
        );
        assert_eq!(glyph_match.tie_break, vec![TieBreakStage::Traits]);
        assert!(!glyph_match.is_multimatch());
    }

    #[test]
    fn tie_break_falls_back_to_skin_tone_then_difference_hash() {
        let glyphs = vec![glyph("glyph-u1F44B.5.png", "00", "00", "00")];
        let references = vec![
            reference("waving-hand-dark-skin-tone_1f44b-1f3ff.png", "01", "00", "0f"),
            reference("man-waving-dark-skin-tone_1f44b-1f3ff-200d-2642.png", "01", "00", "01"),
            reference("woman-waving-dark-skin-tone_1f44b-1f3ff-200d-2640.png", "01", "00", "03"),
            reference("waving-hand-light-skin-tone_1f44b-1f3fb.png", "01", "00", "00"),
        ];

        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        let glyph_match = &report.matches[0];
        // Exact trait agreement (dark tone, no gender) singles out the first.
        assert_eq!(
            candidate_names(glyph_match),
            vec!["waving-hand-dark-skin-tone_1f44b-1f3ff.png"]
        );
        assert_eq!(glyph_match.tie_break, vec![TieBreakStage::Traits]);

        let glyphs = vec![glyph("glyph-u1F44B.5.M.png", "00", "00", "00")];
        let references = vec![
            reference("a-dark-skin-tone_1f44b-1f3ff.png", "01", "00", "0f"),
            reference("b-dark-skin-tone_1f44b-1f3ff.png", "01", "00", "01"),
            reference("c-light-skin-tone_1f44b-1f3fb.png", "01", "00", "00"),
        ];
        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        let glyph_match = &report.matches[0];
        assert_eq!(
            candidate_names(glyph_match),
            vec!["b-dark-skin-tone_1f44b-1f3ff.png"]
        );
        assert_eq!(
            glyph_match.tie_break,
            vec![TieBreakStage::SkinTone, TieBreakStage::DifferenceHash]
        );
    }

    #[test]
    fn disabled_tie_break_keeps_raw_multimatch() {
        let glyphs = vec![glyph("glyph-u1F44B.5.png", "00", "00", "00")];
        let references = vec![
            reference("waving-hand-dark-skin-tone_1f44b-1f3ff.png", "01", "00", "00"),
            reference("waving-hand-light-skin-tone_1f44b-1f3fb.png", "01", "00", "00"),
        ];
        let report = match_glyphs(&glyphs, &references, &MatchOptions { tie_break: false });
        assert_eq!(report.matches[0].candidates.len(), 2);
        assert!(report.matches[0].tie_break.is_empty());
        assert_eq!(report.summary().multimatches, 1);
    }

    #[test]
    fn difference_distance_is_only_reported_when_consulted() {
        let glyphs = vec![glyph("glyph-blob.png", "00", "00", "00")];
        let references = vec![reference("a_x1.png", "00", "00", "ff")];
        for options in [MatchOptions { tie_break: false }, MatchOptions::default()] {
            let report = match_glyphs(&glyphs, &references, &options);
            assert_eq!(report.matches[0].candidates[0].difference_distance, None);
        }

        let references = vec![
            reference("a_x1.png", "01", "00", "0f"),
            reference("b_x2.png", "01", "00", "01"),
        ];
        let report = match_glyphs(&glyphs, &references, &MatchOptions { tie_break: false });
        assert!(report.matches[0]
            .candidates
            .iter()
            .all(|candidate| candidate.difference_distance.is_none()));

        let report = match_glyphs(&glyphs, &references, &MatchOptions::default());
        let glyph_match = &report.matches[0];
        assert_eq!(candidate_names(glyph_match), vec!["b_x2.png"]);
        assert_eq!(glyph_match.candidates[0].difference_distance, Some(1));
        assert_eq!(glyph_match.tie_break, vec![TieBreakStage::DifferenceHash]);
    }

    #[test]
    fn match_method_column_round_trips() {
        for method in [
            MatchMethod::Hash,
            MatchMethod::Codepoint {
                rule: CodepointRule::JoinedDefaultVariant,
            },
        ] {
            assert_eq!(MatchMethod::parse_column(&method.as_column()), Some(method));
        }
        assert_eq!(MatchMethod::parse_column("codepoint:bogus"), None);
    }

    #[test]
    fn pairwise_distances_sort_glyphs_and_skip_incomparable_pairs() {
        let glyphs = vec![
            glyph("glyph-b.png", "ff", "00", "00"),
            glyph("glyph-a.png", "0f", "00", "00"),
        ];
        let references = vec![
            reference("x_1.png", "00", "00", "00"),
            reference("y_2.png", "00", "0000", "00"),
        ];
        let pairs = pairwise_distances(&glyphs, &references).collect::<Vec<_>>();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].glyph_filename, "glyph-a.png");
        assert_eq!(pairs[0].average, 4);
        assert_eq!(pairs[1].glyph_filename, "glyph-b.png");
        assert_eq!(pairs[1].average, 8);
    }
}
