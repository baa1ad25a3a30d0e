use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rubric::{Level, LeafNode, RubricTree};

/// Discrete levels are graded on `0..=DEFAULT_LEVEL_SCALE_MAX` regardless of
/// the leaf's own mark range.
pub const DEFAULT_LEVEL_SCALE_MAX: f64 = 5.0;

/// The level scale in force. Level scores are converted to marks exactly
/// once, during aggregation, through `to_mark`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelScale(f64);

impl LevelScale {
    pub fn new(max: f64) -> Option<Self> {
        if max.is_finite() && max > 0.0 {
            Some(Self(max))
        } else {
            None
        }
    }

    pub fn max(self) -> f64 {
        self.0
    }

    /// `score / scale * max_marks`, multiplied first so whole-number
    /// inputs stay exact.
    pub fn to_mark(self, score: f64, max_marks: f64) -> f64 {
        score * max_marks / self.0
    }

    pub fn to_score(self, mark: f64, max_marks: f64) -> f64 {
        if max_marks <= 0.0 {
            return 0.0;
        }
        mark * self.0 / max_marks
    }
}

impl Default for LevelScale {
    fn default() -> Self {
        Self(DEFAULT_LEVEL_SCALE_MAX)
    }
}

/// Entered raw values for one student under one review, keyed by leaf id.
/// A missing key means "not yet scored". Over the wire a `null` value also
/// means "not yet scored".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<f64>>",
    into = "BTreeMap<String, f64>"
)]
pub struct ScoreSheet {
    entries: BTreeMap<String, f64>,
}

impl From<BTreeMap<String, Option<f64>>> for ScoreSheet {
    fn from(raw: BTreeMap<String, Option<f64>>) -> Self {
        Self {
            entries: raw
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect(),
        }
    }
}

impl From<ScoreSheet> for BTreeMap<String, f64> {
    fn from(sheet: ScoreSheet) -> Self {
        sheet.entries
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ScoreSheet {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ScoreSheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, leaf_id: &str) -> Option<f64> {
        self.entries.get(leaf_id).copied()
    }

    /// Records the literal value; returns the previous entry, if any.
    pub fn set(&mut self, leaf_id: impl Into<String>, value: f64) -> Option<f64> {
        self.entries.insert(leaf_id.into(), value)
    }

    pub fn clear(&mut self, leaf_id: &str) -> Option<f64> {
        self.entries.remove(leaf_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryIssue {
    UnknownLevel,
    /// Free entry below zero. Counted as entered, like an over-limit mark.
    NegativeValue,
    NonFiniteValue,
    UnknownNode,
}

impl EntryIssue {
    /// The entry could not be resolved and contributes nothing.
    pub fn is_invalid(self) -> bool {
        matches!(self, Self::UnknownLevel | Self::NonFiniteValue)
    }
}

/// A per-field problem with entered data. Never fatal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryWarning {
    pub node_id: String,
    pub kind: EntryIssue,
    pub raw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Unscored,
    /// The literal entry: a level score for discrete leaves, a mark otherwise.
    Scored(f64),
    Invalid { raw: f64, issue: EntryIssue },
}

impl Resolution {
    pub fn is_scored(self) -> bool {
        matches!(self, Self::Scored(_))
    }

    pub fn state(self) -> &'static str {
        match self {
            Self::Unscored => "unscored",
            Self::Scored(_) => "scored",
            Self::Invalid { .. } => "invalid",
        }
    }
}

pub fn resolve_leaf_value(leaf: &LeafNode, sheet: &ScoreSheet) -> Resolution {
    let Some(raw) = sheet.get(&leaf.meta.id) else {
        return Resolution::Unscored;
    };
    if !raw.is_finite() {
        return Resolution::Invalid {
            raw,
            issue: EntryIssue::NonFiniteValue,
        };
    }
    match &leaf.levels {
        Some(_) if leaf.level_for(raw).is_none() => Resolution::Invalid {
            raw,
            issue: EntryIssue::UnknownLevel,
        },
        _ => Resolution::Scored(raw),
    }
}

/// A resolved free entry below zero. It still counts at its literal value.
pub fn is_under_range(leaf: &LeafNode, resolution: Resolution) -> bool {
    match resolution {
        Resolution::Scored(raw) => !leaf.uses_levels() && raw < 0.0,
        _ => false,
    }
}

/// Mark contributed by a leaf. Invalid and unscored entries contribute 0.
pub fn leaf_mark(leaf: &LeafNode, resolution: Resolution, scale: LevelScale) -> f64 {
    match resolution {
        Resolution::Scored(raw) if leaf.uses_levels() => scale.to_mark(raw, leaf.meta.max_marks),
        Resolution::Scored(raw) => raw,
        Resolution::Unscored | Resolution::Invalid { .. } => 0.0,
    }
}

/// Sheet keys that do not name a leaf of `tree`. They never count.
pub fn stray_entries(tree: &RubricTree, sheet: &ScoreSheet) -> Vec<EntryWarning> {
    sheet
        .iter()
        .filter(|(id, _)| tree.find_leaf(id).is_none())
        .map(|(id, raw)| EntryWarning {
            node_id: id.to_string(),
            kind: EntryIssue::UnknownNode,
            raw,
        })
        .collect()
}

/// The declared level closest to `mark` once it is mapped onto the level
/// scale. Ties go to the lower score.
pub fn nearest_level(leaf: &LeafNode, mark: f64, scale: LevelScale) -> Option<&Level> {
    let target = scale.to_score(mark, leaf.meta.max_marks);
    let levels = leaf.levels.as_ref()?;
    let mut best: Option<&Level> = None;
    for level in levels {
        let Some(current) = best else {
            best = Some(level);
            continue;
        };
        let d_new = (level.score - target).abs();
        let d_cur = (current.score - target).abs();
        if d_new < d_cur || (d_new == d_cur && level.score < current.score) {
            best = Some(level);
        }
    }
    best
}
