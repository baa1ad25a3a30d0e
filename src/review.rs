use serde::{Deserialize, Serialize};

use crate::calc::{evaluate, round_off_1_decimal};
use crate::rubric::RubricTree;
use crate::scores::{LevelScale, ScoreSheet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorRole {
    Guide,
    Panel,
}

impl EvaluatorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guide => "guide",
            Self::Panel => "panel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guide" => Some(Self::Guide),
            "panel" => Some(Self::Panel),
            _ => None,
        }
    }
}

/// What to do when a student has more than one record under the same
/// review name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicateReviewPolicy {
    /// Every record counts.
    #[default]
    Sum,
    /// Only the last record (in input order) for a name counts.
    LatestWins,
}

/// One student's sheet under one review round. The tree is shared
/// configuration and only borrowed.
#[derive(Debug, Clone)]
pub struct ReviewRecord<'a> {
    pub review_name: String,
    pub role: EvaluatorRole,
    pub tree: &'a RubricTree,
    pub sheet: ScoreSheet,
}

impl<'a> ReviewRecord<'a> {
    pub fn new(
        review_name: impl Into<String>,
        role: EvaluatorRole,
        tree: &'a RubricTree,
        sheet: ScoreSheet,
    ) -> Self {
        Self {
            review_name: review_name.into(),
            role,
            tree,
            sheet,
        }
    }

    pub fn max_total(&self) -> f64 {
        self.tree.max_total()
    }

    pub fn outcome(&self, scale: LevelScale) -> ReviewOutcome {
        let report = evaluate(self.tree, &self.sheet, scale);
        // Stray keys and negative free entries still resolve, so only
        // unresolvable entries count here.
        let invalid_entry_node_ids = report
            .warnings
            .iter()
            .filter(|w| w.kind.is_invalid())
            .map(|w| w.node_id.clone())
            .collect();
        ReviewOutcome {
            review_name: self.review_name.clone(),
            role: self.role,
            total: report.total,
            max_total: report.max_total,
            is_complete: report.is_complete,
            over_limit_node_ids: report.over_limit_node_ids,
            under_range_node_ids: report.under_range_node_ids,
            invalid_entry_node_ids,
        }
    }
}

pub fn review_total(record: &ReviewRecord<'_>, scale: LevelScale) -> f64 {
    record.outcome(scale).total
}

/// Derived view of a record; never stored as the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub review_name: String,
    pub role: EvaluatorRole,
    pub total: f64,
    pub max_total: f64,
    pub is_complete: bool,
    pub over_limit_node_ids: Vec<String>,
    pub under_range_node_ids: Vec<String>,
    pub invalid_entry_node_ids: Vec<String>,
}

impl ReviewOutcome {
    pub fn is_over_limit(&self) -> bool {
        !self.over_limit_node_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewLine {
    pub review_name: String,
    pub role: EvaluatorRole,
    pub total: f64,
    pub max_total: f64,
    pub is_complete: bool,
    /// False when a later record with the same name superseded this one.
    pub counted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMarksSummary {
    pub guide_total: f64,
    pub panel_total: f64,
    pub grand_total: f64,
    pub guide_max_total: f64,
    pub panel_max_total: f64,
    pub grand_max_total: f64,
    /// Rounded to one decimal for display; `None` when nothing is out of.
    pub grand_percent: Option<f64>,
    pub is_complete: bool,
    pub reviews: Vec<ReviewLine>,
}

pub fn summarize(
    records: &[ReviewRecord<'_>],
    policy: DuplicateReviewPolicy,
    scale: LevelScale,
) -> StudentMarksSummary {
    let outcomes: Vec<ReviewOutcome> = records.iter().map(|r| r.outcome(scale)).collect();
    summarize_outcomes(&outcomes, policy)
}

/// Folds already-computed review outcomes. Rounds under the same role are
/// added, never averaged.
pub fn summarize_outcomes(
    outcomes: &[ReviewOutcome],
    policy: DuplicateReviewPolicy,
) -> StudentMarksSummary {
    let mut summary = StudentMarksSummary {
        guide_total: 0.0,
        panel_total: 0.0,
        grand_total: 0.0,
        guide_max_total: 0.0,
        panel_max_total: 0.0,
        grand_max_total: 0.0,
        grand_percent: None,
        is_complete: true,
        reviews: Vec::with_capacity(outcomes.len()),
    };

    for (i, o) in outcomes.iter().enumerate() {
        let counted = match policy {
            DuplicateReviewPolicy::Sum => true,
            DuplicateReviewPolicy::LatestWins => !outcomes[i + 1..]
                .iter()
                .any(|later| later.review_name == o.review_name),
        };
        summary.reviews.push(ReviewLine {
            review_name: o.review_name.clone(),
            role: o.role,
            total: o.total,
            max_total: o.max_total,
            is_complete: o.is_complete,
            counted,
        });
        if !counted {
            continue;
        }
        match o.role {
            EvaluatorRole::Guide => {
                summary.guide_total += o.total;
                summary.guide_max_total += o.max_total;
            }
            EvaluatorRole::Panel => {
                summary.panel_total += o.total;
                summary.panel_max_total += o.max_total;
            }
        }
        summary.is_complete &= o.is_complete;
    }

    summary.grand_total = summary.guide_total + summary.panel_total;
    summary.grand_max_total = summary.guide_max_total + summary.panel_max_total;
    if summary.grand_max_total > 0.0 {
        summary.grand_percent = Some(round_off_1_decimal(
            100.0 * summary.grand_total / summary.grand_max_total,
        ));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, role: EvaluatorRole, total: f64) -> ReviewOutcome {
        ReviewOutcome {
            review_name: name.to_string(),
            role,
            total,
            max_total: 50.0,
            is_complete: true,
            over_limit_node_ids: Vec::new(),
            under_range_node_ids: Vec::new(),
            invalid_entry_node_ids: Vec::new(),
        }
    }

    #[test]
    fn guide_rounds_are_additive() {
        let outcomes = vec![
            outcome("Guide Review 1", EvaluatorRole::Guide, 45.0),
            outcome("Guide Review 2", EvaluatorRole::Guide, 48.0),
            outcome("Panel Review", EvaluatorRole::Panel, 42.0),
        ];
        let s = summarize_outcomes(&outcomes, DuplicateReviewPolicy::Sum);
        assert_eq!(s.guide_total, 93.0);
        assert_eq!(s.panel_total, 42.0);
        assert_eq!(s.grand_total, 135.0);
        assert_eq!(s.grand_max_total, 150.0);
        assert_eq!(s.grand_percent, Some(90.0));
        assert!(s.is_complete);
    }

    #[test]
    fn duplicate_names_sum_by_default() {
        let outcomes = vec![
            outcome("Guide Review 1", EvaluatorRole::Guide, 30.0),
            outcome("Guide Review 1", EvaluatorRole::Guide, 40.0),
        ];
        let s = summarize_outcomes(&outcomes, DuplicateReviewPolicy::default());
        assert_eq!(s.guide_total, 70.0);
        assert!(s.reviews.iter().all(|r| r.counted));
    }

    #[test]
    fn latest_wins_keeps_last_duplicate_only() {
        let outcomes = vec![
            outcome("Guide Review 1", EvaluatorRole::Guide, 30.0),
            outcome("Panel Review", EvaluatorRole::Panel, 20.0),
            outcome("Guide Review 1", EvaluatorRole::Guide, 40.0),
        ];
        let s = summarize_outcomes(&outcomes, DuplicateReviewPolicy::LatestWins);
        assert_eq!(s.guide_total, 40.0);
        assert_eq!(s.grand_total, 60.0);
        assert!(!s.reviews[0].counted);
        assert!(s.reviews[2].counted);
    }

    #[test]
    fn incomplete_round_marks_summary_incomplete() {
        let mut pending = outcome("Panel Review", EvaluatorRole::Panel, 10.0);
        pending.is_complete = false;
        let s = summarize_outcomes(
            &[outcome("Guide Review 1", EvaluatorRole::Guide, 40.0), pending],
            DuplicateReviewPolicy::Sum,
        );
        assert!(!s.is_complete);
        assert_eq!(s.grand_total, 50.0);
    }

    #[test]
    fn no_records_is_an_empty_complete_summary() {
        let s = summarize_outcomes(&[], DuplicateReviewPolicy::Sum);
        assert_eq!(s.grand_total, 0.0);
        assert_eq!(s.grand_percent, None);
        assert!(s.is_complete);
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(EvaluatorRole::parse(" Guide "), Some(EvaluatorRole::Guide));
        assert_eq!(EvaluatorRole::parse("PANEL"), Some(EvaluatorRole::Panel));
        assert_eq!(EvaluatorRole::parse("examiner"), None);
    }
}
