use thiserror::Error;

/// Rubric configuration problems. These are raised when a tree is loaded and
/// make the affected review unscorable until the configuration is corrected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RubricError {
    #[error("node {node_id} has negative maxMarks ({max_marks})")]
    NegativeMaxMarks { node_id: String, max_marks: f64 },

    #[error("node {node_id} has a non-finite maxMarks")]
    NonFiniteMaxMarks { node_id: String },

    #[error("node id {node_id} appears more than once")]
    DuplicateId { node_id: String },

    #[error("a node under {parent_id} has an empty id")]
    EmptyId { parent_id: String },

    #[error("node {node_id} declares both children and levels")]
    LevelsOnInternal { node_id: String },

    #[error("level {score} on node {node_id} is outside the 0..={scale_max} level scale")]
    LevelOutOfScale {
        node_id: String,
        score: f64,
        scale_max: f64,
    },

    #[error("node {node_id} declares level score {score} more than once")]
    DuplicateLevelScore { node_id: String, score: f64 },
}

impl RubricError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NegativeMaxMarks { .. } => "negative_max_marks",
            Self::NonFiniteMaxMarks { .. } => "non_finite_max_marks",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::EmptyId { .. } => "empty_id",
            Self::LevelsOnInternal { .. } => "levels_on_internal",
            Self::LevelOutOfScale { .. } => "level_out_of_scale",
            Self::DuplicateLevelScore { .. } => "duplicate_level_score",
        }
    }

    /// The node the problem was found on (the parent for `EmptyId`).
    pub fn node_id(&self) -> &str {
        match self {
            Self::NegativeMaxMarks { node_id, .. }
            | Self::NonFiniteMaxMarks { node_id }
            | Self::DuplicateId { node_id }
            | Self::LevelsOnInternal { node_id }
            | Self::LevelOutOfScale { node_id, .. }
            | Self::DuplicateLevelScore { node_id, .. } => node_id,
            Self::EmptyId { parent_id } => parent_id,
        }
    }
}
