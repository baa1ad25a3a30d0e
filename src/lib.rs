//! Hierarchical rubric evaluation and marks aggregation.
//!
//! The engine modules (`rubric`, `scores`, `calc`, `review`) are pure and
//! synchronous. `db` and `ipc` back the `rubricd` sidecar binary.

pub mod calc;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod review;
pub mod rubric;
pub mod scores;

pub use calc::{aggregate, evaluate, EvaluationReport, NodeAggregate};
pub use error::RubricError;
pub use review::{
    review_total, summarize, summarize_outcomes, DuplicateReviewPolicy, EvaluatorRole,
    ReviewOutcome, ReviewRecord, StudentMarksSummary,
};
pub use rubric::{flatten_leaves, LeafNode, Level, RubricNode, RubricNodeSpec, RubricTree};
pub use scores::{resolve_leaf_value, LevelScale, Resolution, ScoreSheet};
