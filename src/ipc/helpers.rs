use rusqlite::Connection;
use serde_json::json;

use crate::db;
use crate::error::RubricError;
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::review::EvaluatorRole;
use crate::rubric::{RubricNodeSpec, RubricTree};
use crate::scores::{LevelScale, ScoreSheet};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn db(e: anyhow::Error) -> Self {
        Self::new("db_query_failed", format!("{e:#}"))
    }
}

impl From<RubricError> for HandlerErr {
    fn from(e: RubricError) -> Self {
        HandlerErr::new(
            "invalid_tree",
            format!("this review cannot be scored until its rubric is fixed: {e}"),
        )
        .with_details(json!({ "nodeId": e.node_id(), "reason": e.code() }))
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing params.{}", key)))
}

pub fn parse_role(params: &serde_json::Value) -> Result<EvaluatorRole, HandlerErr> {
    let raw = require_str(params, "evaluatorRole")?;
    EvaluatorRole::parse(raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "evaluatorRole must be one of: guide, panel")
            .with_details(json!({ "evaluatorRole": raw }))
    })
}

/// Missing `scoreSheet` means nothing has been entered yet.
pub fn parse_sheet(params: &serde_json::Value) -> Result<ScoreSheet, HandlerErr> {
    match params.get("scoreSheet") {
        None => Ok(ScoreSheet::new()),
        Some(v) if v.is_null() => Ok(ScoreSheet::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::new(
                "bad_params",
                format!("scoreSheet must map leaf ids to numbers or null: {e}"),
            )
        }),
    }
}

pub fn parse_tree_spec(raw: &serde_json::Value) -> Result<RubricNodeSpec, HandlerErr> {
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("malformed rubric tree: {e}")))
}

pub struct ResolvedTree {
    pub review_name: Option<String>,
    pub role: Option<EvaluatorRole>,
    pub tree: RubricTree,
}

pub fn load_stored_tree(
    conn: &Connection,
    review_name: &str,
    scale: LevelScale,
) -> Result<(EvaluatorRole, RubricTree), HandlerErr> {
    let stored = db::rubric_get(conn, review_name)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "no rubric registered for review")
                .with_details(json!({ "reviewName": review_name }))
        })?;
    let tree = RubricTree::load(&stored.spec, scale).map_err(|e| {
        tracing::warn!(review = %review_name, error = %e, "stored rubric is invalid");
        HandlerErr::from(e)
    })?;
    Ok((stored.role, tree))
}

/// An inline `tree` wins over a registered `reviewName`.
pub fn resolve_tree(state: &AppState, params: &serde_json::Value) -> Result<ResolvedTree, HandlerErr> {
    let scale = state.config.level_scale();
    if let Some(raw) = params.get("tree").filter(|v| !v.is_null()) {
        let spec = parse_tree_spec(raw)?;
        return Ok(ResolvedTree {
            review_name: None,
            role: None,
            tree: RubricTree::load(&spec, scale)?,
        });
    }
    if params.get("reviewName").is_none() {
        return Err(HandlerErr::new(
            "bad_params",
            "either params.tree or params.reviewName is required",
        ));
    }
    let review_name = require_str(params, "reviewName")?;
    let conn = require_db(state)?;
    let (role, tree) = load_stored_tree(conn, review_name, scale)?;
    Ok(ResolvedTree {
        review_name: Some(review_name.to_string()),
        role: Some(role),
        tree,
    })
}
