use crate::calc::evaluate;
use crate::config::EngineConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_stored_tree, parse_sheet, parse_tree_spec, require_db, require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::review::{summarize, EvaluatorRole, ReviewRecord, StudentMarksSummary};
use crate::rubric::RubricTree;
use crate::scores::ScoreSheet;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

fn handle_reviews_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let review_name = match require_str(&req.params, "reviewName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if req.params.get("scoreSheet").is_none() {
        return err(&req.id, "bad_params", "missing params.scoreSheet", None);
    }
    let sheet = match parse_sheet(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let cfg = &state.config;
    let (role, tree) = match load_stored_tree(conn, review_name, cfg.level_scale()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let report = evaluate(&tree, &sheet, cfg.level_scale());

    let invalid: Vec<&str> = report
        .warnings
        .iter()
        .filter(|w| w.kind.is_invalid())
        .map(|w| w.node_id.as_str())
        .collect();
    if !invalid.is_empty() {
        tracing::warn!(student = %student_id, review = %review_name, "submission has invalid entries");
        return err(
            &req.id,
            "invalid_entries",
            "correct the flagged entries before submitting",
            Some(json!({ "nodeIds": invalid, "warnings": report.warnings })),
        );
    }
    if !report.under_range_node_ids.is_empty() {
        return err(
            &req.id,
            "under_range",
            "one or more components are below zero",
            Some(json!({ "nodeIds": report.under_range_node_ids })),
        );
    }
    if cfg.submit.require_complete && !report.is_complete {
        return err(
            &req.id,
            "incomplete_review",
            "every leaf must be scored before submitting",
            Some(json!({ "unscoredLeafIds": report.unscored_leaf_ids })),
        );
    }
    if !cfg.submit.allow_over_limit && report.over_limit {
        return err(
            &req.id,
            "over_limit",
            "one or more components exceed their maximum marks",
            Some(json!({ "nodeIds": report.over_limit_node_ids })),
        );
    }

    let submission = db::NewSubmission {
        student_id,
        review_name,
        role,
        sheet: &sheet,
        computed_total: report.total,
        max_total: report.max_total,
        is_complete: report.is_complete,
    };
    let outcome = match db::submission_upsert(conn, &submission) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    tracing::info!(
        student = %student_id,
        review = %review_name,
        total = report.total,
        unchanged = outcome.unchanged,
        "review submitted"
    );

    ok(
        &req.id,
        json!({
            "submissionId": outcome.id,
            "unchanged": outcome.unchanged,
            "total": report.total,
            "maxTotal": report.max_total,
            "isComplete": report.is_complete,
            "warnings": report.warnings,
        }),
    )
}

fn handle_reviews_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let stored = match db::submissions_for_student(conn, student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reviews: Vec<serde_json::Value> = stored
        .iter()
        .map(|s| {
            json!({
                "submissionId": s.id,
                "reviewName": s.review_name,
                "evaluatorRole": s.role,
                "total": s.computed_total,
                "maxTotal": s.max_total,
                "isComplete": s.is_complete,
                "submittedAt": s.submitted_at,
                "scoreSheet": s.sheet,
            })
        })
        .collect();
    ok(&req.id, json!({ "studentId": student_id, "reviews": reviews }))
}

/// Trees and sheets gathered before records borrow them.
struct RecordSource {
    review_name: String,
    role: EvaluatorRole,
    sheet: ScoreSheet,
}

fn fold_sources(
    sources: &[RecordSource],
    trees: &HashMap<String, RubricTree>,
    cfg: &EngineConfig,
) -> Result<StudentMarksSummary, HandlerErr> {
    let mut records = Vec::with_capacity(sources.len());
    for s in sources {
        let tree = trees.get(&s.review_name).ok_or_else(|| {
            HandlerErr::new("not_found", "no rubric registered for review")
                .with_details(json!({ "reviewName": s.review_name }))
        })?;
        records.push(ReviewRecord::new(
            s.review_name.clone(),
            s.role,
            tree,
            s.sheet.clone(),
        ));
    }
    Ok(summarize(
        &records,
        cfg.duplicate_review_policy,
        cfg.level_scale(),
    ))
}

/// Recomputes a student's totals from their stored sheets against the
/// rubrics currently registered.
fn student_summary(
    conn: &Connection,
    cfg: &EngineConfig,
    student_id: &str,
) -> Result<StudentMarksSummary, HandlerErr> {
    let stored = db::submissions_for_student(conn, student_id).map_err(HandlerErr::db)?;
    let mut trees: HashMap<String, RubricTree> = HashMap::new();
    let mut sources = Vec::with_capacity(stored.len());
    for s in stored {
        if !trees.contains_key(&s.review_name) {
            let (_, tree) = load_stored_tree(conn, &s.review_name, cfg.level_scale())?;
            trees.insert(s.review_name.clone(), tree);
        }
        sources.push(RecordSource {
            review_name: s.review_name,
            role: s.role,
            sheet: s.sheet,
        });
    }
    fold_sources(&sources, &trees, cfg)
}

/// Inline records: `{reviewName, evaluatorRole?, tree?, scoreSheet}`. Role
/// and tree fall back to the registered rubric for the review name.
fn inline_summary(
    state: &AppState,
    raw_records: &[serde_json::Value],
) -> Result<StudentMarksSummary, HandlerErr> {
    let cfg = &state.config;
    let scale = cfg.level_scale();
    let mut trees: HashMap<String, RubricTree> = HashMap::new();
    let mut sources = Vec::with_capacity(raw_records.len());

    for (i, raw) in raw_records.iter().enumerate() {
        let review_name = require_str(raw, "reviewName")
            .map_err(|e| e.with_details(json!({ "record": i })))?
            .to_string();
        let sheet = parse_sheet(raw)?;

        let mut role = match raw.get("evaluatorRole").and_then(|v| v.as_str()) {
            Some(r) => Some(EvaluatorRole::parse(r).ok_or_else(|| {
                HandlerErr::new("bad_params", "evaluatorRole must be one of: guide, panel")
                    .with_details(json!({ "record": i, "evaluatorRole": r }))
            })?),
            None => None,
        };

        if let Some(raw_tree) = raw.get("tree").filter(|v| !v.is_null()) {
            let tree = RubricTree::load(&parse_tree_spec(raw_tree)?, scale)?;
            // Records under one review name share a single tree.
            match trees.get(&review_name) {
                Some(existing) if *existing != tree => {
                    return Err(HandlerErr::new(
                        "bad_params",
                        "records for the same review must use the same tree",
                    )
                    .with_details(json!({ "record": i, "reviewName": review_name })));
                }
                Some(_) => {}
                None => {
                    trees.insert(review_name.clone(), tree);
                }
            }
        } else if !trees.contains_key(&review_name) || role.is_none() {
            let conn = require_db(state)?;
            let (stored_role, tree) = load_stored_tree(conn, &review_name, scale)?;
            trees.entry(review_name.clone()).or_insert(tree);
            role = role.or(Some(stored_role));
        }

        let Some(role) = role else {
            return Err(HandlerErr::new("bad_params", "missing evaluatorRole")
                .with_details(json!({ "record": i })));
        };
        sources.push(RecordSource {
            review_name,
            role,
            sheet,
        });
    }
    fold_sources(&sources, &trees, cfg)
}

fn handle_marks_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(records) = req.params.get("records") {
        let Some(raw_records) = records.as_array() else {
            return err(&req.id, "bad_params", "records must be an array", None);
        };
        return match inline_summary(state, raw_records) {
            Ok(summary) => ok(&req.id, json!({ "summary": summary })),
            Err(e) => e.response(&req.id),
        };
    }

    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match student_summary(conn, &state.config, student_id) {
        Ok(summary) => ok(
            &req.id,
            json!({ "studentId": student_id, "summary": summary }),
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_marks_summary_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_ids = match db::submission_students(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // One student's unscorable review must not hide everyone else's marks.
    let mut students = Vec::with_capacity(student_ids.len());
    for student_id in &student_ids {
        match student_summary(conn, &state.config, student_id) {
            Ok(summary) => students.push(json!({ "studentId": student_id, "summary": summary })),
            Err(e) => {
                tracing::warn!(student = %student_id, code = e.code, "summary failed");
                students.push(json!({
                    "studentId": student_id,
                    "error": {
                        "code": e.code,
                        "message": e.message,
                        "details": e.details,
                    },
                }));
            }
        }
    }
    ok(&req.id, json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reviews.submit" => Some(handle_reviews_submit(state, req)),
        "reviews.list" => Some(handle_reviews_list(state, req)),
        "marks.summary" => Some(handle_marks_summary(state, req)),
        "marks.summaryList" => Some(handle_marks_summary_list(state, req)),
        _ => None,
    }
}
