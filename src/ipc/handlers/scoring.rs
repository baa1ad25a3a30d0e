use crate::calc::evaluate;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{parse_sheet, require_str, resolve_tree, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::rubric::{LeafNode, RubricNode, RubricTree};
use crate::scores::{leaf_mark, nearest_level, resolve_leaf_value, Resolution};
use serde_json::json;

fn find_leaf<'a>(tree: &'a RubricTree, leaf_id: &str) -> Result<&'a LeafNode, HandlerErr> {
    match tree.find(leaf_id) {
        Some(RubricNode::Leaf(leaf)) => Ok(leaf),
        Some(RubricNode::Internal(_)) => Err(HandlerErr::new(
            "bad_params",
            "node has children and is never scored directly",
        )
        .with_details(json!({ "leafId": leaf_id }))),
        None => Err(HandlerErr::new("not_found", "no such node in rubric")
            .with_details(json!({ "leafId": leaf_id }))),
    }
}

fn handle_scores_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resolved = match resolve_tree(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let leaf_id = match require_str(&req.params, "leafId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let sheet = match parse_sheet(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let leaf = match find_leaf(&resolved.tree, leaf_id) {
        Ok(l) => l,
        Err(e) => return e.response(&req.id),
    };

    let scale = state.config.level_scale();
    let resolution = resolve_leaf_value(leaf, &sheet);
    let mut out = json!({
        "leafId": leaf_id,
        "state": resolution.state(),
        "mark": leaf_mark(leaf, resolution, scale),
        "usesLevels": leaf.uses_levels(),
    });
    match resolution {
        Resolution::Unscored => {}
        Resolution::Scored(raw) => {
            out["raw"] = json!(raw);
            if let Some(level) = leaf.level_for(raw) {
                out["levelLabel"] = json!(level.label);
            }
        }
        Resolution::Invalid { raw, issue } => {
            out["raw"] = json!(raw);
            out["issue"] = json!(issue);
        }
    }
    ok(&req.id, out)
}

fn handle_scores_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resolved = match resolve_tree(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let sheet = match parse_sheet(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let report = evaluate(&resolved.tree, &sheet, state.config.level_scale());
    match serde_json::to_value(&report) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

/// `score` converts a level score to a display mark; `mark` finds the
/// nearest declared level.
fn handle_levels_convert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resolved = match resolve_tree(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let leaf_id = match require_str(&req.params, "leafId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let leaf = match find_leaf(&resolved.tree, leaf_id) {
        Ok(l) => l,
        Err(e) => return e.response(&req.id),
    };
    if !leaf.uses_levels() {
        return err(
            &req.id,
            "bad_params",
            "leaf takes free numeric entry and has no levels",
            Some(json!({ "leafId": leaf_id })),
        );
    }

    let scale = state.config.level_scale();
    if let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) {
        let Some(level) = leaf.level_for(score) else {
            return err(
                &req.id,
                "bad_params",
                "score is not one of the leaf's levels",
                Some(json!({ "leafId": leaf_id, "score": score })),
            );
        };
        return ok(
            &req.id,
            json!({
                "leafId": leaf_id,
                "score": score,
                "label": level.label,
                "mark": scale.to_mark(score, leaf.meta.max_marks),
            }),
        );
    }
    if let Some(mark) = req.params.get("mark").and_then(|v| v.as_f64()) {
        return match nearest_level(leaf, mark, scale) {
            Some(level) => ok(
                &req.id,
                json!({
                    "leafId": leaf_id,
                    "mark": mark,
                    "level": level,
                }),
            ),
            None => err(&req.id, "not_found", "leaf has no levels", None),
        };
    }
    err(
        &req.id,
        "bad_params",
        "provide params.score or params.mark",
        None,
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.resolve" => Some(handle_scores_resolve(state, req)),
        "scores.evaluate" => Some(handle_scores_evaluate(state, req)),
        "levels.convert" => Some(handle_levels_convert(state, req)),
        _ => None,
    }
}
