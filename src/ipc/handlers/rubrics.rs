use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    parse_role, parse_tree_spec, require_db, require_str, resolve_tree, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rubric::RubricTree;
use serde_json::json;

fn tree_overview(tree: &RubricTree) -> serde_json::Value {
    json!({
        "leafCount": tree.leaf_count(),
        "maxTotal": tree.max_total(),
        "depth": tree.height(),
        "warnings": tree.lints(),
    })
}

fn handle_rubrics_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("tree") else {
        return err(&req.id, "bad_params", "missing params.tree", None);
    };
    let spec = match parse_tree_spec(raw) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match RubricTree::load(&spec, state.config.level_scale()) {
        Ok(tree) => ok(&req.id, tree_overview(&tree)),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_rubrics_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let review_name = match require_str(&req.params, "reviewName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let role = match parse_role(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(raw) = req.params.get("tree") else {
        return err(&req.id, "bad_params", "missing params.tree", None);
    };
    let spec = match parse_tree_spec(raw) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Never register a tree that cannot be scored.
    let tree = match RubricTree::load(&spec, state.config.level_scale()) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(review = %review_name, error = %e, "rejected rubric");
            return HandlerErr::from(e).response(&req.id);
        }
    };

    let digest = match db::rubric_upsert(conn, review_name, role, &spec) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    tracing::info!(review = %review_name, role = role.as_str(), %digest, "rubric registered");
    ok(
        &req.id,
        json!({
            "reviewName": review_name,
            "evaluatorRole": role,
            "digest": digest,
            "maxTotal": tree.max_total(),
            "leafCount": tree.leaf_count(),
            "warnings": tree.lints(),
        }),
    )
}

/// Lists every registered rubric. A rubric that no longer loads is listed
/// with its error so the UI can show the review as unavailable.
fn handle_rubrics_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let stored = match db::rubric_list(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scale = state.config.level_scale();
    let rubrics: Vec<serde_json::Value> = stored
        .iter()
        .map(|r| match RubricTree::load(&r.spec, scale) {
            Ok(tree) => json!({
                "reviewName": r.review_name,
                "evaluatorRole": r.role,
                "maxTotal": tree.max_total(),
                "leafCount": tree.leaf_count(),
                "updatedAt": r.updated_at,
            }),
            Err(e) => json!({
                "reviewName": r.review_name,
                "evaluatorRole": r.role,
                "updatedAt": r.updated_at,
                "error": {
                    "code": e.code(),
                    "nodeId": e.node_id(),
                    "message": e.to_string(),
                },
            }),
        })
        .collect();
    ok(&req.id, json!({ "rubrics": rubrics }))
}

fn handle_rubrics_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let review_name = match require_str(&req.params, "reviewName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match db::rubric_get(conn, review_name) {
        Ok(Some(r)) => ok(
            &req.id,
            json!({
                "reviewName": r.review_name,
                "evaluatorRole": r.role,
                "digest": r.digest,
                "updatedAt": r.updated_at,
                "tree": r.spec,
            }),
        ),
        Ok(None) => err(
            &req.id,
            "not_found",
            "no rubric registered for review",
            Some(json!({ "reviewName": review_name })),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_rubrics_leaves(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resolved = match resolve_tree(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    ok(
        &req.id,
        json!({
            "reviewName": resolved.review_name,
            "evaluatorRole": resolved.role,
            "leaves": resolved.tree.leaf_fields(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rubrics.validate" => Some(handle_rubrics_validate(state, req)),
        "rubrics.upsert" => Some(handle_rubrics_upsert(state, req)),
        "rubrics.list" => Some(handle_rubrics_list(state, req)),
        "rubrics.get" => Some(handle_rubrics_get(state, req)),
        "rubrics.leaves" => Some(handle_rubrics_leaves(state, req)),
        _ => None,
    }
}
