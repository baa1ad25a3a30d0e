use crate::config::SETTINGS_KEY;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use crate::rubric::RubricTree;
use crate::scores::LevelScale;
use rusqlite::Connection;
use serde_json::json;

fn config_json(state: &AppState) -> serde_json::Value {
    serde_json::to_value(&state.config).unwrap_or_else(|_| json!({}))
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, config_json(state))
}

/// Every registered rubric must still load under `scale`, otherwise a scale
/// change would make those reviews unscorable.
fn check_registered_rubrics(conn: &Connection, scale: LevelScale) -> Result<(), HandlerErr> {
    let stored = db::rubric_list(conn).map_err(HandlerErr::db)?;
    for r in &stored {
        if let Err(e) = RubricTree::load(&r.spec, scale) {
            return Err(HandlerErr::new(
                "invalid_tree",
                format!(
                    "levelScaleMax {} does not fit the rubric for {}: {}",
                    scale.max(),
                    r.review_name,
                    e
                ),
            )
            .with_details(json!({
                "reviewName": r.review_name,
                "nodeId": e.node_id(),
                "reason": e.code(),
            })));
        }
    }
    Ok(())
}

/// Applies a patch atomically; with a workspace open the result is saved.
fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut next = state.config.clone();
    if let Err(msg) = next.merge_patch(patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }

    if let Some(conn) = state.db.as_ref() {
        if next.level_scale_max != state.config.level_scale_max {
            if let Err(e) = check_registered_rubrics(conn, next.level_scale()) {
                tracing::warn!(code = e.code, "refused level scale change");
                return e.response(&req.id);
            }
        }
        let value = match serde_json::to_value(&next) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "internal", e.to_string(), None),
        };
        if let Err(e) = db::settings_set_json(conn, SETTINGS_KEY, &value) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    tracing::info!(config = ?next, "engine config updated");
    state.config = next;
    ok(&req.id, config_json(state))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
