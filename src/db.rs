use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use crate::review::EvaluatorRole;
use crate::rubric::RubricNodeSpec;
use crate::scores::ScoreSheet;

pub const DB_FILE: &str = "rubricd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rubrics(
            review_name TEXT PRIMARY KEY,
            evaluator_role TEXT NOT NULL,
            tree_json TEXT NOT NULL,
            tree_digest TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_submissions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            evaluator_role TEXT NOT NULL,
            sheet_json TEXT NOT NULL,
            sheet_digest TEXT NOT NULL,
            computed_total REAL NOT NULL,
            max_total REAL NOT NULL,
            is_complete INTEGER NOT NULL,
            submitted_seq INTEGER NOT NULL,
            submitted_at TEXT NOT NULL,
            UNIQUE(student_id, review_name),
            FOREIGN KEY(review_name) REFERENCES rubrics(review_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_submissions_student ON review_submissions(student_id)",
        [],
    )?;

    Ok(conn)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn parse_role(raw: &str) -> rusqlite::Result<EvaluatorRole> {
    EvaluatorRole::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown evaluator role: {}", raw).into(),
        )
    })
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("corrupt setting {}", key))?,
        )),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredRubric {
    pub review_name: String,
    pub role: EvaluatorRole,
    pub spec: RubricNodeSpec,
    pub digest: String,
    pub updated_at: String,
}

/// Registers (or replaces) the rubric for a review name. The caller
/// validates the tree first.
pub fn rubric_upsert(
    conn: &Connection,
    review_name: &str,
    role: EvaluatorRole,
    spec: &RubricNodeSpec,
) -> anyhow::Result<String> {
    let tree_json = serde_json::to_string(spec).context("failed to serialize rubric")?;
    let digest = sha256_hex(tree_json.as_bytes());
    conn.execute(
        "INSERT INTO rubrics(review_name, evaluator_role, tree_json, tree_digest, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(review_name) DO UPDATE SET
            evaluator_role = excluded.evaluator_role,
            tree_json = excluded.tree_json,
            tree_digest = excluded.tree_digest,
            updated_at = excluded.updated_at",
        (review_name, role.as_str(), &tree_json, &digest, now_rfc3339()),
    )?;
    Ok(digest)
}

fn rubric_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn rubric_from_parts(
    (review_name, role, tree_json, digest, updated_at): (String, String, String, String, String),
) -> anyhow::Result<StoredRubric> {
    let role = parse_role(&role)?;
    let spec = serde_json::from_str(&tree_json)
        .with_context(|| format!("corrupt rubric for {}", review_name))?;
    Ok(StoredRubric {
        review_name,
        role,
        spec,
        digest,
        updated_at,
    })
}

pub fn rubric_get(conn: &Connection, review_name: &str) -> anyhow::Result<Option<StoredRubric>> {
    let row = conn
        .query_row(
            "SELECT review_name, evaluator_role, tree_json, tree_digest, updated_at
             FROM rubrics WHERE review_name = ?",
            [review_name],
            rubric_from_row,
        )
        .optional()?;
    row.map(rubric_from_parts).transpose()
}

pub fn rubric_list(conn: &Connection) -> anyhow::Result<Vec<StoredRubric>> {
    let mut stmt = conn.prepare(
        "SELECT review_name, evaluator_role, tree_json, tree_digest, updated_at
         FROM rubrics ORDER BY review_name",
    )?;
    let rows = stmt
        .query_map([], rubric_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(rubric_from_parts).collect()
}

#[derive(Debug, Clone)]
pub struct NewSubmission<'a> {
    pub student_id: &'a str,
    pub review_name: &'a str,
    pub role: EvaluatorRole,
    pub sheet: &'a ScoreSheet,
    pub computed_total: f64,
    pub max_total: f64,
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
pub struct StoredSubmission {
    pub id: String,
    pub student_id: String,
    pub review_name: String,
    pub role: EvaluatorRole,
    pub sheet: ScoreSheet,
    pub sheet_digest: String,
    pub computed_total: f64,
    pub max_total: f64,
    pub is_complete: bool,
    pub submitted_seq: i64,
    pub submitted_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub id: String,
    pub unchanged: bool,
}

/// One row per (student, review). Re-submitting identical data is a no-op;
/// anything else overwrites (last write wins).
pub fn submission_upsert(conn: &Connection, sub: &NewSubmission<'_>) -> anyhow::Result<UpsertOutcome> {
    let sheet_json = serde_json::to_string(sub.sheet).context("failed to serialize score sheet")?;
    let digest = sha256_hex(sheet_json.as_bytes());

    let existing: Option<(String, String, String, f64, i64)> = conn
        .query_row(
            "SELECT id, evaluator_role, sheet_digest, computed_total, is_complete
             FROM review_submissions
             WHERE student_id = ? AND review_name = ?",
            (sub.student_id, sub.review_name),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;

    if let Some((id, role, old_digest, old_total, old_complete)) = &existing {
        if *old_digest == digest
            && role == sub.role.as_str()
            && *old_total == sub.computed_total
            && (*old_complete != 0) == sub.is_complete
        {
            return Ok(UpsertOutcome {
                id: id.clone(),
                unchanged: true,
            });
        }
    }

    let next_seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(submitted_seq), 0) + 1 FROM review_submissions",
        [],
        |r| r.get(0),
    )?;
    let id = match existing {
        Some((id, ..)) => {
            conn.execute(
                "UPDATE review_submissions SET
                    evaluator_role = ?, sheet_json = ?, sheet_digest = ?, computed_total = ?,
                    max_total = ?, is_complete = ?, submitted_seq = ?, submitted_at = ?
                 WHERE id = ?",
                rusqlite::params![
                    sub.role.as_str(),
                    sheet_json,
                    digest,
                    sub.computed_total,
                    sub.max_total,
                    sub.is_complete as i64,
                    next_seq,
                    now_rfc3339(),
                    id
                ],
            )?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO review_submissions(
                    id, student_id, review_name, evaluator_role, sheet_json, sheet_digest,
                    computed_total, max_total, is_complete, submitted_seq, submitted_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    sub.student_id,
                    sub.review_name,
                    sub.role.as_str(),
                    sheet_json,
                    digest,
                    sub.computed_total,
                    sub.max_total,
                    sub.is_complete as i64,
                    next_seq,
                    now_rfc3339()
                ],
            )?;
            id
        }
    };
    Ok(UpsertOutcome {
        id,
        unchanged: false,
    })
}

/// Submissions for one student in submission order.
pub fn submissions_for_student(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<Vec<StoredSubmission>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, review_name, evaluator_role, sheet_json, sheet_digest,
                computed_total, max_total, is_complete, submitted_seq, submitted_at
         FROM review_submissions
         WHERE student_id = ?
         ORDER BY submitted_seq",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                parse_role(&r.get::<_, String>(3)?)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, i64>(8)? != 0,
                r.get::<_, i64>(9)?,
                r.get::<_, String>(10)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(
                id,
                student_id,
                review_name,
                role,
                sheet_json,
                sheet_digest,
                computed_total,
                max_total,
                is_complete,
                submitted_seq,
                submitted_at,
            )| {
                let sheet: ScoreSheet = serde_json::from_str(&sheet_json)
                    .map_err(|e| anyhow!("corrupt score sheet {}: {}", id, e))?;
                Ok(StoredSubmission {
                    id,
                    student_id,
                    review_name,
                    role,
                    sheet,
                    sheet_digest,
                    computed_total,
                    max_total,
                    is_complete,
                    submitted_seq,
                    submitted_at,
                })
            },
        )
        .collect()
}

pub fn submission_students(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT student_id FROM review_submissions ORDER BY student_id")?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn spec() -> RubricNodeSpec {
        serde_json::from_value(json!({
            "id": "root", "component": "Panel Review", "maxMarks": 20,
            "children": [{ "id": "a", "maxMarks": 10 }, { "id": "b", "maxMarks": 10 }]
        }))
        .expect("spec")
    }

    #[test]
    fn settings_roundtrip() {
        let conn = open_db(&temp_dir("rubricd-db-settings")).expect("open");
        assert!(settings_get_json(&conn, "engine.config").expect("get").is_none());
        settings_set_json(&conn, "engine.config", &json!({ "levelScaleMax": 4 })).expect("set");
        settings_set_json(&conn, "engine.config", &json!({ "levelScaleMax": 10 })).expect("set");
        assert_eq!(
            settings_get_json(&conn, "engine.config").expect("get"),
            Some(json!({ "levelScaleMax": 10 }))
        );
    }

    #[test]
    fn rubric_upsert_replaces_by_review_name() {
        let conn = open_db(&temp_dir("rubricd-db-rubrics")).expect("open");
        let d1 = rubric_upsert(&conn, "Panel Review", EvaluatorRole::Panel, &spec()).expect("upsert");
        let d2 = rubric_upsert(&conn, "Panel Review", EvaluatorRole::Panel, &spec()).expect("upsert");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        let all = rubric_list(&conn).expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].spec, spec());
        assert!(rubric_get(&conn, "Guide Review 1").expect("get").is_none());
    }

    #[test]
    fn identical_resubmission_is_unchanged() {
        let conn = open_db(&temp_dir("rubricd-db-submit")).expect("open");
        rubric_upsert(&conn, "Panel Review", EvaluatorRole::Panel, &spec()).expect("upsert");
        let sheet: ScoreSheet = [("a", 7.0), ("b", 9.0)].into_iter().collect();
        let sub = NewSubmission {
            student_id: "s1",
            review_name: "Panel Review",
            role: EvaluatorRole::Panel,
            sheet: &sheet,
            computed_total: 16.0,
            max_total: 20.0,
            is_complete: true,
        };
        let first = submission_upsert(&conn, &sub).expect("first");
        assert!(!first.unchanged);
        let again = submission_upsert(&conn, &sub).expect("again");
        assert_eq!(again, UpsertOutcome { id: first.id.clone(), unchanged: true });

        let edited: ScoreSheet = [("a", 8.0), ("b", 9.0)].into_iter().collect();
        let changed = submission_upsert(
            &conn,
            &NewSubmission {
                sheet: &edited,
                computed_total: 17.0,
                ..sub.clone()
            },
        )
        .expect("changed");
        assert_eq!(changed.id, first.id);
        assert!(!changed.unchanged);

        let stored = submissions_for_student(&conn, "s1").expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].computed_total, 17.0);
        assert_eq!(stored[0].sheet.get("a"), Some(8.0));
        assert_eq!(stored[0].submitted_seq, 2);
        assert_eq!(submission_students(&conn).expect("students"), vec!["s1".to_string()]);
    }
}
