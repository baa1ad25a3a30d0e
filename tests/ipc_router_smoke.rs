use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rubricd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rubricd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn send(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = send(stdin, reader, id, method, params);
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn panel_tree() -> serde_json::Value {
    json!({
        "id": "panel",
        "component": "Panel Review",
        "maxMarks": 50,
        "children": [
            { "id": "demo", "component": "Demo", "maxMarks": 25 },
            {
                "id": "qa",
                "component": "Q&A",
                "maxMarks": 25,
                "levels": [
                    { "score": 5, "label": "Excellent" },
                    { "score": 4, "label": "Good" },
                    { "score": 2, "label": "Weak" }
                ]
            }
        ]
    })
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rubricd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    // Pure evaluation works before any workspace is selected.
    let validated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "rubrics.validate",
        json!({ "tree": panel_tree() }),
    );
    assert_eq!(validated["leafCount"].as_u64(), Some(2));
    assert_eq!(validated["maxTotal"].as_f64(), Some(50.0));
    assert_eq!(validated["depth"].as_u64(), Some(1));

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.evaluate",
        json!({ "tree": panel_tree(), "scoreSheet": { "demo": 20, "qa": 4 } }),
    );
    assert_eq!(report["total"].as_f64(), Some(40.0));
    assert_eq!(report["isComplete"].as_bool(), Some(true));

    let no_ws = request(
        &mut stdin,
        &mut reader,
        "4",
        "rubrics.list",
        json!({}),
    );
    assert_eq!(no_ws["ok"].as_bool(), Some(false));
    assert_eq!(no_ws["error"]["code"].as_str(), Some("no_workspace"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let cfg = request_ok(&mut stdin, &mut reader, "6", "config.get", json!({}));
    assert_eq!(cfg["levelScaleMax"].as_f64(), Some(5.0));
    assert_eq!(cfg["duplicateReviewPolicy"].as_str(), Some("sum"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "rubrics.upsert",
        json!({ "reviewName": "Panel Review", "evaluatorRole": "panel", "tree": panel_tree() }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "8", "rubrics.list", json!({}));
    assert_eq!(listed["rubrics"].as_array().map(|a| a.len()), Some(1));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "rubrics.get",
        json!({ "reviewName": "Panel Review" }),
    );
    assert_eq!(got["evaluatorRole"].as_str(), Some("panel"));
    assert_eq!(got["tree"]["id"].as_str(), Some("panel"));

    let leaves = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "rubrics.leaves",
        json!({ "reviewName": "Panel Review" }),
    );
    let ids: Vec<&str> = leaves["leaves"]
        .as_array()
        .expect("leaves")
        .iter()
        .filter_map(|l| l["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["demo", "qa"]);

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "scores.resolve",
        json!({ "reviewName": "Panel Review", "leafId": "qa", "scoreSheet": { "qa": 4 } }),
    );
    assert_eq!(resolved["state"].as_str(), Some("scored"));
    assert_eq!(resolved["mark"].as_f64(), Some(20.0));
    assert_eq!(resolved["levelLabel"].as_str(), Some("Good"));

    let converted = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "levels.convert",
        json!({ "reviewName": "Panel Review", "leafId": "qa", "mark": 19 }),
    );
    assert_eq!(converted["level"]["score"].as_f64(), Some(4.0));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reviews.submit",
        json!({
            "studentId": "S-001",
            "reviewName": "Panel Review",
            "scoreSheet": { "demo": 22, "qa": 5 }
        }),
    );
    assert_eq!(submitted["total"].as_f64(), Some(47.0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "reviews.list",
        json!({ "studentId": "S-001" }),
    );
    assert_eq!(listed["reviews"].as_array().map(|a| a.len()), Some(1));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "marks.summary",
        json!({ "studentId": "S-001" }),
    );
    assert_eq!(summary["summary"]["panelTotal"].as_f64(), Some(47.0));

    let all = request_ok(&mut stdin, &mut reader, "16", "marks.summaryList", json!({}));
    assert_eq!(all["students"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "config.update",
        json!({ "patch": { "duplicateReviewPolicy": "latestWins" } }),
    );

    let unknown = send(&mut stdin, &mut reader, "18", "grades.export", json!({}));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_implemented"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_line_gets_bad_json_and_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(value["error"]["code"].as_str(), Some("bad_json"));

    let _ = request_ok(&mut stdin, &mut reader, "after", "health", json!({}));

    drop(stdin);
    let _ = child.wait();
}
