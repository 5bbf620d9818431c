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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn batch_entry_skips_empty_rows_and_ranks_subjects() {
    let workspace = temp_dir("schoold-batch");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "terms.create",
        json!({ "session": "2024/2025", "name": "First" }),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();

    let mut ids = Vec::new();
    for (i, name) in ["Ada Obi", "Bola Ade", "Chidi Eze"].iter().enumerate() {
        let r = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.register",
            json!({
                "fullName": name,
                "className": "SS1",
                "studentNo": format!("STD00030{}", i + 1),
            }),
        );
        ids.push(r["studentId"].as_str().expect("studentId").to_string());
    }

    // One all-zero row (an untouched entry column) must be skipped.
    let out = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.recordBatch",
        json!({
            "className": "SS1",
            "termId": term_id,
            "recordedBy": "TCH000007",
            "rows": [
                { "studentId": ids[0], "subject": "Mathematics",
                  "test1": 80, "test2": 80, "test3": 80, "exam": 80 },
                { "studentId": ids[1], "subject": "Mathematics",
                  "test1": 60, "test2": 60, "test3": 60, "exam": 60 },
                { "studentId": ids[2], "subject": "Mathematics",
                  "test1": 0, "test2": 0, "test3": 0, "exam": 0 },
            ],
        }),
    );
    assert_eq!(out["recorded"].as_i64(), Some(2));
    assert_eq!(out["skipped"].as_i64(), Some(1));

    let subjects = out["ranking"]["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["subject"], "MATHEMATICS");
    // Totals are 80 and 60, so the subject average is 70.
    assert_eq!(subjects[0]["classAverage"].as_f64(), Some(70.0));
    assert_eq!(subjects[0]["rowCount"].as_i64(), Some(2));

    // Per-row subject rank and class average land on the score rows.
    let card = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.studentTerm",
        json!({ "studentId": ids[1], "termId": term_id }),
    );
    let row = &card["subjects"].as_array().expect("rows")[0];
    assert_eq!(row["subjectRank"].as_i64(), Some(2));
    assert_eq!(row["classAverage"].as_f64(), Some(70.0));

    // Updating one row shifts the subject average and ranks consistently.
    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.record",
        json!({
            "studentId": ids[1],
            "termId": term_id,
            "subject": "Mathematics",
            "test1": 100, "test2": 100, "test3": 100, "exam": 100,
        }),
    );
    let out = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "ranking.recompute",
        json!({ "className": "SS1", "termId": term_id }),
    );
    let subjects = out["ranking"]["subjects"].as_array().expect("subjects");
    assert_eq!(subjects[0]["classAverage"].as_f64(), Some(90.0));
    let card = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.studentTerm",
        json!({ "studentId": ids[1], "termId": term_id }),
    );
    let row = &card["subjects"].as_array().expect("rows")[0];
    assert_eq!(row["subjectRank"].as_i64(), Some(1));
    assert_eq!(row["classAverage"].as_f64(), Some(90.0));

    child.kill().ok();
}

#[test]
fn invalid_row_rejects_the_whole_batch() {
    let workspace = temp_dir("schoold-batch-reject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "terms.create",
        json!({ "session": "2024/2025", "name": "Third" }),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.register",
        json!({ "fullName": "Ada Obi", "className": "SS2" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.recordBatch",
        json!({
            "className": "SS2",
            "termId": term_id,
            "rows": [
                { "studentId": student_id, "subject": "Mathematics",
                  "test1": 70, "test2": 70, "test3": 70, "exam": 70 },
                { "studentId": student_id, "subject": "English",
                  "test1": 130, "test2": 70, "test3": 70, "exam": 70 },
            ],
        }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"], "bad_params");

    // The valid row was not recorded either.
    let card = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.studentTerm",
        json!({ "studentId": student_id, "termId": term_id }),
    );
    assert_eq!(card["subjects"].as_array().map(|a| a.len()), Some(0));

    child.kill().ok();
}
