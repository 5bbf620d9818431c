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

struct Harness {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut h = Harness {
            child,
            stdin,
            reader,
            next_id: 0,
        };
        h.call(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        h
    }

    fn raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.raw(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "request failed: {}",
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.raw(method, params);
        assert!(
            !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
            "request unexpectedly succeeded: {}",
            value
        );
        value["error"]["code"].as_str().expect("code").to_string()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.child.kill().ok();
    }
}

#[test]
fn statistics_refresh_never_resets_manual_fields() {
    let mut h = Harness::new("schoold-summary");
    let term = h.call(
        "terms.create",
        json!({ "session": "2024/2025", "name": "First" }),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();
    let student = h.call(
        "students.register",
        json!({ "fullName": "Ada Obi", "className": "JSS1" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    // Refresh with no grades yet creates the row with zero statistics.
    let out = h.call(
        "summary.refresh",
        json!({ "studentId": student_id, "termId": term_id }),
    );
    assert_eq!(out["summary"]["subjectCount"].as_i64(), Some(0));
    assert_eq!(out["summary"]["averageScore"].as_f64(), Some(0.0));
    assert_eq!(out["summary"]["promotionStatus"], "REPEAT");

    h.call(
        "summary.setAttendance",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "timesOpened": 120,
            "timesPresent": 115,
            "timesAbsent": 5,
        }),
    );
    h.call(
        "summary.setRemarks",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "role": "classTeacher",
            "remark": "Hardworking and attentive.",
        }),
    );
    h.call(
        "summary.setRemarks",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "role": "principal",
            "remark": "An excellent result.",
        }),
    );
    h.call(
        "summary.setTermDates",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "vacationDate": "2025-04-11",
            "resumptionDate": "2025-05-05",
        }),
    );

    // New grades, a statistics refresh and a full ranking pass; none of
    // them may touch the manually-entered fields.
    h.call(
        "grades.record",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "subject": "Mathematics",
            "test1": 80, "test2": 70, "test3": 90, "exam": 75,
        }),
    );
    h.call(
        "ranking.recompute",
        json!({ "className": "JSS1", "termId": term_id }),
    );

    let out = h.call(
        "summary.get",
        json!({ "studentId": student_id, "termId": term_id }),
    );
    let s = &out["summary"];
    assert_eq!(s["subjectCount"].as_i64(), Some(1));
    assert_eq!(s["averageScore"].as_f64(), Some(76.5));
    assert_eq!(s["classRank"], "1/1");
    assert_eq!(s["promotionStatus"], "PROMOTED");
    assert_eq!(s["timesOpened"].as_i64(), Some(120));
    assert_eq!(s["timesPresent"].as_i64(), Some(115));
    assert_eq!(s["timesAbsent"].as_i64(), Some(5));
    assert_eq!(s["teacherRemark"], "Hardworking and attentive.");
    assert_eq!(s["principalRemark"], "An excellent result.");
    assert_eq!(s["hosRemark"], "");
    assert_eq!(s["vacationDate"], "2025-04-11");
    assert_eq!(s["resumptionDate"], "2025-05-05");

    // Owned-field updates validate their inputs.
    let code = h.err_code(
        "summary.setRemarks",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "role": "janitor",
            "remark": "n/a",
        }),
    );
    assert_eq!(code, "bad_params");
    let code = h.err_code(
        "summary.setTermDates",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "vacationDate": "11/04/2025",
        }),
    );
    assert_eq!(code, "bad_params");
    let code = h.err_code(
        "summary.setAttendance",
        json!({
            "studentId": student_id,
            "termId": term_id,
            "timesAbsent": -1,
        }),
    );
    assert_eq!(code, "bad_params");

    // Unknown references stay typed.
    let code = h.err_code(
        "summary.get",
        json!({ "studentId": "missing", "termId": term_id }),
    );
    assert_eq!(code, "not_found");

    // A second student with no summary row yet.
    let other = h.call(
        "students.register",
        json!({ "fullName": "Bola Ade", "className": "JSS1" }),
    );
    let other_id = other["studentId"].as_str().expect("studentId").to_string();
    let code = h.err_code(
        "summary.get",
        json!({ "studentId": other_id, "termId": term_id }),
    );
    assert_eq!(code, "not_found");
}
