use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_str, get_required_str, require_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_no_taken(conn: &Connection, student_no: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE student_no = ?",
        [student_no],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn generate_student_no(conn: &Connection) -> Result<String, HandlerErr> {
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let candidate = format!("STD{:06}", rng.gen_range(0..1_000_000));
        if !student_no_taken(conn, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(HandlerErr::new(
        "db_write_failed",
        "could not allocate a student number",
    ))
}

fn register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let full_name = get_required_str(params, "fullName")?;
    let class_name = get_required_str(params, "className")?;
    if full_name.trim().is_empty() || class_name.trim().is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "fullName and className must be non-empty",
        ));
    }

    let student_no = match get_opt_str(params, "studentNo")? {
        Some(n) if !n.trim().is_empty() => {
            let n = n.trim().to_string();
            if student_no_taken(conn, &n)? {
                return Err(HandlerErr::new("bad_params", "studentNo already in use"));
            }
            n
        }
        _ => generate_student_no(conn)?,
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_no, full_name, class_name, active, created_at)
         VALUES(?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &student_no, full_name.trim(), class_name.trim()),
    )
    .map_err(write_err)?;

    Ok(json!({
        "studentId": id,
        "studentNo": student_no,
    }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_name = get_opt_str(params, "className")?;

    let mut rows: Vec<serde_json::Value> = Vec::new();
    let mut push_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
        rows.push(json!({
            "studentId": r.get::<_, String>(0)?,
            "studentNo": r.get::<_, String>(1)?,
            "fullName": r.get::<_, String>(2)?,
            "className": r.get::<_, String>(3)?,
            "active": r.get::<_, i64>(4)? != 0,
        }));
        Ok(())
    };

    if let Some(class_name) = class_name {
        let mut stmt = conn
            .prepare(
                "SELECT id, student_no, full_name, class_name, active
                 FROM students WHERE class_name = ? ORDER BY student_no",
            )
            .map_err(db_err)?;
        let mut q = stmt.query([&class_name]).map_err(db_err)?;
        while let Some(r) = q.next().map_err(db_err)? {
            push_row(r).map_err(db_err)?;
        }
    } else {
        let mut stmt = conn
            .prepare(
                "SELECT id, student_no, full_name, class_name, active
                 FROM students ORDER BY class_name, student_no",
            )
            .map_err(db_err)?;
        let mut q = stmt.query([]).map_err(db_err)?;
        while let Some(r) = q.next().map_err(db_err)? {
            push_row(r).map_err(db_err)?;
        }
    }

    Ok(json!({ "students": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &AppState, f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match require_db(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "students.register" => Some(run(state, register)),
        "students.list" => Some(run(state, list)),
        _ => None,
    }
}
