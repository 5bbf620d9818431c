use crate::grading::refresh_summary;
use crate::ipc::error::ok;
use crate::ipc::handlers::grades::read_summary;
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_str, require_db, student_exists, term_exists, write_err,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn require_refs(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, String), HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let term_id = get_required_str(params, "termId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    if !term_exists(conn, &term_id)? {
        return Err(HandlerErr::new("not_found", "term not found"));
    }
    Ok((student_id, term_id))
}

fn ensure_summary_row(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO result_summaries(id, student_id, term_id, updated_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_id, term_id) DO NOTHING",
        (Uuid::new_v4().to_string(), student_id, term_id),
    )
    .map(|_| ())
    .map_err(write_err)
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, term_id) = require_refs(conn, params)?;
    let summary = read_summary(conn, &student_id, &term_id)?;
    if summary.is_null() {
        return Err(HandlerErr::new("not_found", "no summary for student/term"));
    }
    Ok(json!({ "summary": summary }))
}

fn refresh(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let term_id = get_required_str(params, "termId")?;
    let stats = refresh_summary(conn, &student_id, &term_id)?;
    Ok(json!({ "summary": stats }))
}

fn set_attendance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, term_id) = require_refs(conn, params)?;
    let opened = get_opt_i64(params, "timesOpened")?;
    let present = get_opt_i64(params, "timesPresent")?;
    let absent = get_opt_i64(params, "timesAbsent")?;
    for (key, v) in [
        ("timesOpened", opened),
        ("timesPresent", present),
        ("timesAbsent", absent),
    ] {
        if let Some(v) = v {
            if v < 0 {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{} must not be negative", key),
                ));
            }
        }
    }

    ensure_summary_row(conn, &student_id, &term_id)?;
    conn.execute(
        "UPDATE result_summaries SET
             times_opened = COALESCE(?, times_opened),
             times_present = COALESCE(?, times_present),
             times_absent = COALESCE(?, times_absent),
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE student_id = ? AND term_id = ?",
        rusqlite::params![opened, present, absent, student_id, term_id],
    )
    .map_err(write_err)?;

    Ok(json!({ "summary": read_summary(conn, &student_id, &term_id)? }))
}

fn remark_column(role: &str) -> Option<&'static str> {
    match role {
        "classTeacher" => Some("teacher_remark"),
        "principal" => Some("principal_remark"),
        "headOfSchool" => Some("hos_remark"),
        _ => None,
    }
}

fn set_remarks(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, term_id) = require_refs(conn, params)?;
    let role = get_required_str(params, "role")?;
    let remark = get_required_str(params, "remark")?;
    let Some(column) = remark_column(&role) else {
        return Err(HandlerErr::new(
            "bad_params",
            "role must be classTeacher, principal or headOfSchool",
        ));
    };

    ensure_summary_row(conn, &student_id, &term_id)?;
    let sql = format!(
        "UPDATE result_summaries SET {} = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE student_id = ? AND term_id = ?",
        column
    );
    conn.execute(&sql, (&remark, &student_id, &term_id))
        .map_err(write_err)?;

    Ok(json!({ "summary": read_summary(conn, &student_id, &term_id)? }))
}

fn parse_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_opt_str(params, key)? else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be YYYY-MM-DD", key)))?;
    Ok(Some(raw))
}

fn set_term_dates(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, term_id) = require_refs(conn, params)?;
    let vacation = parse_date(params, "vacationDate")?;
    let resumption = parse_date(params, "resumptionDate")?;
    if vacation.is_none() && resumption.is_none() {
        return Err(HandlerErr::new(
            "bad_params",
            "provide vacationDate and/or resumptionDate",
        ));
    }

    ensure_summary_row(conn, &student_id, &term_id)?;
    conn.execute(
        "UPDATE result_summaries SET
             vacation_date = COALESCE(?, vacation_date),
             resumption_date = COALESCE(?, resumption_date),
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE student_id = ? AND term_id = ?",
        rusqlite::params![vacation, resumption, student_id, term_id],
    )
    .map_err(write_err)?;

    Ok(json!({ "summary": read_summary(conn, &student_id, &term_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &AppState, f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match require_db(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "summary.get" => Some(run(state, get)),
        "summary.refresh" => Some(run(state, refresh)),
        "summary.setAttendance" => Some(run(state, set_attendance)),
        "summary.setRemarks" => Some(run(state, set_remarks)),
        "summary.setTermDates" => Some(run(state, set_term_dates)),
        _ => None,
    }
}
