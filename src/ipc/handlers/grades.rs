use crate::grading::{
    grade_for, recompute_class_ranking, refresh_summary, round2, subject_totals, validate_score,
    RankingContext,
};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_str, get_required_f64, get_required_str, require_db, student_exists,
    term_exists, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ScoreEntry {
    student_id: String,
    subject: String,
    test1: f64,
    test2: f64,
    test3: f64,
    exam: f64,
}

fn parse_score_entry(
    params: &serde_json::Value,
    student_key: &str,
) -> Result<ScoreEntry, HandlerErr> {
    let student_id = get_required_str(params, student_key)?;
    let subject = get_required_str(params, "subject")?;
    if subject.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "subject must be non-empty"));
    }
    let entry = ScoreEntry {
        student_id,
        subject: subject.trim().to_uppercase(),
        test1: get_required_f64(params, "test1")?,
        test2: get_required_f64(params, "test2")?,
        test3: get_required_f64(params, "test3")?,
        exam: get_required_f64(params, "exam")?,
    };
    validate_score("test1", entry.test1)?;
    validate_score("test2", entry.test2)?;
    validate_score("test3", entry.test3)?;
    validate_score("exam", entry.exam)?;
    Ok(entry)
}

/// Upsert the unique (student, term, subject) row, rewriting every derived
/// field. Subject rank and class average stay as the ranking engine last
/// left them; they belong to that pass, not this one.
fn upsert_subject_score(
    conn: &Connection,
    term_id: &str,
    entry: &ScoreEntry,
    recorded_by: Option<&str>,
) -> Result<serde_json::Value, HandlerErr> {
    let totals = subject_totals(entry.test1, entry.test2, entry.test3, entry.exam);
    let (grade, remark) = grade_for(totals.total_score);
    let total_ca = round2(totals.total_ca);
    let total_score = round2(totals.total_score);

    conn.execute(
        "INSERT INTO subject_scores(
             id, student_id, term_id, subject, test1, test2, test3, exam,
             total_ca, total_score, grade, remark, recorded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_id, term_id, subject) DO UPDATE SET
             test1 = excluded.test1,
             test2 = excluded.test2,
             test3 = excluded.test3,
             exam = excluded.exam,
             total_ca = excluded.total_ca,
             total_score = excluded.total_score,
             grade = excluded.grade,
             remark = excluded.remark,
             recorded_by = excluded.recorded_by,
             updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            entry.student_id,
            term_id,
            entry.subject,
            entry.test1,
            entry.test2,
            entry.test3,
            entry.exam,
            total_ca,
            total_score,
            grade,
            remark,
            recorded_by,
        ],
    )
    .map_err(write_err)?;

    Ok(json!({
        "studentId": entry.student_id,
        "subject": entry.subject,
        "totalCa": total_ca,
        "totalScore": total_score,
        "grade": grade,
        "remark": remark,
    }))
}

fn record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let recorded_by = get_opt_str(params, "recordedBy")?;
    let entry = parse_score_entry(params, "studentId")?;

    if !student_exists(conn, &entry.student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    if !term_exists(conn, &term_id)? {
        return Err(HandlerErr::new("not_found", "term not found"));
    }

    let score = upsert_subject_score(conn, &term_id, &entry, recorded_by.as_deref())?;
    let summary = refresh_summary(conn, &entry.student_id, &term_id)?;

    Ok(json!({
        "score": score,
        "summary": summary,
    }))
}

/// Batch entry for one class/term: all-zero rows are skipped (the empty
/// columns of the entry form), everything else is validated up front so a
/// bad row rejects the whole batch, then the class ranking is recomputed.
fn record_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_name = get_required_str(params, "className")?;
    let term_id = get_required_str(params, "termId")?;
    let recorded_by = get_opt_str(params, "recordedBy")?;
    let rows = params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing rows array"))?;

    if !term_exists(conn, &term_id)? {
        return Err(HandlerErr::new("not_found", "term not found"));
    }

    let mut entries: Vec<ScoreEntry> = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        let entry = parse_score_entry(row, "studentId")?;
        if entry.test1 == 0.0 && entry.test2 == 0.0 && entry.test3 == 0.0 && entry.exam == 0.0 {
            skipped += 1;
            continue;
        }
        let in_class: Option<String> = conn
            .query_row(
                "SELECT class_name FROM students WHERE id = ?",
                [&entry.student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match in_class {
            None => return Err(HandlerErr::new("not_found", "student not found")),
            Some(c) if c != class_name => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("student {} is not in {}", entry.student_id, class_name),
                ))
            }
            Some(_) => {}
        }
        entries.push(entry);
    }

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    for entry in &entries {
        upsert_subject_score(&tx, &term_id, entry, recorded_by.as_deref())?;
    }
    tx.commit().map_err(write_err)?;

    let ctx = RankingContext {
        conn,
        class_name: &class_name,
        term_id: &term_id,
    };
    let ranking = recompute_class_ranking(&ctx)?;

    Ok(json!({
        "recorded": entries.len(),
        "skipped": skipped,
        "ranking": ranking,
    }))
}

/// Report-card read model: every subject row for the student/term plus the
/// summary, in subject-name order.
fn student_term(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let term_id = get_required_str(params, "termId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    if !term_exists(conn, &term_id)? {
        return Err(HandlerErr::new("not_found", "term not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT subject, test1, test2, test3, exam, total_ca, total_score,
                    grade, remark, subject_rank, class_average
             FROM subject_scores
             WHERE student_id = ? AND term_id = ?
             ORDER BY subject",
        )
        .map_err(db_err)?;
    let subjects: Vec<serde_json::Value> = stmt
        .query_map((&student_id, &term_id), |r| {
            Ok(json!({
                "subject": r.get::<_, String>(0)?,
                "test1": r.get::<_, f64>(1)?,
                "test2": r.get::<_, f64>(2)?,
                "test3": r.get::<_, f64>(3)?,
                "exam": r.get::<_, f64>(4)?,
                "totalCa": r.get::<_, f64>(5)?,
                "totalScore": r.get::<_, f64>(6)?,
                "grade": r.get::<_, String>(7)?,
                "remark": r.get::<_, String>(8)?,
                "subjectRank": r.get::<_, Option<i64>>(9)?,
                "classAverage": r.get::<_, Option<f64>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let summary = read_summary(conn, &student_id, &term_id)?;

    Ok(json!({
        "subjects": subjects,
        "summary": summary,
    }))
}

pub fn read_summary(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT subject_count, total_score, average_score, class_rank,
                promotion_status, times_opened, times_present, times_absent,
                teacher_remark, principal_remark, hos_remark,
                vacation_date, resumption_date
         FROM result_summaries
         WHERE student_id = ? AND term_id = ?",
        (student_id, term_id),
        |r| {
            Ok(json!({
                "subjectCount": r.get::<_, i64>(0)?,
                "totalScore": r.get::<_, f64>(1)?,
                "averageScore": r.get::<_, f64>(2)?,
                "classRank": r.get::<_, String>(3)?,
                "promotionStatus": r.get::<_, String>(4)?,
                "timesOpened": r.get::<_, i64>(5)?,
                "timesPresent": r.get::<_, i64>(6)?,
                "timesAbsent": r.get::<_, i64>(7)?,
                "teacherRemark": r.get::<_, String>(8)?,
                "principalRemark": r.get::<_, String>(9)?,
                "hosRemark": r.get::<_, String>(10)?,
                "vacationDate": r.get::<_, Option<String>>(11)?,
                "resumptionDate": r.get::<_, Option<String>>(12)?,
            }))
        },
    )
    .optional()
    .map(|v| v.unwrap_or(serde_json::Value::Null))
    .map_err(db_err)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &AppState, f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match require_db(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "grades.record" => Some(run(state, record)),
        "grades.recordBatch" => Some(run(state, record_batch)),
        "grades.studentTerm" => Some(run(state, student_term)),
        _ => None,
    }
}
