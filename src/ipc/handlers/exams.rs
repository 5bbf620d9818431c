use crate::exam::{is_valid_option, score_submission, shuffle_for_view, QuestionKey};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_bool, get_opt_i64, get_opt_str, get_required_str, is_unique_violation,
    require_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ExamRow {
    id: String,
    exam_no: String,
    title: String,
    class_name: String,
    duration_minutes: i64,
    is_active: bool,
    shuffle_questions: bool,
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    conn.query_row(
        "SELECT id, exam_no, title, class_name, duration_minutes, is_active, shuffle_questions
         FROM exams WHERE id = ?",
        [exam_id],
        |r| {
            Ok(ExamRow {
                id: r.get(0)?,
                exam_no: r.get(1)?,
                title: r.get(2)?,
                class_name: r.get(3)?,
                duration_minutes: r.get(4)?,
                is_active: r.get::<_, i64>(5)? != 0,
                shuffle_questions: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "exam not found"))
}

fn student_class(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_name FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

/// Inactive exams and class mismatches both read as "not yours to take".
fn check_eligibility(conn: &Connection, exam: &ExamRow, student_id: &str) -> Result<(), HandlerErr> {
    let class_name = student_class(conn, student_id)?;
    if !exam.is_active {
        return Err(HandlerErr::new("not_eligible", "exam is not active"));
    }
    if class_name != exam.class_name {
        return Err(HandlerErr::new(
            "not_eligible",
            "exam is not for the student's class",
        ));
    }
    Ok(())
}

fn has_submission(
    conn: &Connection,
    exam_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM exam_submissions WHERE exam_id = ? AND student_id = ?",
        (exam_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn generate_exam_no(conn: &Connection) -> Result<String, HandlerErr> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let tail: String = (0..6)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        let candidate = format!("EXM{}", tail);
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM exams WHERE exam_no = ?", [&candidate], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        if taken.is_none() {
            return Ok(candidate);
        }
    }
    Err(HandlerErr::new(
        "db_write_failed",
        "could not allocate an exam number",
    ))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let subject = get_required_str(params, "subject")?;
    let class_name = get_required_str(params, "className")?;
    let duration = get_opt_i64(params, "durationMinutes")?.unwrap_or(60);
    let shuffle = get_opt_bool(params, "shuffleQuestions")?.unwrap_or(true);
    let created_by = get_opt_str(params, "createdBy")?;
    if title.trim().is_empty() || subject.trim().is_empty() || class_name.trim().is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "title, subject and className must be non-empty",
        ));
    }
    if duration <= 0 {
        return Err(HandlerErr::new("bad_params", "durationMinutes must be positive"));
    }

    let id = Uuid::new_v4().to_string();
    let exam_no = generate_exam_no(conn)?;
    conn.execute(
        "INSERT INTO exams(id, exam_no, title, subject, class_name, duration_minutes,
                           is_active, shuffle_questions, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            exam_no,
            title.trim(),
            subject.trim(),
            class_name.trim(),
            duration,
            shuffle as i64,
            created_by,
        ],
    )
    .map_err(write_err)?;

    Ok(json!({ "examId": id, "examNo": exam_no }))
}

fn add_question(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let text = get_required_str(params, "questionText")?;
    let option_a = get_required_str(params, "optionA")?;
    let option_b = get_required_str(params, "optionB")?;
    let option_c = get_required_str(params, "optionC")?;
    let option_d = get_required_str(params, "optionD")?;
    let correct = get_required_str(params, "correctOption")?;
    if !is_valid_option(&correct) {
        return Err(HandlerErr::new(
            "bad_params",
            "correctOption must be A, B, C or D",
        ));
    }
    let exam = load_exam(conn, &exam_id)?;

    let next_number: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(question_number), 0) + 1 FROM questions WHERE exam_id = ?",
            [&exam.id],
            |r| r.get(0),
        )
        .map_err(db_err)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO questions(id, exam_id, question_number, question_text,
                               option_a, option_b, option_c, option_d, correct_option)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id, exam.id, next_number, text, option_a, option_b, option_c, option_d, correct
        ],
    )
    .map_err(write_err)?;

    Ok(json!({ "questionId": id, "questionNumber": next_number }))
}

fn set_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let is_active = get_opt_bool(params, "isActive")?
        .ok_or_else(|| HandlerErr::new("bad_params", "missing isActive"))?;
    let exam = load_exam(conn, &exam_id)?;
    conn.execute(
        "UPDATE exams SET is_active = ? WHERE id = ?",
        (is_active as i64, &exam.id),
    )
    .map_err(write_err)?;
    Ok(json!({ "examId": exam.id, "isActive": is_active }))
}

#[derive(Debug, Clone)]
struct QuestionRow {
    id: String,
    number: i64,
    text: String,
    option_a: String,
    option_b: String,
    option_c: String,
    option_d: String,
    correct_option: String,
}

fn load_questions(conn: &Connection, exam_id: &str) -> Result<Vec<QuestionRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, question_number, question_text,
                    option_a, option_b, option_c, option_d, correct_option
             FROM questions
             WHERE exam_id = ?
             ORDER BY question_number",
        )
        .map_err(db_err)?;
    stmt.query_map([exam_id], |r| {
        Ok(QuestionRow {
            id: r.get(0)?,
            number: r.get(1)?,
            text: r.get(2)?,
            option_a: r.get(3)?,
            option_b: r.get(4)?,
            option_c: r.get(5)?,
            option_d: r.get(6)?,
            correct_option: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Open the exam for taking. The returned order is a fresh permutation per
/// call when the exam shuffles; nothing about it is persisted and scoring
/// later walks the canonical order.
fn start(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;
    if has_submission(conn, &exam.id, &student_id)? {
        return Err(HandlerErr::new(
            "already_attempted",
            "exam already submitted by this student",
        ));
    }
    check_eligibility(conn, &exam, &student_id)?;

    let mut questions = load_questions(conn, &exam.id)?;
    if exam.shuffle_questions {
        shuffle_for_view(&mut questions);
    }
    let questions: Vec<serde_json::Value> = questions
        .iter()
        .map(|q| {
            json!({
                "questionId": q.id,
                "questionNumber": q.number,
                "questionText": q.text,
                "optionA": q.option_a,
                "optionB": q.option_b,
                "optionC": q.option_c,
                "optionD": q.option_d,
            })
        })
        .collect();

    Ok(json!({
        "examId": exam.id,
        "examNo": exam.exam_no,
        "title": exam.title,
        "durationMinutes": exam.duration_minutes,
        "questions": questions,
    }))
}

fn parse_answers(params: &serde_json::Value) -> Result<HashMap<String, String>, HandlerErr> {
    let obj = params
        .get("answers")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing answers object"))?;
    let mut answers = HashMap::with_capacity(obj.len());
    for (question_id, v) in obj {
        let Some(option) = v.as_str() else {
            return Err(HandlerErr::new("bad_params", "answers values must be strings"));
        };
        if !is_valid_option(option) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("invalid option for question {}", question_id),
            ));
        }
        answers.insert(question_id.clone(), option.to_string());
    }
    Ok(answers)
}

fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_id = get_required_str(params, "examId")?;
    let answers = parse_answers(params)?;

    let exam = load_exam(conn, &exam_id)?;
    check_eligibility(conn, &exam, &student_id)?;

    let questions = load_questions(conn, &exam.id)?;
    if questions.is_empty() {
        return Err(HandlerErr::new("not_eligible", "exam has no questions"));
    }
    for question_id in answers.keys() {
        if !questions.iter().any(|q| q.id == *question_id) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("question {} does not belong to this exam", question_id),
            ));
        }
    }

    let tx = conn.unchecked_transaction().map_err(db_err)?;

    // Placeholder row first; the UNIQUE(exam_id, student_id) constraint is
    // the one-attempt guard, so a duplicate surfaces here and not via a
    // separate existence check.
    let submission_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO exam_submissions(id, exam_id, student_id, submitted_at,
                                      score, total_questions, correct_answers)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), 0, 0, 0)",
        (&submission_id, &exam.id, &student_id),
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::new(
                "already_attempted",
                "exam already submitted by this student",
            ));
        }
        return Err(write_err(e));
    }

    let keys: Vec<QuestionKey> = questions
        .iter()
        .map(|q| QuestionKey {
            question_id: q.id.clone(),
            correct_option: q.correct_option.clone(),
        })
        .collect();
    let (scored, outcomes) = score_submission(&keys, &answers);

    for outcome in &outcomes {
        tx.execute(
            "INSERT INTO student_answers(id, submission_id, question_id,
                                         selected_option, is_correct)
             VALUES(?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                submission_id,
                outcome.question_id,
                outcome.selected_option,
                outcome.is_correct as i64,
            ],
        )
        .map_err(write_err)?;
    }

    tx.execute(
        "UPDATE exam_submissions
         SET score = ?, total_questions = ?, correct_answers = ?
         WHERE id = ?",
        rusqlite::params![
            scored.score,
            scored.total_questions as i64,
            scored.correct_answers as i64,
            submission_id,
        ],
    )
    .map_err(write_err)?;

    tx.commit().map_err(write_err)?;

    Ok(json!({
        "submissionId": submission_id,
        "score": scored.score,
        "correctAnswers": scored.correct_answers,
        "totalQuestions": scored.total_questions,
    }))
}

/// Export read model: one row per submission with the columns the CSV
/// collaborator emits, in submission-time order.
fn results(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.student_no, s.full_name, sub.score, sub.correct_answers,
                    sub.total_questions, sub.submitted_at
             FROM exam_submissions sub
             JOIN students s ON s.id = sub.student_id
             WHERE sub.exam_id = ?
             ORDER BY sub.submitted_at, s.student_no",
        )
        .map_err(db_err)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&exam.id], |r| {
            Ok(json!({
                "studentNo": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "score": r.get::<_, f64>(2)?,
                "correctAnswers": r.get::<_, i64>(3)?,
                "totalQuestions": r.get::<_, i64>(4)?,
                "submittedAt": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({
        "examId": exam.id,
        "examNo": exam.exam_no,
        "title": exam.title,
        "results": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &AppState, f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match require_db(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "exams.create" => Some(run(state, create)),
        "exams.addQuestion" => Some(run(state, add_question)),
        "exams.setActive" => Some(run(state, set_active)),
        "exams.start" => Some(run(state, start)),
        "exams.submit" => Some(run(state, submit)),
        "exams.results" => Some(run(state, results)),
        _ => None,
    }
}
