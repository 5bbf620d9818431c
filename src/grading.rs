use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;

/// Pass mark for the PROMOTED/REPEAT decision, on the 0-100 average.
pub const PASS_MARK: f64 = 50.0;

/// Half-up 2-decimal rounding used for every stored aggregate:
/// `Int(100*x + 0.5) / 100`
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectTotals {
    pub total_ca: f64,
    pub total_score: f64,
}

/// Continuous assessment is the average of the three tests scaled to 30%,
/// the exam contributes the remaining 70%.
pub fn subject_totals(test1: f64, test2: f64, test3: f64, exam: f64) -> SubjectTotals {
    let ca_avg = (test1 + test2 + test3) / 3.0;
    let total_ca = ca_avg * 30.0 / 100.0;
    let exam_weighted = exam * 70.0 / 100.0;
    SubjectTotals {
        total_ca,
        total_score: total_ca + exam_weighted,
    }
}

pub fn grade_for(total_score: f64) -> (&'static str, &'static str) {
    if total_score >= 80.0 {
        ("A", "EXCELLENT")
    } else if total_score >= 70.0 {
        ("B", "VERY GOOD")
    } else if total_score >= 60.0 {
        ("C", "GOOD")
    } else if total_score >= 50.0 {
        ("D", "PASS")
    } else if total_score >= 40.0 {
        ("E", "POOR")
    } else {
        ("F", "FAIL")
    }
}

pub fn promotion_status(average_score: f64) -> &'static str {
    if average_score >= PASS_MARK {
        "PROMOTED"
    } else {
        "REPEAT"
    }
}

pub fn rank_label(position: usize, roster_size: usize) -> String {
    format!("{}/{}", position, roster_size)
}

/// Raw score inputs are rejected, not coerced: every value must be a finite
/// number in [0, 100].
pub fn validate_score(field: &str, value: f64) -> Result<(), GradeError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(GradeError::new(
            "bad_params",
            format!("{} must be between 0 and 100", field),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeError {
    pub code: String,
    pub message: String,
}

impl GradeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> GradeError {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return GradeError::new(
                "aggregation_conflict",
                "ranking recomputation already in progress",
            );
        }
    }
    GradeError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone)]
pub struct RankingContext<'a> {
    pub conn: &'a Connection,
    pub class_name: &'a str,
    pub term_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStanding {
    pub student_id: String,
    pub student_no: String,
    pub full_name: String,
    pub subject_count: i64,
    pub total_score: f64,
    pub average_score: f64,
    pub class_rank: String,
    pub promotion_status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStanding {
    pub subject: String,
    pub class_average: f64,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingOutcome {
    pub class_name: String,
    pub term_id: String,
    pub roster_size: usize,
    pub standings: Vec<StudentStanding>,
    pub subjects: Vec<SubjectStanding>,
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    student_no: String,
    full_name: String,
}

fn term_exists(conn: &Connection, term_id: &str) -> Result<bool, GradeError> {
    conn.query_row("SELECT 1 FROM terms WHERE id = ?", [term_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn class_roster(conn: &Connection, class_name: &str) -> Result<Vec<RosterStudent>, GradeError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, student_no, full_name
             FROM students
             WHERE class_name = ?
             ORDER BY student_no",
        )
        .map_err(db_err)?;
    stmt.query_map([class_name], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            student_no: r.get(1)?,
            full_name: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn student_term_totals(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<(f64, i64), GradeError> {
    conn.query_row(
        "SELECT COALESCE(SUM(total_score), 0), COUNT(*)
         FROM subject_scores
         WHERE student_id = ? AND term_id = ?",
        (student_id, term_id),
        |r| Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?)),
    )
    .map_err(db_err)
}

fn upsert_summary_stats(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    subject_count: i64,
    total_score: f64,
    average_score: f64,
    status: &str,
    class_rank: Option<&str>,
) -> Result<(), GradeError> {
    // Only the statistics fields (and the rank when the ranking engine is
    // the caller) are owned here; remarks, attendance and term dates are
    // manually entered and must survive every refresh.
    conn.execute(
        "INSERT INTO result_summaries(
             id, student_id, term_id, subject_count, total_score,
             average_score, class_rank, promotion_status, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, ''), ?8,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_id, term_id) DO UPDATE SET
             subject_count = excluded.subject_count,
             total_score = excluded.total_score,
             average_score = excluded.average_score,
             class_rank = COALESCE(?7, class_rank),
             promotion_status = excluded.promotion_status,
             updated_at = excluded.updated_at",
        rusqlite::params![
            uuid::Uuid::new_v4().to_string(),
            student_id,
            term_id,
            subject_count,
            total_score,
            average_score,
            class_rank,
            status,
        ],
    )
    .map(|_| ())
    .map_err(db_err)
}

/// Recompute class rank, per-student summary statistics and per-subject
/// class averages/ranks for one (class, term). Runs as a single transaction;
/// re-running with unchanged inputs yields identical output.
pub fn recompute_class_ranking(ctx: &RankingContext<'_>) -> Result<RankingOutcome, GradeError> {
    let tx = ctx.conn.unchecked_transaction().map_err(db_err)?;

    if !term_exists(&tx, ctx.term_id)? {
        return Err(GradeError::new("not_found", "term not found"));
    }
    let roster = class_roster(&tx, ctx.class_name)?;
    if roster.is_empty() {
        return Err(GradeError::new("not_found", "class has no students"));
    }
    let roster_size = roster.len();

    let mut totals: Vec<(RosterStudent, f64, i64)> = Vec::with_capacity(roster_size);
    for s in roster {
        let (total, count) = student_term_totals(&tx, &s.id, ctx.term_id)?;
        totals.push((s, total, count));
    }

    // Total descending; equal totals fall back to student number so the
    // ordering is deterministic across runs.
    totals.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.student_no.cmp(&b.0.student_no))
    });

    let mut standings: Vec<StudentStanding> = Vec::with_capacity(roster_size);
    for (pos, (s, total, count)) in totals.iter().enumerate() {
        let total_score = round2(*total);
        let average_score = if *count > 0 {
            round2(*total / (*count as f64))
        } else {
            0.0
        };
        let class_rank = rank_label(pos + 1, roster_size);
        let status = promotion_status(average_score);
        upsert_summary_stats(
            &tx,
            &s.id,
            ctx.term_id,
            *count,
            total_score,
            average_score,
            status,
            Some(&class_rank),
        )?;
        standings.push(StudentStanding {
            student_id: s.id.clone(),
            student_no: s.student_no.clone(),
            full_name: s.full_name.clone(),
            subject_count: *count,
            total_score,
            average_score,
            class_rank,
            promotion_status: status.to_string(),
        });
    }

    let subjects = recompute_subject_standings(&tx, ctx.class_name, ctx.term_id)?;

    tx.commit().map_err(db_err)?;

    Ok(RankingOutcome {
        class_name: ctx.class_name.to_string(),
        term_id: ctx.term_id.to_string(),
        roster_size,
        standings,
        subjects,
    })
}

fn recompute_subject_standings(
    conn: &Connection,
    class_name: &str,
    term_id: &str,
) -> Result<Vec<SubjectStanding>, GradeError> {
    let mut subj_stmt = conn
        .prepare(
            "SELECT DISTINCT ss.subject
             FROM subject_scores ss
             JOIN students s ON s.id = ss.student_id
             WHERE ss.term_id = ? AND s.class_name = ?
             ORDER BY ss.subject",
        )
        .map_err(db_err)?;
    let subjects: Vec<String> = subj_stmt
        .query_map((term_id, class_name), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out: Vec<SubjectStanding> = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let mut rows_stmt = conn
            .prepare(
                "SELECT ss.id, ss.total_score, s.student_no
                 FROM subject_scores ss
                 JOIN students s ON s.id = ss.student_id
                 WHERE ss.term_id = ? AND ss.subject = ? AND s.class_name = ?",
            )
            .map_err(db_err)?;
        let mut rows: Vec<(String, f64, String)> = rows_stmt
            .query_map((term_id, &subject, class_name), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        if rows.is_empty() {
            continue;
        }

        let sum: f64 = rows.iter().map(|(_, t, _)| *t).sum();
        let class_average = round2(sum / (rows.len() as f64));
        conn.execute(
            "UPDATE subject_scores SET class_average = ?
             WHERE term_id = ? AND subject = ?
               AND student_id IN (SELECT id FROM students WHERE class_name = ?)",
            rusqlite::params![class_average, term_id, subject, class_name],
        )
        .map_err(db_err)?;

        rows.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.2.cmp(&b.2))
        });
        for (pos, (row_id, _, _)) in rows.iter().enumerate() {
            conn.execute(
                "UPDATE subject_scores SET subject_rank = ? WHERE id = ?",
                ((pos + 1) as i64, row_id),
            )
            .map_err(db_err)?;
        }

        out.push(SubjectStanding {
            subject,
            class_average,
            row_count: rows.len(),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub student_id: String,
    pub term_id: String,
    pub subject_count: i64,
    pub total_score: f64,
    pub average_score: f64,
    pub promotion_status: String,
}

/// Recompute one student's summary statistics from their current subject
/// rows. Rank is a whole-class concern and is left to the ranking engine.
pub fn refresh_summary(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<SummaryStats, GradeError> {
    let student_known: bool = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err)?;
    if !student_known {
        return Err(GradeError::new("not_found", "student not found"));
    }
    if !term_exists(conn, term_id)? {
        return Err(GradeError::new("not_found", "term not found"));
    }

    let (total, count) = student_term_totals(conn, student_id, term_id)?;
    let total_score = round2(total);
    let average_score = if count > 0 {
        round2(total / (count as f64))
    } else {
        0.0
    };
    let status = promotion_status(average_score);
    upsert_summary_stats(
        conn,
        student_id,
        term_id,
        count,
        total_score,
        average_score,
        status,
        None,
    )?;

    Ok(SummaryStats {
        student_id: student_id.to_string(),
        term_id: term_id.to_string(),
        subject_count: count,
        total_score,
        average_score,
        promotion_status: status.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_half_up() {
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(76.5), 76.5);
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(round2(52.375), 52.38);
    }

    #[test]
    fn subject_totals_example_scenario() {
        // test 80/70/90, exam 75: ca avg 80 -> 24.0 CA, 52.5 exam, 76.5 total
        let t = subject_totals(80.0, 70.0, 90.0, 75.0);
        assert!((t.total_ca - 24.0).abs() < 1e-9);
        assert!((t.total_score - 76.5).abs() < 1e-9);
        assert_eq!(grade_for(t.total_score), ("B", "VERY GOOD"));
    }

    #[test]
    fn grade_thresholds_are_inclusive_lower_bounds() {
        assert_eq!(grade_for(100.0).0, "A");
        assert_eq!(grade_for(80.0).0, "A");
        assert_eq!(grade_for(79.99).0, "B");
        assert_eq!(grade_for(70.0).0, "B");
        assert_eq!(grade_for(69.99).0, "C");
        assert_eq!(grade_for(60.0).0, "C");
        assert_eq!(grade_for(59.99).0, "D");
        assert_eq!(grade_for(50.0), ("D", "PASS"));
        assert_eq!(grade_for(49.99), ("E", "POOR"));
        assert_eq!(grade_for(40.0).0, "E");
        assert_eq!(grade_for(39.99), ("F", "FAIL"));
        assert_eq!(grade_for(0.0).0, "F");
    }

    #[test]
    fn promotion_threshold_at_pass_mark() {
        assert_eq!(promotion_status(50.0), "PROMOTED");
        assert_eq!(promotion_status(49.99), "REPEAT");
        assert_eq!(promotion_status(0.0), "REPEAT");
    }

    #[test]
    fn rank_label_counts_full_roster() {
        assert_eq!(rank_label(1, 21), "1/21");
        assert_eq!(rank_label(21, 21), "21/21");
    }

    #[test]
    fn validate_score_rejects_out_of_range() {
        assert!(validate_score("test1", 0.0).is_ok());
        assert!(validate_score("test1", 100.0).is_ok());
        assert!(validate_score("test1", -0.01).is_err());
        assert!(validate_score("exam", 100.01).is_err());
        assert!(validate_score("exam", f64::NAN).is_err());
        let e = validate_score("test2", 101.0).unwrap_err();
        assert_eq!(e.code, "bad_params");
    }
}
