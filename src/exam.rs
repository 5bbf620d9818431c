use crate::grading::round2;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// The canonical scoring view of one question: identity plus correct tag.
#[derive(Debug, Clone)]
pub struct QuestionKey {
    pub question_id: String,
    pub correct_option: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOutcome {
    pub question_id: String,
    pub selected_option: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredSubmission {
    pub total_questions: usize,
    pub correct_answers: usize,
    pub score: f64,
}

pub fn is_valid_option(s: &str) -> bool {
    matches!(s, "A" | "B" | "C" | "D")
}

/// Score answers against the canonical question order. An absent answer
/// counts as incorrect and produces no outcome row; correctness is decided
/// here once and never recomputed.
pub fn score_submission(
    questions: &[QuestionKey],
    answers: &HashMap<String, String>,
) -> (ScoredSubmission, Vec<AnswerOutcome>) {
    let mut outcomes: Vec<AnswerOutcome> = Vec::new();
    let mut correct = 0usize;

    for q in questions {
        let Some(selected) = answers.get(&q.question_id) else {
            continue;
        };
        let is_correct = *selected == q.correct_option;
        if is_correct {
            correct += 1;
        }
        outcomes.push(AnswerOutcome {
            question_id: q.question_id.clone(),
            selected_option: selected.clone(),
            is_correct,
        });
    }

    let total = questions.len();
    let score = if total > 0 {
        round2(100.0 * (correct as f64) / (total as f64))
    } else {
        0.0
    };
    (
        ScoredSubmission {
            total_questions: total,
            correct_answers: correct,
            score,
        },
        outcomes,
    )
}

/// Fresh permutation per call; the displayed order is never persisted and
/// scoring always walks the canonical stored order.
pub fn shuffle_for_view<T>(items: &mut [T]) {
    items.shuffle(&mut rand::thread_rng());
}
