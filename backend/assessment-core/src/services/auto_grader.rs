//! Objective answer checking.
//!
//! Objective questions are all-or-nothing: a correct payload earns the
//! question's full points, anything else earns zero.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::models::{Question, QuestionType};

/// Score and correctness for an objective answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoGrade {
    pub score: f64,
    pub is_correct: bool,
}

/// Returns `None` when the answer needs a human: subjective question types,
/// or objective ones without a correct-answer definition.
pub fn evaluate(question: &Question, payload: &Value, points: i32) -> Option<AutoGrade> {
    if !question.question_type.is_objective() {
        return None;
    }
    let expected = question.correct_answer.as_ref()?;

    let is_correct = match question.question_type {
        QuestionType::SingleChoice => scalar_text(payload)
            .zip(scalar_text(expected))
            .is_some_and(|(given, wanted)| given == wanted),
        QuestionType::TrueFalse => as_bool(payload)
            .zip(as_bool(expected))
            .is_some_and(|(given, wanted)| given == wanted),
        QuestionType::MultipleChoice => choice_set(payload)
            .zip(choice_set(expected))
            .is_some_and(|(given, wanted)| given == wanted),
        QuestionType::ShortAnswer => match scalar_text(payload) {
            Some(given) => accepted_answers(expected).contains(&given),
            None => false,
        },
        QuestionType::Essay | QuestionType::FileUpload => return None,
    };

    Some(AutoGrade {
        score: if is_correct { f64::from(points) } else { 0.0 },
        is_correct,
    })
}

/// Trims, lowercases and collapses inner whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(normalize(s)),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match normalize(s).as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn choice_set(value: &Value) -> Option<BTreeSet<String>> {
    match value {
        Value::Array(items) => items.iter().map(scalar_text).collect(),
        _ => None,
    }
}

fn accepted_answers(expected: &Value) -> Vec<String> {
    match expected {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(question_type: QuestionType, correct: Option<Value>) -> Question {
        Question {
            id: "q1".into(),
            title: "Q".into(),
            question_type,
            points: 10,
            correct_answer: correct,
        }
    }

    #[test]
    fn single_choice_ignores_case_and_spacing() {
        let q = question(QuestionType::SingleChoice, Some(json!("Paris")));
        assert_eq!(
            evaluate(&q, &json!("  paris "), 10),
            Some(AutoGrade {
                score: 10.0,
                is_correct: true
            })
        );
        assert_eq!(evaluate(&q, &json!("Lyon"), 10).map(|g| g.score), Some(0.0));
    }

    #[test]
    fn multiple_choice_is_set_equality() {
        let q = question(QuestionType::MultipleChoice, Some(json!(["a", "c"])));
        assert!(evaluate(&q, &json!(["c", "a"]), 4).unwrap().is_correct);
        assert!(!evaluate(&q, &json!(["a"]), 4).unwrap().is_correct);
        assert!(!evaluate(&q, &json!("a"), 4).unwrap().is_correct);
    }

    #[test]
    fn true_false_accepts_strings() {
        let q = question(QuestionType::TrueFalse, Some(json!(true)));
        assert!(evaluate(&q, &json!("TRUE"), 1).unwrap().is_correct);
        assert!(!evaluate(&q, &json!(false), 1).unwrap().is_correct);
    }

    #[test]
    fn short_answer_matches_any_accepted() {
        let q = question(
            QuestionType::ShortAnswer,
            Some(json!(["H2O", "water"])),
        );
        assert!(evaluate(&q, &json!("Water"), 2).unwrap().is_correct);
        assert!(!evaluate(&q, &json!("ice"), 2).unwrap().is_correct);
    }

    #[test]
    fn subjective_or_undefined_stays_pending() {
        let essay = question(QuestionType::Essay, Some(json!("anything")));
        assert_eq!(evaluate(&essay, &json!("text"), 5), None);

        let undefined = question(QuestionType::SingleChoice, None);
        assert_eq!(evaluate(&undefined, &json!("a"), 5), None);
    }
}
