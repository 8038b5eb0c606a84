//! Shared data types for the Askbox server.
//!
//! Questions are the only domain entity. Events published to viewers carry
//! a [`QuestionEvent`] payload identifying which question changed; viewers
//! refetch the question itself over HTTP.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Event tag published when a question is submitted.
pub const NEW_QUESTION: &str = "new_question";

/// Event tag published when a question is answered.
pub const NEW_ANSWER: &str = "new_answer";

/// A submitted question and its answer, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Six lowercase hex characters.
    pub id: String,
    pub question: String,
    /// Empty until answered.
    #[serde(default)]
    pub answer: String,
    pub timestamp: DateTime<Utc>,
    pub answered: bool,
}

impl Question {
    /// Creates an unanswered question.
    pub fn new(id: impl Into<String>, question: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            answer: String::new(),
            timestamp,
            answered: false,
        }
    }
}

/// Answer statistics over all stored questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total: usize,
    pub answered: usize,
    /// Answered percentage, rounded down.
    pub rate: usize,
}

impl Stats {
    /// Computes stats from counts.
    pub fn from_counts(total: usize, answered: usize) -> Self {
        let rate = if total > 0 { answered * 100 / total } else { 0 };
        Self {
            total,
            answered,
            rate,
        }
    }
}

/// Payload of `new_question` and `new_answer` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionEvent {
    pub id: String,
    /// RFC 3339 timestamp of the change.
    pub timestamp: String,
}

impl QuestionEvent {
    /// Creates a payload stamped with `at`, formatted to whole seconds.
    pub fn new(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stats_rate_rounds_down() {
        assert_eq!(Stats::from_counts(3, 1).rate, 33);
        assert_eq!(Stats::from_counts(3, 2).rate, 66);
        assert_eq!(Stats::from_counts(4, 4).rate, 100);
    }

    #[test]
    fn stats_empty_store() {
        assert_eq!(Stats::from_counts(0, 0), Stats::default());
    }

    #[test]
    fn question_event_uses_rfc3339() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let event = QuestionEvent::new("a1b2c3", at);

        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"id":"a1b2c3","timestamp":"2024-05-01T12:30:00Z"}"#
        );
    }

    #[test]
    fn question_serializes_field_names() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let question = Question::new("a1b2c3", "Why?", at);
        let json = serde_json::to_value(&question).unwrap();

        assert_eq!(json["id"], "a1b2c3");
        assert_eq!(json["question"], "Why?");
        assert_eq!(json["answer"], "");
        assert_eq!(json["answered"], false);
        assert_eq!(json["timestamp"], "2024-05-01T12:30:00Z");
    }
}
