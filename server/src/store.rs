//! In-memory question store.
//!
//! Questions live for the lifetime of the process. The store is shared by
//! all request handlers behind a single reader/writer lock; no operation
//! holds it across an await point or while touching another component.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use crate::types::{Question, Stats};

/// Number of random bytes in a question id.
pub const ID_BYTES: usize = 3;

/// Shared question storage.
#[derive(Debug, Default)]
pub struct QuestionStore {
    questions: RwLock<HashMap<String, Question>>,
}

impl QuestionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new unanswered question and returns it.
    pub fn create(&self, text: &str, at: DateTime<Utc>) -> Question {
        let mut questions = self.write();

        let id = loop {
            let candidate = generate_id();
            if !questions.contains_key(&candidate) {
                break candidate;
            }
        };

        let question = Question::new(id.clone(), text, at);
        questions.insert(id, question.clone());
        debug!(question_id = %question.id, total = questions.len(), "Question stored");
        question
    }

    /// Records an answer. Returns `None` if the id is unknown.
    ///
    /// Answering again replaces the previous answer.
    pub fn answer(&self, id: &str, answer: &str) -> Option<Question> {
        let mut questions = self.write();
        let question = questions.get_mut(id)?;
        question.answer = answer.to_owned();
        question.answered = true;
        Some(question.clone())
    }

    /// Looks up a question by id.
    pub fn get(&self, id: &str) -> Option<Question> {
        self.read().get(id).cloned()
    }

    /// Lists questions newest first.
    ///
    /// Unanswered questions are only included when `include_unanswered` is
    /// set.
    pub fn list(&self, include_unanswered: bool) -> Vec<Question> {
        let mut listed: Vec<Question> = self
            .read()
            .values()
            .filter(|q| include_unanswered || q.answered)
            .cloned()
            .collect();

        listed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        listed
    }

    /// Answer statistics across every stored question.
    pub fn stats(&self) -> Stats {
        let questions = self.read();
        let answered = questions.values().filter(|q| q.answered).count();
        Stats::from_counts(questions.len(), answered)
    }

    /// Number of stored questions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Question>> {
        self.questions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Question>> {
        self.questions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Six lowercase hex characters from three random bytes.
fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
