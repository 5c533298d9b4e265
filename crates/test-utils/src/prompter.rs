use std::collections::HashMap;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use fanout::engine::{Prompter, Question};
use fanout::errors::Result;

/// Answers each prompt text with a fixed reply and records every question.
///
/// Prompts without a reply read as closed input, so the caller falls back to
/// the default.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    replies: HashMap<String, String>,
    asked: Mutex<Vec<Question>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, prompt: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies.insert(prompt.into(), reply.into());
        self
    }

    pub fn asked(&self) -> Vec<Question> {
        self.asked.lock().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask<'a>(&'a self, question: &'a Question) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            self.asked.lock().push(question.clone());
            Ok(self.replies.get(&question.prompt).cloned())
        })
    }
}
