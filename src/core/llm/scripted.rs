//! Replays canned completions in order and records every request.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{Completion, CompletionRequest, ReasoningBackend};

pub enum Scripted {
    Reply(Completion),
    Fail(String),
}

pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Completion>) -> Self {
        Self::with_script(replies.into_iter().map(Scripted::Reply).collect())
    }

    pub fn with_script(script: Vec<Scripted>) -> Self {
        Self {
            replies: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.seen.lock().unwrap().push(request);
        match self.replies.lock().unwrap().pop_front() {
            Some(Scripted::Reply(c)) => Ok(c),
            Some(Scripted::Fail(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("scripted backend exhausted")),
        }
    }
}
