//! Question answering over a ready index: retrieve, prompt, complete, remember.

use std::sync::Arc;

use tracing::{debug, info};

use crate::chat::{build_prompt, condense_prompt, ChatError, ChatMessage, ChatModel, Role};
use crate::embedding::EmbedError;
use crate::history::{validate_session_id, HistoryError, HistoryStore, Turn};
use crate::retriever::Retriever;

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    /// Source document of each passage used, best match first, without repeats.
    pub sources: Vec<String>,
}

pub struct Assistant {
    retriever: Retriever,
    chat: Arc<dyn ChatModel>,
    history: HistoryStore,
}

impl Assistant {
    pub fn new(retriever: Retriever, chat: Arc<dyn ChatModel>, history: HistoryStore) -> Self {
        Self {
            retriever,
            chat,
            history,
        }
    }

    /// Answers `question` in the context of `session` and records both turns. A follow-up
    /// in a session with history is first rewritten into a standalone question, and that
    /// rewrite is what gets retrieved for.
    pub async fn ask(&self, session: &str, question: &str) -> Result<Answer, AssistantError> {
        validate_session_id(session)?;
        let question = question.trim();
        if question.is_empty() {
            return Err(AssistantError::EmptyQuestion);
        }

        let past = self.history.load(session)?;
        let history: Vec<_> = past.iter().map(Turn::to_message).collect();
        let search = self.standalone_question(&history, question).await?;
        let hits = self.retriever.retrieve(&search).await?;
        let messages = build_prompt(&hits, &history, question);
        let text = self.chat.complete(&messages).await?;

        self.history.append(
            session,
            &[Turn::new(Role::User, question), Turn::new(Role::Assistant, text.as_str())],
        )?;

        let mut sources: Vec<String> = Vec::new();
        for source in hits.iter().filter_map(|h| h.chunk.source()) {
            if !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }
        info!(session, passages = hits.len(), prior_turns = past.len(), "answered question");
        Ok(Answer { text, sources })
    }

    async fn standalone_question(
        &self,
        history: &[ChatMessage],
        question: &str,
    ) -> Result<String, ChatError> {
        if history.is_empty() {
            return Ok(question.to_string());
        }
        let rewritten = self.chat.complete(&condense_prompt(history, question)).await?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Ok(question.to_string());
        }
        debug!(question, standalone = rewritten, "condensed follow-up question");
        Ok(rewritten.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("question is empty")]
    EmptyQuestion,
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] EmbedError),
    #[error("answer generation failed: {0}")]
    Chat(#[from] ChatError),
    #[error("chat history: {0}")]
    History(#[from] HistoryError),
}
