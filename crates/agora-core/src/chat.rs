//! Answer generation boundary: message types, the [`ChatModel`] trait, and prompt
//! composition from retrieved passages and conversation history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::RetrievalResult;

/// Placeholder in [`SYSTEM_TEMPLATE`] replaced by the retrieved passages.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

pub const SYSTEM_TEMPLATE: &str = "\
You are a philosophical assistant specializing in Fyodor Dostoevsky's works and existentialist philosophy.

Response guidelines:
1. Answer directly and naturally; do not always start with a greeting.
2. For questions about Dostoevsky's texts (The Brothers Karamazov, Crime and Punishment and others), use the context below for accurate quotes and references.
3. For general philosophical questions, draw on philosophical knowledge and connect it to Dostoevskian themes when appropriate.
4. Keep answers concise: two or three short paragraphs, at most about 200 words.
5. Answer in the language of the question.

Context from the corpus (use when relevant):
{context}

If the user shows signs of crisis, recommend professional help.";

/// Opening of the request that turns a follow-up into a standalone question.
pub const CONDENSE_INSTRUCTION: &str = "Given the following conversation and a follow-up question, \
rephrase the follow-up question to be a standalone question, in its original language. \
Reply with the standalone question only.";

const NO_CONTEXT: &str = "(no matching passages)";
const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Completes the conversation in `messages` and returns the reply text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError>;
}

/// System message with the passages filled in, then the prior turns, then the question.
pub fn build_prompt(
    context: &[RetrievalResult],
    history: &[ChatMessage],
    question: &str,
) -> Vec<ChatMessage> {
    let passages = if context.is_empty() {
        NO_CONTEXT.to_string()
    } else {
        context
            .iter()
            .map(|hit| hit.chunk.text.trim())
            .collect::<Vec<_>>()
            .join(PASSAGE_SEPARATOR)
    };
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(
        SYSTEM_TEMPLATE.replace(CONTEXT_PLACEHOLDER, &passages),
    ));
    messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
    messages.push(ChatMessage::user(question));
    messages
}

/// Single user message asking the model to rewrite `question` so that it can be
/// understood without `history`.
pub fn condense_prompt(history: &[ChatMessage], question: &str) -> Vec<ChatMessage> {
    let transcript = history
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(format!("Human: {}", m.content)),
            Role::Assistant => Some(format!("Assistant: {}", m.content)),
            Role::System => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    vec![ChatMessage::user(format!(
        "{CONDENSE_INSTRUCTION}\n\nChat history:\n{transcript}\nFollow-up question: {question}\nStandalone question:"
    ))]
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Request(String),
    #[error("chat API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("chat API returned no content")]
    EmptyResponse,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::chunks::Chunk;

    fn hit(text: &str) -> RetrievalResult {
        RetrievalResult {
            id: 0,
            chunk: Chunk {
                text: text.to_string(),
                metadata: BTreeMap::new(),
            },
            score: 1.0,
        }
    }

    #[test]
    fn prompt_orders_system_history_question() {
        let history = vec![
            ChatMessage::user("Who is Alyosha?"),
            ChatMessage::assistant("The youngest Karamazov brother."),
        ];
        let prompt = build_prompt(
            &[hit("Alyosha was the youngest."), hit("He lived in the monastery.")],
            &history,
            "And Ivan?",
        );
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[0].content.contains("Alyosha was the youngest.\n\n---\n\nHe lived"));
        assert!(!prompt[0].content.contains(CONTEXT_PLACEHOLDER));
        assert_eq!(&prompt[1..3], history.as_slice());
        assert_eq!(prompt[3], ChatMessage::user("And Ivan?"));
    }

    #[test]
    fn empty_context_is_stated() {
        let prompt = build_prompt(&[], &[ChatMessage::system("stale")], "Why?");
        assert_eq!(prompt.len(), 2);
        assert!(prompt[0].content.contains(NO_CONTEXT));
    }

    #[test]
    fn system_prompt_asks_for_the_question_language() {
        let prompt = build_prompt(&[hit("Il était une fois.")], &[], "Qui est Ivan ?");
        assert!(prompt[0].content.contains("Answer in the language of the question."));
        assert_eq!(prompt[1], ChatMessage::user("Qui est Ivan ?"));
    }

    #[test]
    fn condense_prompt_carries_transcript_and_follow_up() {
        let history = vec![
            ChatMessage::system("ignored"),
            ChatMessage::user("Who is Alyosha?"),
            ChatMessage::assistant("The youngest Karamazov brother."),
        ];
        let prompt = condense_prompt(&history, "And Ivan?");
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].role, Role::User);
        let text = &prompt[0].content;
        assert!(text.starts_with(CONDENSE_INSTRUCTION));
        assert!(text.contains("Human: Who is Alyosha?\nAssistant: The youngest Karamazov brother."));
        assert!(text.contains("Follow-up question: And Ivan?"));
        assert!(!text.contains("ignored"));
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
