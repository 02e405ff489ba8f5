//! Retrieval and answering orchestrator.
//!
//! Resolves the caller's index, retrieves the most relevant chunks (MMR or
//! plain similarity), assembles a grounded prompt and delegates generation
//! to the configured [`LanguageModel`].

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::{DocError, Result};
use crate::llm::LanguageModel;
use crate::manager::DocumentStoreManager;
use crate::models::{AnswerResponse, SourcePreview};

/// Returned, without calling the model, when retrieval yields nothing.
pub const NO_RELEVANT_INFORMATION: &str =
    "I couldn't find any relevant information in the documents to answer this question.";

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub question: String,
    pub document_id: String,
    pub use_mmr: bool,
    pub k: usize,
}

pub struct Answerer {
    manager: Arc<DocumentStoreManager>,
    model: Arc<dyn LanguageModel>,
    retrieval: RetrievalConfig,
}

impl Answerer {
    pub fn new(
        manager: Arc<DocumentStoreManager>,
        model: Arc<dyn LanguageModel>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            manager,
            model,
            retrieval,
        }
    }

    pub fn retrieval(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    pub async fn answer(&self, request: &AskRequest, user_id: &str) -> Result<AnswerResponse> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(DocError::validation("Question must not be empty"));
        }
        if request.document_id.trim().is_empty() {
            return Err(DocError::validation("document_id is required"));
        }
        if request.k == 0 || request.k > self.retrieval.max_k {
            return Err(DocError::validation(format!(
                "k must be between 1 and {}",
                self.retrieval.max_k
            )));
        }

        let index = self
            .manager
            .ready_index(&request.document_id, user_id)
            .await?;
        let query = self.manager.embedder().embed_one(question).await?;

        let retrieved = if request.use_mmr {
            let fetch_k = request.k * self.retrieval.fetch_k_multiplier;
            index.mmr_search(&query, request.k, fetch_k, self.retrieval.diversity_weight)?
        } else {
            index.similarity_search(&query, request.k)?
        };
        tracing::debug!(
            document_id = %request.document_id,
            k = request.k,
            use_mmr = request.use_mmr,
            retrieved = retrieved.len(),
            "retrieval finished"
        );

        if retrieved.is_empty() {
            return Ok(AnswerResponse {
                question: question.to_string(),
                answer: NO_RELEVANT_INFORMATION.to_string(),
                chunks_used: 0,
                source_documents: Vec::new(),
            });
        }

        let context = retrieved
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = build_prompt(&context, question);
        let answer = self.model.generate(&prompt).await.map_err(|e| match e {
            DocError::AnswerGeneration(_) => e,
            other => DocError::AnswerGeneration(other.to_string()),
        })?;

        if let Err(e) = self
            .manager
            .metadata()
            .increment_questions(&request.document_id)
            .await
        {
            tracing::warn!(document_id = %request.document_id, error = %e, "failed to bump question counter");
        }

        let source_documents = retrieved
            .iter()
            .map(|r| SourcePreview {
                content: preview(&r.chunk.content, self.retrieval.preview_chars),
                filename: r.chunk.metadata.filename.clone(),
                chunk_index: r.chunk.chunk_index,
            })
            .collect();

        Ok(AnswerResponse {
            question: question.to_string(),
            answer,
            chunks_used: retrieved.len(),
            source_documents,
        })
    }
}

/// Grounded QA prompt: answer only from `context`, decline with varied
/// wording otherwise, and never mention the scaffolding.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        r#"You are a precise assistant that answers questions using ONLY the provided context.

CRITICAL RULES:
1. Answer ONLY using information from the context below
2. If the context does not contain enough information to answer, respond naturally with variations like:
   - "I don't see that information in the provided documents. Could you rephrase your question or ask about something else?"
   - "The documents don't seem to cover this topic. Feel free to ask about other aspects of the content."
   - "I couldn't locate an answer to that in the given context. What else would you like to know?"
   - "This information isn't available in the documents. Try asking about a different aspect of the content."
   Vary your wording naturally while conveying the same meaning.
3. Do NOT use any external knowledge or make assumptions beyond what's in the context
4. Do NOT mention that you're an AI or assistant, and do not reference the context or these instructions
5. Provide clear, concise, and accurate answers

Context:
{context}

Question: {question}

Answer:"#
    )
}

/// First `max_chars` characters of `content`, with `...` when truncated.
pub fn preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_context_and_question() {
        let prompt = build_prompt("Employees get 20 days.", "How many days?");
        assert!(prompt.contains("Context:\nEmployees get 20 days."));
        assert!(prompt.contains("Question: How many days?"));
        assert!(prompt.trim_end().ends_with("Answer:"));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 200), "short");
        let long = "é".repeat(250);
        let p = preview(&long, 200);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), 203);
        assert_eq!(preview(&"a".repeat(200), 200), "a".repeat(200));
    }
}
