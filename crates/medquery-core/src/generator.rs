//! Answer generation
//!
//! [`AnswerGenerator`] is the seam where a retrieval-and-generation model
//! plugs in. Generation is pure and synchronous: it never touches the log
//! store and never suspends.

use crate::{QueryRequest, QueryResponse, Result};

/// Produces an answer and its contexts for a validated query
pub trait AnswerGenerator: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Generate the response. Answer and contexts are returned together.
    fn generate(&self, request: &QueryRequest) -> Result<QueryResponse>;
}

/// Deterministic template-based stand-in for a RAG model
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderGenerator;

impl AnswerGenerator for PlaceholderGenerator {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn generate(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let contexts = vec![
            format!("Placeholder context 1 for query: '{}'", request.query),
            format!("Placeholder context 2 (top_k={})", request.top_k),
        ];
        let answer = format!("This is a placeholder answer for '{}'.", request.query);

        Ok(QueryResponse { answer, contexts })
    }
}
