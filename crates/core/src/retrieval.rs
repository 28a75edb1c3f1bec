//! Retrieval collaborator trait.
//!
//! Knowledge-base and long-term-memory lookups share one contract: given a
//! query, return the top-k snippets ranked by relevance. Indexing,
//! embeddings, and storage are entirely the implementation's business —
//! the engine only consumes ranked text through the context assembler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One retrieved piece of text with provenance and a relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    /// The retrieved text
    pub text: String,

    /// Where it came from (document id, memory key, url, ...)
    pub source: String,

    /// Relevance score, higher is better
    pub score: f32,
}

/// A ranked-retrieval source (knowledge base, long-term memory, ...).
#[async_trait]
pub trait Retriever: Send + Sync {
    /// A label for logs and zone reports.
    fn name(&self) -> &str;

    /// Return up to `k` snippets relevant to `query`, best first.
    async fn search(&self, query: &str, k: usize) -> Vec<Snippet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRetriever(Vec<Snippet>);

    #[async_trait]
    impl Retriever for FixedRetriever {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn search(&self, _query: &str, k: usize) -> Vec<Snippet> {
            self.0.iter().take(k).cloned().collect()
        }
    }

    #[tokio::test]
    async fn search_respects_k() {
        let retriever = FixedRetriever(vec![
            Snippet {
                text: "a".into(),
                source: "doc1".into(),
                score: 0.9,
            },
            Snippet {
                text: "b".into(),
                source: "doc2".into(),
                score: 0.5,
            },
        ]);
        let hits = retriever.search("anything", 1).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "doc1");
    }
}
