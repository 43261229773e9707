//! Retrieval collaborator and prompt context formatting.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, instrument};

use celia_artifacts::truncate_text;
use celia_shared::{CeliaError, Result, Snippet};
use celia_storage::Storage;

/// Returns ranked snippets for a query. An empty result is not an error.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        query: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Snippet>>> + Send;
}

/// Retriever that never returns anything.
pub struct NoRetrieval;

impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<Snippet>> {
        Ok(Vec::new())
    }
}

/// Full-text retrieval over the local snippet corpus.
pub struct CorpusRetriever {
    storage: Arc<Storage>,
}

impl CorpusRetriever {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl Retriever for CorpusRetriever {
    #[instrument(skip_all, fields(limit = limit))]
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Snippet>> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let snippets = self
            .storage
            .search_snippets(query, limit)
            .await
            .map_err(|e| CeliaError::Retrieval(e.to_string()))?;
        debug!(found = snippets.len(), "corpus search finished");
        Ok(snippets)
    }
}

/// Render snippets as a numbered context block within `max_chars`.
///
/// Snippets are taken in rank order; the one that crosses the budget is
/// truncated and the rest are dropped.
pub fn format_context(snippets: &[Snippet], max_chars: usize) -> String {
    let mut out = String::new();
    for (i, snippet) in snippets.iter().enumerate() {
        let header = match snippet.page {
            Some(page) => format!("[{}] {} (p. {page})\n", i + 1, snippet.source_title),
            None => format!("[{}] {}\n", i + 1, snippet.source_title),
        };
        let used = out.chars().count() + header.chars().count();
        if used >= max_chars {
            break;
        }
        let remaining = max_chars - used;
        let body = truncate_text(snippet.text.trim(), remaining, " [...]");
        let truncated = body.chars().count() < snippet.text.trim().chars().count();

        out.push_str(&header);
        out.push_str(&body);
        out.push_str("\n\n");
        if truncated {
            break;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(title: &str, text: &str, page: Option<u32>) -> Snippet {
        Snippet {
            text: text.into(),
            source_title: title.into(),
            source_id: title.to_lowercase(),
            page,
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn no_retrieval_is_empty() {
        let found = NoRetrieval.retrieve("portátiles", 5).await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn context_numbers_sources() {
        let snippets = [
            snippet("LCSP art. 28", "Necesidad e idoneidad.", Some(3)),
            snippet("LCSP art. 99", "Lotes.", None),
        ];
        let ctx = format_context(&snippets, 1000);
        assert_eq!(
            ctx,
            "[1] LCSP art. 28 (p. 3)\nNecesidad e idoneidad.\n\n[2] LCSP art. 99\nLotes."
        );
    }

    #[test]
    fn context_respects_budget() {
        let long = "palabra ".repeat(100);
        let snippets = [snippet("A", &long, None), snippet("B", "nunca aparece", None)];
        let ctx = format_context(&snippets, 60);
        assert!(ctx.chars().count() <= 60 + " [...]".len());
        assert!(ctx.contains("[...]"));
        assert!(!ctx.contains("[2]"));
    }

    #[test]
    fn empty_context() {
        assert_eq!(format_context(&[], 100), "");
    }

    #[tokio::test]
    async fn corpus_retriever_reads_storage() {
        let tmp = std::env::temp_dir().join(format!("celia_retrieval_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        storage
            .insert_snippet("lcsp-116", "LCSP artículo 116", None, "El expediente de contratación incluirá la justificación de la necesidad")
            .await
            .unwrap();

        let retriever = CorpusRetriever::new(Arc::new(storage));
        let found = retriever.retrieve("justificación necesidad", 3).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, "lcsp-116");
    }
}
