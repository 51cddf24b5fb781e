use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    chunking::Chunk,
    embedding::Embedder,
    error::{Error, Result},
    index::EmbeddingIndex,
};

/// A chunk returned for a query, with its cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// Query-time top-k retrieval over an index snapshot.
pub struct Retriever {
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn Embedder>,
    min_score: Option<f32>,
}

impl Retriever {
    /// Pair an index snapshot with the embedder that will embed queries.
    ///
    /// Fails with [`Error::DimensionMismatch`] unless the embedder produces
    /// vectors in the index's embedding space.
    pub fn new(
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let expected = embedder.tag();
        if &expected != index.tag() {
            return Err(Error::DimensionMismatch {
                expected,
                found: index.tag().clone(),
            });
        }
        Ok(Self {
            index,
            embedder,
            min_score: None,
        })
    }

    /// Drop results scoring below `min_score`.
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    /// Return the `k` chunks most similar to `query`, best first.
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query)?;
        let hits = self.index.search(&vector, k)?;

        let results: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|(_, score)| self.min_score.is_none_or(|min| *score >= min))
            .filter_map(|(chunk_id, score)| {
                let chunk = self.index.chunk(chunk_id)?.clone();
                Some(RetrievalResult { chunk, score })
            })
            .collect();

        debug!(query, k, results = results.len(), "retrieved chunks");
        Ok(results)
    }
}

/// Render retrieved chunks as the context handed to answer generation.
///
/// Each chunk becomes a `[Source: <document> - Page <page>]` header line
/// followed by its text; blocks are separated by a blank line.
pub fn build_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|r| {
            format!(
                "[Source: {} - Page {}]\n{}",
                r.chunk.source_document, r.chunk.page, r.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (rank, r) in results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] {} p.{}",
            rank + 1,
            r.score,
            r.chunk.source_document,
            r.chunk.page_range,
        );
        println!(
            "     {}",
            crate::text_util::excerpt(&r.chunk.text, 100)
        );
    }
    println!("\n{} result(s)", results.len());
}

/// Format results as JSON output.
pub fn format_json(results: &[RetrievalResult], query: &str) -> Result<()> {
    let results: Vec<serde_json::Value> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            serde_json::json!({
                "rank": i + 1,
                "score": r.score,
                "chunk_id": r.chunk.chunk_id,
                "document": r.chunk.source_document,
                "page": r.chunk.page,
                "page_range": r.chunk.page_range,
                "text": r.chunk.text,
            })
        })
        .collect();

    let output = serde_json::json!({
        "query": query,
        "result_count": results.len(),
        "results": results,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn chunk(id: u64, doc: &str, page: u32, text: &str) -> Chunk {
        Chunk {
            chunk_id: id,
            text: text.to_string(),
            source_document: doc.to_string(),
            page,
            page_range: page.to_string(),
            word_count: text.split_whitespace().count(),
            file_path: None,
            start_offset: 0,
        }
    }

    fn retriever() -> Retriever {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let chunks = vec![
            chunk(0, "diabetes.pdf", 4, "Metformin is first-line therapy in type 2 diabetes."),
            chunk(1, "cardio.pdf", 12, "Statins lower LDL cholesterol and cardiovascular risk."),
            chunk(2, "pulm.pdf", 7, "Inhaled corticosteroids control persistent asthma."),
        ];
        let index = EmbeddingIndex::build(chunks, embedder.as_ref()).unwrap();
        Retriever::new(Arc::new(index), embedder).unwrap()
    }

    #[test]
    fn retrieves_most_similar_first() {
        let results = retriever().retrieve("metformin diabetes", 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.chunk_id, 0);
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn retrieval_is_idempotent() {
        let r = retriever();
        let a = r.retrieve("asthma inhaler", 3).unwrap();
        let b = r.retrieve("asthma inhaler", 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_k_returns_nothing() {
        assert!(retriever().retrieve("statins", 0).unwrap().is_empty());
    }

    #[test]
    fn empty_index_returns_nothing() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(32));
        let index = EmbeddingIndex::build(Vec::new(), embedder.as_ref()).unwrap();
        let r = Retriever::new(Arc::new(index), embedder).unwrap();
        assert!(r.retrieve("anything", 5).unwrap().is_empty());
    }

    #[test]
    fn min_score_filters_weak_matches() {
        let r = retriever().with_min_score(Some(0.99));
        assert!(r.retrieve("orthopedic surgery", 3).unwrap().is_empty());
    }

    #[test]
    fn mismatched_embedder_is_refused() {
        let built_with = HashingEmbedder::new(64);
        let index = EmbeddingIndex::build(Vec::new(), &built_with).unwrap();
        let other: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        let err = Retriever::new(Arc::new(index), other).err().unwrap();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn context_blocks_carry_source_headers() {
        let results = vec![
            RetrievalResult {
                chunk: chunk(0, "a.pdf", 3, "First passage."),
                score: 0.9,
            },
            RetrievalResult {
                chunk: chunk(1, "b.pdf", 8, "Second passage."),
                score: 0.5,
            },
        ];
        assert_eq!(
            build_context(&results),
            "[Source: a.pdf - Page 3]\nFirst passage.\n\n[Source: b.pdf - Page 8]\nSecond passage."
        );
    }
}
