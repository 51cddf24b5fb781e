//! A query session: one index snapshot, its embedder and an answer
//! generator, shared by every query.

use std::{
    path::Path,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    chunking::Chunk,
    citation::{self, Citation},
    config::{Config, RetrievalConfig},
    embedding::Embedder,
    error::{Error, Result},
    generation::{Answer, AnswerGenerator},
    index::{EmbeddingIndex, Manifest},
    retriever::{RetrievalResult, Retriever, build_context},
};

/// Everything produced for one question.
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub question: String,
    pub answer: Answer,
    pub citations: Vec<Citation>,
    pub results: Vec<RetrievalResult>,
    /// Set when retrieval did not finish within the configured timeout.
    pub retrieval_timed_out: bool,
    /// Why retrieval failed, when the answer was produced without context.
    pub retrieval_error: Option<String>,
    pub total_latency: Duration,
}

pub struct Session {
    index: RwLock<Arc<EmbeddingIndex>>,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalConfig,
    generator: AnswerGenerator,
}

impl Session {
    /// Create a session over an index built with `embedder`.
    pub fn new(
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn Embedder>,
        retrieval: RetrievalConfig,
        generator: AnswerGenerator,
    ) -> Result<Self> {
        check_tag(&index, embedder.as_ref())?;
        Ok(Self {
            index: RwLock::new(index),
            embedder,
            retrieval,
            generator,
        })
    }

    /// Load the index in `index_dir` together with the embedder recorded
    /// in its manifest.
    pub fn open(index_dir: &Path, config: &Config) -> Result<Self> {
        let manifest = Manifest::read(index_dir)?;
        let embedder = manifest.embedder.open(index_dir)?;
        let index = EmbeddingIndex::load(index_dir, &embedder.tag())?;
        let generator = AnswerGenerator::new(&config.generation)?;
        Self::new(Arc::new(index), embedder, config.retrieval, generator)
    }

    /// The current index. Callers keep their snapshot across a swap.
    pub fn snapshot(&self) -> Arc<EmbeddingIndex> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the index with a rebuilt one in the same embedding space.
    pub fn swap_index(&self, index: Arc<EmbeddingIndex>) -> Result<()> {
        check_tag(&index, self.embedder.as_ref())?;
        let mut current = self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = index;
        Ok(())
    }

    pub fn generator(&self) -> &AnswerGenerator {
        &self.generator
    }

    pub fn retrieval_config(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Retrieve the `k` chunks most relevant to `query`.
    ///
    /// Runs on the blocking pool and fails with
    /// [`Error::RetrievalTimeout`] when it takes longer than the configured
    /// timeout.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        let retriever = Retriever::new(self.snapshot(), Arc::clone(&self.embedder))?
            .with_min_score(self.retrieval.min_score);
        let query = query.to_string();
        let task = tokio::task::spawn_blocking(move || retriever.retrieve(&query, k));
        within(self.retrieval.timeout, task).await
    }

    /// Generate an answer to `question` grounded in `results`.
    pub async fn generate(&self, question: &str, results: &[RetrievalResult]) -> Answer {
        let context = build_context(results);
        self.generator.generate(question, &context).await
    }

    /// Citations for `results`, with excerpts centered on `query`.
    pub fn resolve(&self, results: &[RetrievalResult], query: &str) -> Vec<Citation> {
        results
            .iter()
            .map(|r| citation::resolve_for_query(&r.chunk, query))
            .collect()
    }

    /// Citation for a single chunk.
    pub fn resolve_chunk(&self, chunk: &Chunk) -> Citation {
        citation::resolve(chunk)
    }

    /// Retrieve, generate and cite in one call.
    ///
    /// Retrieval failures, timeouts included, degrade to an answer over
    /// empty context; the reason is kept in the response.
    pub async fn ask(&self, question: &str, k: Option<usize>) -> Result<AskResponse> {
        let started = Instant::now();
        let k = k.unwrap_or(self.retrieval.top_k);

        let (results, retrieval_error) = match self.retrieve(question, k).await {
            Ok(results) => (results, None),
            Err(e) => {
                warn!(error = %e, "retrieval failed, answering without context");
                (Vec::new(), Some(e))
            }
        };
        let retrieval_timed_out = matches!(retrieval_error, Some(Error::RetrievalTimeout(_)));

        let answer = self.generate(question, &results).await;
        let citations = self.resolve(&results, question);
        debug!(
            results = results.len(),
            backend = %answer.backend_used,
            "answered question"
        );

        Ok(AskResponse {
            question: question.to_string(),
            answer,
            citations,
            results,
            retrieval_timed_out,
            retrieval_error: retrieval_error.map(|e| e.to_string()),
            total_latency: started.elapsed(),
        })
    }
}

async fn within<T, F>(timeout: Duration, task: F) -> Result<T>
where
    F: Future<Output = std::result::Result<Result<T>, tokio::task::JoinError>>,
{
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::Embedding(format!(
            "retrieval task failed: {join_error}"
        ))),
        Err(_) => Err(Error::RetrievalTimeout(timeout)),
    }
}

fn check_tag(index: &EmbeddingIndex, embedder: &dyn Embedder) -> Result<()> {
    let expected = embedder.tag();
    if &expected != index.tag() {
        return Err(Error::DimensionMismatch {
            expected,
            found: index.tag().clone(),
        });
    }
    Ok(())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.snapshot();
        f.debug_struct("Session")
            .field("model", index.tag())
            .field("chunks", &index.len())
            .field("retrieval", &self.retrieval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::HashingEmbedder,
        generation::{BackendKind, DISCLOSURE, GenerationConfig},
    };

    fn chunk(id: u64, text: &str) -> Chunk {
        Chunk {
            chunk_id: id,
            text: text.to_string(),
            source_document: "formulary.pdf".to_string(),
            page: id as u32 + 1,
            page_range: (id + 1).to_string(),
            word_count: text.split_whitespace().count(),
            file_path: None,
            start_offset: 0,
        }
    }

    fn offline_generator() -> AnswerGenerator {
        AnswerGenerator::new(&GenerationConfig {
            local_url: "http://127.0.0.1:9".to_string(),
            probe_timeout: Duration::from_millis(500),
            ..GenerationConfig::default()
        })
        .unwrap()
    }

    fn session(retrieval: RetrievalConfig) -> Session {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        let chunks = vec![
            chunk(0, "Warfarin requires regular INR monitoring."),
            chunk(1, "Heparin is monitored with aPTT."),
        ];
        let index = EmbeddingIndex::build(chunks, embedder.as_ref()).unwrap();
        Session::new(Arc::new(index), embedder, retrieval, offline_generator()).unwrap()
    }

    #[tokio::test]
    async fn ask_answers_with_citations() {
        let session = session(RetrievalConfig::default());
        let response = session.ask("How is warfarin monitored?", None).await.unwrap();

        assert!(!response.retrieval_timed_out);
        assert!(response.retrieval_error.is_none());
        assert_eq!(response.citations.len(), response.results.len());
        let cited = response
            .citations
            .iter()
            .find(|c| c.excerpt.starts_with("Warfarin"))
            .unwrap();
        assert_eq!(cited.page_number, 1);
        assert_eq!(response.answer.backend_used, BackendKind::Fallback);
        assert!(response.answer.text.contains("Warfarin"));
        assert!(response.answer.text.ends_with(DISCLOSURE));
    }

    /// Shares the hashing embedder's space but cannot embed queries.
    struct Unavailable;

    impl Embedder for Unavailable {
        fn model_id(&self) -> String {
            HashingEmbedder::new(128).model_id()
        }
        fn dimension(&self) -> usize {
            128
        }
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::Embedding("model weights not loaded".to_string()))
        }
        fn spec(&self) -> crate::embedding::EmbedderSpec {
            crate::embedding::EmbedderSpec::Hashing { dimension: 128 }
        }
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_unretrieved_answer() {
        let index = session(RetrievalConfig::default()).snapshot();
        let session = Session::new(
            index,
            Arc::new(Unavailable),
            RetrievalConfig::default(),
            offline_generator(),
        )
        .unwrap();

        assert!(matches!(
            session.retrieve("warfarin", 2).await,
            Err(Error::Embedding(_))
        ));

        let response = session.ask("How is warfarin monitored?", None).await.unwrap();
        assert!(response.results.is_empty());
        assert!(response.citations.is_empty());
        assert!(!response.retrieval_timed_out);
        assert!(
            response
                .retrieval_error
                .as_deref()
                .unwrap()
                .contains("model weights not loaded")
        );
        assert_eq!(response.answer.backend_used, BackendKind::Fallback);
        assert!(!response.answer.text.is_empty());
    }

    #[tokio::test]
    async fn stalled_retrieval_times_out() {
        let stalled = std::future::pending::<
            std::result::Result<Result<Vec<RetrievalResult>>, tokio::task::JoinError>,
        >();
        let err = within(Duration::from_millis(20), stalled).await.unwrap_err();
        assert!(matches!(err, Error::RetrievalTimeout(t) if t == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn retrieve_respects_k() {
        let session = session(RetrievalConfig::default());
        let results = session.retrieve("warfarin", 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn swapped_index_is_used_by_new_queries() {
        let session = session(RetrievalConfig::default());
        let before = session.snapshot();

        let embedder = HashingEmbedder::new(128);
        let rebuilt = EmbeddingIndex::build(
            vec![chunk(5, "Digoxin toxicity causes visual disturbances.")],
            &embedder,
        )
        .unwrap();
        session.swap_index(Arc::new(rebuilt)).unwrap();

        assert_eq!(before.len(), 2);
        let results = session.retrieve("digoxin", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.chunk_id, 5);
    }

    #[test]
    fn swap_rejects_other_embedding_space() {
        let session = session(RetrievalConfig::default());
        let other = HashingEmbedder::new(64);
        let index = EmbeddingIndex::build(Vec::new(), &other).unwrap();
        let err = session.swap_index(Arc::new(index)).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn open_reads_embedder_from_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        let embedder = HashingEmbedder::new(96);
        EmbeddingIndex::build(vec![chunk(0, "Sepsis bundle within one hour.")], &embedder)
            .unwrap()
            .persist(&dir, &embedder)
            .unwrap();

        let session = Session::open(&dir, &Config::default()).unwrap();
        assert_eq!(session.snapshot().tag(), &embedder.tag());
    }
}
