//! medrag - grounded, citation-tracked question answering over a medical
//! document corpus.
//!
//! Documents (PDF, DOCX, plain text) are extracted page by page, split into
//! overlapping word windows and embedded into a persisted vector index.
//! Questions are answered from the most similar chunks by a hosted language
//! model, a local [Ollama](https://ollama.com) server or, when neither is
//! reachable, an offline extractive fallback. Every answer carries page-level
//! citations back to the source files.
//!
//! # Quick start
//!
//! ```no_run
//! use medrag::{Config, DataDir, Session};
//!
//! # async fn run() -> medrag::Result<()> {
//! let config = Config::from_env()?;
//! let data_dir = DataDir::resolve(None)?;
//! let session = Session::open(&config.index_dir(&data_dir), &config)?;
//!
//! let response = session.ask("When is metformin contraindicated?", None).await?;
//! println!("{}", response.answer.text);
//! for citation in &response.citations {
//!     println!("  {}", citation.label());
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod citation;
pub mod config;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingestion;
#[cfg(feature = "colbert")]
pub mod model_manager;
pub mod retriever;
pub mod session;
pub mod text_util;
pub mod walker;

pub use chunking::{Chunk, ChunkingConfig};
pub use citation::Citation;
pub use config::{Config, RetrievalConfig};
pub use data_dir::DataDir;
pub use embedding::{Embedder, EmbedderSpec, ModelTag};
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use generation::{Answer, AnswerGenerator, BackendKind, GenerationConfig};
pub use index::EmbeddingIndex;
pub use retriever::{RetrievalResult, Retriever};
pub use session::{AskResponse, Session};
