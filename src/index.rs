//! In-memory embedding index with on-disk persistence.
//!
//! The index owns every chunk and its vector. Search is exact: all vectors
//! are L2-normalized, so the inner product is the cosine similarity, and
//! every row is scored.
//!
//! On disk an index is a directory:
//!
//! - `manifest.json`: format version, model tag, embedder spec, chunk count
//! - `index.redb`: vectors and chunk metadata (see [`EmbeddingDb`])
//! - `vocabulary.json`: fitted TF-IDF vocabulary, for TF-IDF indexes only

use std::{
    cmp::Ordering,
    collections::HashSet,
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chunking::Chunk,
    embedding::{Embedder, EmbedderSpec, ModelTag, l2_normalize},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const VECTORS_FILE: &str = "index.redb";
const FORMAT_VERSION: u32 = 1;

/// Metadata describing a persisted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub model: ModelTag,
    pub embedder: EmbedderSpec,
    pub chunk_count: usize,
}

impl Manifest {
    /// Read `manifest.json` from an index directory.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    kind: "index",
                    name: dir.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_str(&contents)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::IndexFormat(format!(
                "unsupported index format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }
}

pub struct EmbeddingIndex {
    tag: ModelTag,
    embedder: EmbedderSpec,
    /// Sorted by `chunk_id`.
    chunks: Vec<Chunk>,
    /// Row-major, `chunks.len() * tag.dimension` values.
    vectors: Vec<f32>,
}

impl EmbeddingIndex {
    /// Embed `chunks` with `embedder` and build an index over them.
    ///
    /// Chunk ids must be unique.
    pub fn build(chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self> {
        let tag = embedder.tag();
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = embedder.embed(&chunk.text)?;
            rows.push((chunk, vector));
        }

        let index = Self::from_rows(tag, embedder.spec(), rows, true)?;
        info!(
            chunks = index.len(),
            model = %index.tag,
            "built embedding index"
        );
        Ok(index)
    }

    /// Assemble an index from `(chunk, vector)` rows.
    ///
    /// Stored vectors are already unit length; only freshly embedded rows
    /// are normalized, so a loaded index scores bit-for-bit like the one
    /// that was persisted.
    fn from_rows(
        tag: ModelTag,
        embedder: EmbedderSpec,
        mut rows: Vec<(Chunk, Vec<f32>)>,
        normalize: bool,
    ) -> Result<Self> {
        rows.sort_by_key(|(chunk, _)| chunk.chunk_id);

        let mut seen = HashSet::with_capacity(rows.len());
        let mut chunks = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len() * tag.dimension);

        for (chunk, mut vector) in rows {
            if !seen.insert(chunk.chunk_id) {
                return Err(Error::IndexFormat(format!(
                    "duplicate chunk id {}",
                    chunk.chunk_id
                )));
            }
            if vector.len() != tag.dimension {
                return Err(Error::IndexFormat(format!(
                    "chunk {} has a {}-dimensional vector, expected {}",
                    chunk.chunk_id,
                    vector.len(),
                    tag.dimension
                )));
            }
            if normalize {
                l2_normalize(&mut vector);
            }
            vectors.extend_from_slice(&vector);
            chunks.push(chunk);
        }

        Ok(Self {
            tag,
            embedder,
            chunks,
            vectors,
        })
    }

    pub fn tag(&self) -> &ModelTag {
        &self.tag
    }

    pub fn embedder_spec(&self) -> &EmbedderSpec {
        &self.embedder
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Look up a chunk by id.
    pub fn chunk(&self, chunk_id: u64) -> Option<&Chunk> {
        self.chunks
            .binary_search_by_key(&chunk_id, |c| c.chunk_id)
            .ok()
            .map(|i| &self.chunks[i])
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Exact nearest-neighbor search.
    ///
    /// Returns up to `k` `(chunk_id, score)` pairs ordered by descending
    /// cosine similarity, ties broken by ascending chunk id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.tag.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.tag.clone(),
                found: ModelTag {
                    model_id: "query vector".to_string(),
                    dimension: query.len(),
                },
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let dimension = self.tag.dimension;
        let mut scored: Vec<(u64, f32)> = self
            .chunks
            .par_iter()
            .enumerate()
            .map(|(row, chunk)| {
                let vector = &self.vectors[row * dimension..(row + 1) * dimension];
                let score = vector.iter().zip(&query).map(|(a, b)| a * b).sum();
                (chunk.chunk_id, score)
            })
            .collect();

        scored.sort_by(|a, b| rank(a, b));
        scored.truncate(k);
        Ok(scored)
    }

    /// Write the index to `dir`, replacing any existing index there.
    ///
    /// The new index is written to a sibling staging directory and swapped
    /// in by rename, so readers never observe a partial index.
    pub fn persist(&self, dir: &Path, embedder: &dyn Embedder) -> Result<()> {
        if embedder.tag() != self.tag {
            return Err(Error::DimensionMismatch {
                expected: self.tag.clone(),
                found: embedder.tag(),
            });
        }

        let staging = sibling(dir, "staging")?;
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        self.write_contents(&staging, embedder)?;

        swap_in(&staging, dir)?;

        info!(path = %dir.display(), chunks = self.len(), "persisted index");
        Ok(())
    }

    fn write_contents(&self, dir: &Path, embedder: &dyn Embedder) -> Result<()> {
        let db = EmbeddingDb::open(&dir.join(VECTORS_FILE))?;
        let dimension = self.tag.dimension;
        let entries: Vec<(&Chunk, &[f32])> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(row, chunk)| {
                (chunk, &self.vectors[row * dimension..(row + 1) * dimension])
            })
            .collect();
        db.batch_store(&entries)?;
        drop(db);

        embedder.save_state(dir)?;

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            model: self.tag.clone(),
            embedder: self.embedder.clone(),
            chunk_count: self.len(),
        };
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }

    /// Load an index from `dir`.
    ///
    /// The manifest is checked against `expected` before the vector store
    /// is opened; an index built in another embedding space is refused with
    /// [`Error::DimensionMismatch`].
    pub fn load(dir: &Path, expected: &ModelTag) -> Result<Self> {
        let manifest = Manifest::read(dir)?;
        if &manifest.model != expected {
            return Err(Error::DimensionMismatch {
                expected: expected.clone(),
                found: manifest.model,
            });
        }

        let db = EmbeddingDb::open(&dir.join(VECTORS_FILE))?;
        let rows = db.load_all()?;
        if rows.len() != manifest.chunk_count {
            return Err(Error::IndexFormat(format!(
                "manifest lists {} chunks but the store holds {}",
                manifest.chunk_count,
                rows.len()
            )));
        }

        let index = Self::from_rows(manifest.model, manifest.embedder, rows, false)?;
        debug!(path = %dir.display(), chunks = index.len(), "loaded index");
        Ok(index)
    }
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("tag", &self.tag)
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

/// Descending score, then ascending chunk id.
fn rank(a: &(u64, f32), b: &(u64, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Replace `dir` with `staging`, restoring the previous contents of `dir`
/// when the final rename fails.
fn swap_in(staging: &Path, dir: &Path) -> Result<()> {
    let backup = sibling(dir, "old")?;
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }
    if dir.exists() {
        std::fs::rename(dir, &backup)?;
    }
    if let Err(e) = std::fs::rename(staging, dir) {
        if backup.exists() {
            if let Err(restore) = std::fs::rename(&backup, dir) {
                warn!(
                    backup = %backup.display(),
                    error = %restore,
                    "could not restore previous index"
                );
            }
        }
        return Err(e.into());
    }
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }
    Ok(())
}

fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir.file_name().ok_or_else(|| {
        Error::Config(format!("invalid index directory {}", dir.display()))
    })?;
    let mut sibling = name.to_os_string();
    sibling.push(format!(".{suffix}"));
    Ok(dir.with_file_name(sibling))
}
