use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use globset::GlobMatcher;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    chunking::{self, Chunk, ChunkingConfig},
    embedding::{Embedder, EmbedderSpec},
    error::Result,
    extract::{self, PageRange, SkippedPage},
    index::EmbeddingIndex,
    walker::{self, DiscoveredFile},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    pub chunking: ChunkingConfig,
    /// Restrict paginated documents to this page range.
    pub pages: Option<PageRange>,
}

/// A file that could not be ingested.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of ingesting a set of files.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// All chunks, with ids renumbered consecutively from 0.
    pub chunks: Vec<Chunk>,
    pub documents: usize,
    pub pages: usize,
    pub skipped_pages: Vec<(String, SkippedPage)>,
    pub failures: Vec<FileFailure>,
}

struct FileOutcome {
    source: String,
    pages: usize,
    skipped: Vec<SkippedPage>,
    chunks: Vec<Chunk>,
}

/// Discover documents under each of `roots` and ingest them.
pub fn ingest_paths<F>(
    roots: &[PathBuf],
    filter: Option<&GlobMatcher>,
    options: &IngestOptions,
    on_file_done: F,
) -> Result<IngestReport>
where
    F: Fn(&DiscoveredFile) + Sync,
{
    let files = discover(roots, filter)?;
    ingest_files(&files, options, on_file_done)
}

/// Discover supported documents under each of `roots`.
///
/// A file reachable from more than one root is listed once.
pub fn discover(
    roots: &[PathBuf],
    filter: Option<&GlobMatcher>,
) -> Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();
    for root in roots {
        files.extend(walker::discover_files(root, filter)?);
    }
    let mut seen = HashSet::new();
    files.retain(|f| seen.insert(f.absolute_path.clone()));
    info!(files = files.len(), "discovered documents");
    Ok(files)
}

/// Extract and chunk `files` in parallel.
///
/// A file that fails to extract is recorded in
/// [`IngestReport::failures`] and does not stop the others. The chunk lists
/// are concatenated in file order and renumbered.
pub fn ingest_files<F>(
    files: &[DiscoveredFile],
    options: &IngestOptions,
    on_file_done: F,
) -> Result<IngestReport>
where
    F: Fn(&DiscoveredFile) + Sync,
{
    options.chunking.validate()?;

    let outcomes: Vec<(usize, std::result::Result<FileOutcome, String>)> = files
        .par_iter()
        .enumerate()
        .map(|(i, file)| {
            let outcome = ingest_file(file, options).map_err(|e| e.to_string());
            on_file_done(file);
            (i, outcome)
        })
        .collect();

    let mut report = IngestReport::default();
    for (i, outcome) in outcomes {
        match outcome {
            Ok(outcome) => {
                report.documents += 1;
                report.pages += outcome.pages;
                report.chunks.extend(outcome.chunks);
                report.skipped_pages.extend(
                    outcome
                        .skipped
                        .into_iter()
                        .map(|page| (outcome.source.clone(), page)),
                );
            }
            Err(reason) => {
                warn!(path = %files[i].absolute_path.display(), %reason, "failed to ingest");
                report.failures.push(FileFailure {
                    path: files[i].absolute_path.clone(),
                    reason,
                });
            }
        }
    }

    chunking::renumber(&mut report.chunks, 0);
    info!(
        documents = report.documents,
        chunks = report.chunks.len(),
        failures = report.failures.len(),
        "ingested documents"
    );
    Ok(report)
}

fn ingest_file(file: &DiscoveredFile, options: &IngestOptions) -> Result<FileOutcome> {
    let source = file.relative_path.to_string_lossy().into_owned();
    let extraction = extract::extract(&file.absolute_path, &source, options.pages)?;
    let mut chunks = chunking::chunk_segments(&extraction.segments, &options.chunking)?;
    for chunk in &mut chunks {
        chunk.file_path = Some(file.absolute_path.clone());
    }

    Ok(FileOutcome {
        source,
        pages: extraction.segments.len(),
        skipped: extraction.skipped,
        chunks,
    })
}

/// Fit the embedder described by `spec` to `chunks` and build an index.
pub fn build_index(
    chunks: Vec<Chunk>,
    spec: &EmbedderSpec,
) -> Result<(EmbeddingIndex, Arc<dyn Embedder>)> {
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let embedder = spec.fit(&texts)?;
    let index = EmbeddingIndex::build(chunks, embedder.as_ref())?;
    Ok((index, embedder))
}

/// Ingest `files`, build an index and persist it to `index_dir`.
pub fn build_and_persist<F>(
    files: &[DiscoveredFile],
    options: &IngestOptions,
    spec: &EmbedderSpec,
    index_dir: &Path,
    on_file_done: F,
) -> Result<(IngestReport, EmbeddingIndex)>
where
    F: Fn(&DiscoveredFile) + Sync,
{
    let mut report = ingest_files(files, options, on_file_done)?;
    let chunks = std::mem::take(&mut report.chunks);
    let (index, embedder) = build_index(chunks, spec)?;
    index.persist(index_dir, embedder.as_ref())?;
    report.chunks = index.chunks().to_vec();
    Ok((report, index))
}
