//! Chunking of page segments into overlapping word windows.
//!
//! Words are accumulated one at a time in page order. Each chunk remembers
//! every page it drew words from, so a window that crosses a page boundary
//! cites the full range ("3-4") while its primary page is the first of them.

use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    extract::PageSegment,
};

/// Default chunk length in words.
pub const DEFAULT_TARGET_WORDS: usize = 500;

/// Default number of words repeated at the start of the next chunk.
pub const DEFAULT_OVERLAP_WORDS: usize = 100;

/// Chunks shorter than this many characters are discarded.
pub const MIN_CHUNK_CHARS: usize = 100;

/// # Examples
///
/// ```
/// use medrag::chunking::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.target_words, 500);
/// assert_eq!(config.overlap_words, 100);
/// assert!(config.validate().is_ok());
///
/// let bad = ChunkingConfig { overlap_words: 500, ..config };
/// assert!(bad.validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_words: usize,
    pub overlap_words: usize,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: DEFAULT_TARGET_WORDS,
            overlap_words: DEFAULT_OVERLAP_WORDS,
            min_chars: MIN_CHUNK_CHARS,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_words == 0 {
            return Err(Error::Config(
                "target chunk size must be at least one word".to_string(),
            ));
        }
        if self.overlap_words >= self.target_words {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be smaller than the chunk size ({})",
                self.overlap_words, self.target_words
            )));
        }
        Ok(())
    }
}

/// A window of document text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: u64,
    pub text: String,
    pub source_document: String,
    /// Primary (first) page of the chunk.
    pub page: u32,
    /// `"N"` for a single page, `"N-M"` when the chunk spans pages.
    pub page_range: String,
    pub word_count: usize,
    /// Absolute path of the backing file, when known.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// Byte offset of the first word in the document's text, with page
    /// texts joined by a single space.
    #[serde(default)]
    pub start_offset: usize,
}

/// Chunk `segments` with the given window and overlap sizes.
///
/// Shorthand for [`chunk_segments`] with the default minimum length.
pub fn chunk(
    segments: &[PageSegment],
    target_words: usize,
    overlap_words: usize,
) -> Result<Vec<Chunk>> {
    chunk_segments(
        segments,
        &ChunkingConfig {
            target_words,
            overlap_words,
            ..ChunkingConfig::default()
        },
    )
}

/// A word with its page and byte offset in the document stream.
struct Word<'a> {
    text: &'a str,
    page: u32,
    offset: usize,
}

struct Window<'a> {
    words: Vec<Word<'a>>,
    pages: BTreeSet<u32>,
    /// Words at the front that were carried over from the previous chunk.
    carried: usize,
}

/// Split page segments of one document into overlapping chunks.
///
/// Chunk ids start at 0 and are consecutive. Chunks shorter than
/// `config.min_chars` are dropped.
pub fn chunk_segments(
    segments: &[PageSegment],
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    config.validate()?;

    let mut chunks = Vec::new();
    let Some(first) = segments.first() else {
        return Ok(chunks);
    };
    let source = first.document_id.as_str();

    let mut window = Window {
        words: Vec::with_capacity(config.target_words),
        pages: BTreeSet::new(),
        carried: 0,
    };
    let mut stream_offset = 0;

    for segment in segments {
        for (offset, text) in word_offsets(&segment.raw_text) {
            window.words.push(Word {
                text,
                page: segment.page_number,
                offset: stream_offset + offset,
            });
            window.pages.insert(segment.page_number);

            if window.words.len() >= config.target_words {
                // Overlap is only carried from a chunk that was kept.
                let keep = if emit(&mut chunks, &window, source, config) {
                    config.overlap_words.min(window.words.len())
                } else {
                    0
                };
                window.words.drain(..window.words.len() - keep);
                window.pages = window.words.iter().map(|w| w.page).collect();
                window.carried = window.words.len();
            }
        }
        stream_offset += segment.raw_text.len() + 1;
    }

    if window.words.len() > window.carried {
        emit(&mut chunks, &window, source, config);
    }

    Ok(chunks)
}

/// Push the window as a chunk. Returns false when it was too short.
fn emit(
    chunks: &mut Vec<Chunk>,
    window: &Window<'_>,
    source: &str,
    config: &ChunkingConfig,
) -> bool {
    let text = window
        .words
        .iter()
        .map(|w| w.text)
        .collect::<Vec<_>>()
        .join(" ");

    if text.chars().count() < config.min_chars {
        debug!(
            source,
            chars = text.chars().count(),
            "discarding chunk below minimum length"
        );
        return false;
    }

    let (Some(&first_page), Some(&last_page)) =
        (window.pages.first(), window.pages.last())
    else {
        return false;
    };
    let page_range = if first_page == last_page {
        first_page.to_string()
    } else {
        format!("{first_page}-{last_page}")
    };

    chunks.push(Chunk {
        chunk_id: chunks.len() as u64,
        word_count: window.words.len(),
        text,
        source_document: source.to_string(),
        page: first_page,
        page_range,
        file_path: None,
        start_offset: window.words.first().map_or(0, |w| w.offset),
    });
    true
}

/// Whitespace-separated words with their byte offsets.
fn word_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_whitespace().map(move |word| {
        let offset = word.as_ptr() as usize - text.as_ptr() as usize;
        (offset, word)
    })
}

/// Assign consecutive ids starting at `first_id`.
pub fn renumber(chunks: &mut [Chunk], first_id: u64) {
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_id = first_id + i as u64;
    }
}
