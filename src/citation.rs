//! Page-level citations for retrieved chunks.

use std::path::PathBuf;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Serialize;

use crate::{
    chunking::Chunk,
    text_util::{DEFAULT_EXCERPT_MAX_CHARS, excerpt, excerpt_around},
};

/// Characters escaped in the path component of a `file://` URI.
const PATH_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Where a retrieved chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub document_name: String,
    pub page_number: u32,
    pub page_range: String,
    pub file_path: Option<PathBuf>,
    /// Byte offset of the chunk in the document text.
    pub byte_offset: usize,
    pub excerpt: String,
    /// The backing file is unknown or no longer exists.
    pub file_missing: bool,
}

/// Resolve a chunk to its citation. The excerpt is the head of the chunk.
pub fn resolve(chunk: &Chunk) -> Citation {
    build(chunk, excerpt(&chunk.text, DEFAULT_EXCERPT_MAX_CHARS))
}

/// Resolve a chunk with an excerpt starting at the first sentence that
/// mentions a keyword of `query`.
pub fn resolve_for_query(chunk: &Chunk, query: &str) -> Citation {
    build(
        chunk,
        excerpt_around(&chunk.text, query, DEFAULT_EXCERPT_MAX_CHARS),
    )
}

fn build(chunk: &Chunk, excerpt: String) -> Citation {
    let file_missing = !chunk.file_path.as_ref().is_some_and(|p| p.is_file());
    Citation {
        document_name: chunk.source_document.clone(),
        page_number: chunk.page,
        page_range: chunk.page_range.clone(),
        file_path: chunk.file_path.clone(),
        byte_offset: chunk.start_offset,
        excerpt,
        file_missing,
    }
}

impl Citation {
    /// A `file://` URI that opens the cited page in PDF viewers.
    ///
    /// `None` when the backing file is unknown or missing.
    pub fn viewer_uri(&self) -> Option<String> {
        if self.file_missing {
            return None;
        }
        let path = self.file_path.as_ref()?.to_string_lossy().replace('\\', "/");
        let path = utf8_percent_encode(&path, PATH_ESCAPES).to_string();
        let separator = if path.starts_with('/') { "" } else { "/" };
        Some(format!("file://{separator}{path}#page={}", self.page_number))
    }

    /// `document, p. N` or `document, pp. N-M`.
    pub fn label(&self) -> String {
        if self.page_range.contains('-') {
            format!("{}, pp. {}", self.document_name, self.page_range)
        } else {
            format!("{}, p. {}", self.document_name, self.page_number)
        }
    }
}
