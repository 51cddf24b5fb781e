//! Text extraction from heterogeneous document formats.
//!
//! Every supported format is reduced to an ordered list of
//! [`PageSegment`]s tagged with the 1-based page they came from. Flat
//! formats (plain text, Markdown) are a single page; PDF and Word files keep
//! their pagination so that chunks can later be cited by page.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use quick_xml::{Reader, events::Event};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    text_util::normalize_text,
};

/// Pages whose trimmed raw text is shorter than this are presumed to be
/// images or diagrams and are dropped.
pub const MIN_PAGE_CHARS: usize = 50;

/// Text of one page of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSegment {
    /// Logical name of the source document.
    pub document_id: String,
    /// 1-based page number.
    pub page_number: u32,
    /// Normalized page text.
    pub raw_text: String,
}

/// A page dropped during extraction, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPage {
    pub page_number: u32,
    pub reason: String,
}

/// The result of extracting one file.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub segments: Vec<PageSegment>,
    /// Page count of the whole document, before any range restriction.
    pub total_pages: u32,
    /// Pages that failed to extract. Short pages are not listed here.
    pub skipped: Vec<SkippedPage>,
}

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Pdf,
    Docx,
}

impl DocumentFormat {
    /// File extensions accepted by [`DocumentFormat::from_path`].
    pub const EXTENSIONS: &[&str] = &["txt", "md", "pdf", "docx"];

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

/// Inclusive, 1-based page bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Clamp to `[1, total]`. Returns `None` when nothing is left.
    pub fn clamp(self, total: u32) -> Option<(u32, u32)> {
        if total == 0 {
            return None;
        }
        let start = self.start.clamp(1, total);
        let end = self.end.clamp(1, total);
        (start <= end).then_some((start, end))
    }
}

impl std::str::FromStr for PageRange {
    type Err = String;

    /// Parses `START-END` or a single page `N`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid page number {v:?}: {e}"))
        };
        match s.split_once('-') {
            Some((start, end)) => Ok(Self::new(parse(start)?, parse(end)?)),
            None => {
                let page = parse(s)?;
                Ok(Self::new(page, page))
            }
        }
    }
}

/// Extract page segments from the file at `path`.
///
/// `source_name` becomes the segments' `document_id`. `pages` restricts
/// paginated formats to a page range, clamped to the document's bounds;
/// flat formats always produce page 1.
///
/// Fails with [`Error::Extraction`] when the file cannot be read at all.
/// A single unreadable page is skipped and reported in
/// [`Extraction::skipped`].
pub fn extract(
    path: &Path,
    source_name: &str,
    pages: Option<PageRange>,
) -> Result<Extraction> {
    let format = DocumentFormat::from_path(path)
        .ok_or_else(|| Error::extraction(path, "unsupported file type"))?;

    let raw_pages = match format {
        DocumentFormat::PlainText => {
            return extract_plain_text(path, source_name);
        }
        DocumentFormat::Pdf => read_pdf_pages(path, pages)?,
        DocumentFormat::Docx => {
            let xml = read_docx_document_xml(path)?;
            let all = split_docx_pages(&xml)
                .map_err(|reason| Error::extraction(path, reason))?;
            restrict_pages(all, pages)
        }
    };

    let mut extraction = Extraction {
        total_pages: raw_pages.total,
        ..Default::default()
    };

    for (page_number, raw) in raw_pages.pages {
        match raw {
            Ok(text) => {
                if text.trim().chars().count() < MIN_PAGE_CHARS {
                    debug!(
                        source = source_name,
                        page = page_number,
                        "dropping page with too little text"
                    );
                    continue;
                }
                extraction.segments.push(PageSegment {
                    document_id: source_name.to_string(),
                    page_number,
                    raw_text: normalize_text(&text, true),
                });
            }
            Err(reason) => {
                warn!(
                    source = source_name,
                    page = page_number,
                    %reason,
                    "skipping unreadable page"
                );
                extraction.skipped.push(SkippedPage { page_number, reason });
            }
        }
    }

    debug!(
        source = source_name,
        pages = extraction.segments.len(),
        total = extraction.total_pages,
        "extracted document"
    );
    Ok(extraction)
}

fn extract_plain_text(path: &Path, source_name: &str) -> Result<Extraction> {
    let bytes =
        std::fs::read(path).map_err(|e| Error::extraction(path, e))?;
    let text = normalize_text(&String::from_utf8_lossy(&bytes), false);

    let segments = if text.is_empty() {
        Vec::new()
    } else {
        vec![PageSegment {
            document_id: source_name.to_string(),
            page_number: 1,
            raw_text: text,
        }]
    };

    Ok(Extraction {
        segments,
        total_pages: 1,
        skipped: Vec::new(),
    })
}

/// Raw per-page text, before filtering and normalization.
struct RawPages {
    total: u32,
    pages: Vec<(u32, std::result::Result<String, String>)>,
}

fn restrict_pages(all: Vec<String>, range: Option<PageRange>) -> RawPages {
    let total = all.len() as u32;
    let (start, end) = match range {
        Some(range) => match range.clamp(total) {
            Some(bounds) => bounds,
            None => return RawPages { total, pages: Vec::new() },
        },
        None => (1, total),
    };

    let pages = all
        .into_iter()
        .enumerate()
        .map(|(i, text)| (i as u32 + 1, Ok(text)))
        .filter(|(page, _)| (start..=end).contains(page))
        .collect();
    RawPages { total, pages }
}

fn read_pdf_pages(path: &Path, range: Option<PageRange>) -> Result<RawPages> {
    let mut doc = pdf_oxide::PdfDocument::open(path)
        .map_err(|e| Error::extraction(path, e))?;
    let total = doc.page_count().map_err(|e| Error::extraction(path, e))?
        as u32;

    let bounds = match range {
        Some(range) => range.clamp(total),
        None => (total > 0).then_some((1, total)),
    };
    let Some((start, end)) = bounds else {
        return Ok(RawPages {
            total,
            pages: Vec::new(),
        });
    };

    let pages = (start..=end)
        .map(|page| {
            let text = doc
                .extract_text((page - 1) as usize)
                .map_err(|e| e.to_string());
            (page, text)
        })
        .collect();

    Ok(RawPages { total, pages })
}

fn read_docx_document_xml(path: &Path) -> Result<String> {
    let file =
        std::fs::File::open(path).map_err(|e| Error::extraction(path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| Error::extraction(path, e))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|e| Error::extraction(path, e))?;

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| Error::extraction(path, e))?;
    Ok(xml)
}

/// Split the body of a WordprocessingML document into pages.
///
/// Text comes from `w:t` runs; paragraphs end with a newline, tabs become
/// spaces. Explicit (`w:br w:type="page"`) and rendered
/// (`w:lastRenderedPageBreak`) page breaks start a new page.
fn split_docx_pages(xml: &str) -> std::result::Result<Vec<String>, String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut pages = vec![String::new()];
    let mut in_text = false;
    // Word marks the page that follows an explicit break with a rendered
    // break too; that pair is one page boundary.
    let mut after_explicit_break = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"w:t" => {
                in_text = true;
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => push_text(&mut pages, "\n"),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"w:tab" => push_text(&mut pages, " "),
                b"w:lastRenderedPageBreak" => {
                    if !std::mem::take(&mut after_explicit_break) {
                        pages.push(String::new());
                    }
                }
                b"w:br" => {
                    let is_page_break =
                        e.attributes().filter_map(|a| a.ok()).any(|attr| {
                            attr.key.as_ref() == b"w:type"
                                && attr.value.as_ref() == b"page"
                        });
                    if is_page_break {
                        pages.push(String::new());
                        after_explicit_break = true;
                    } else {
                        push_text(&mut pages, "\n");
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let text = e.unescape().map_err(|e| e.to_string())?;
                if !text.trim().is_empty() {
                    after_explicit_break = false;
                }
                push_text(&mut pages, &text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(pages)
}

fn push_text(pages: &mut [String], text: &str) {
    if let Some(page) = pages.last_mut() {
        page.push_str(text);
    }
}

/// Derive a document name from a path: the file name, lossily decoded.
pub fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Absolute path of `path`, falling back to the path as given.
pub fn absolute_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
