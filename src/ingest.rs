//! Multi-format text extraction for uploaded documents.
//!
//! Turns raw upload bytes into ordered `(page, text)` pairs with source
//! provenance. PDF pages that yield no extractable text (scanned pages)
//! are skipped; image uploads produce a sentinel instead of text and are
//! handled by the vision path downstream. Unreadable files are skipped
//! with a per-file reason so the rest of a batch still ingests.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{DocumentFormat, PageText, SourceDocument};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction error. Never panics; callers skip the file and continue.
#[derive(Debug)]
pub enum IngestError {
    Unsupported(String),
    Pdf(String),
    Docx(String),
    Encoding(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Unsupported(name) => write!(f, "unsupported file type: {}", name),
            IngestError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            IngestError::Docx(e) => write!(f, "DOCX extraction failed: {}", e),
            IngestError::Encoding(e) => write!(f, "text decoding failed: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Result of extracting one upload: page text for the chunking pipeline,
/// or an image sentinel for the vision path (no OCR is attempted).
#[derive(Debug, Clone)]
pub enum ExtractedDocument {
    Pages(Vec<PageText>),
    Image { media_type: String, bytes: Vec<u8> },
}

/// Extract text (or the image sentinel) from one uploaded document.
pub fn extract_document(doc: &SourceDocument) -> Result<ExtractedDocument, IngestError> {
    match doc.format {
        DocumentFormat::Pdf => extract_pdf(&doc.bytes),
        DocumentFormat::Docx => extract_docx(&doc.bytes),
        DocumentFormat::Text => extract_text_file(&doc.bytes),
        DocumentFormat::Image => Ok(ExtractedDocument::Image {
            media_type: DocumentFormat::media_type(&doc.name),
            bytes: doc.bytes.clone(),
        }),
        DocumentFormat::Unsupported => Err(IngestError::Unsupported(doc.name.clone())),
    }
}

/// Outcome of extracting a batch of uploads. `skipped` pairs each failed
/// file with its reason; extraction of the rest continues.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub extracted: Vec<(String, ExtractedDocument)>,
    pub skipped: Vec<(String, String)>,
}

/// Extract every document in a batch, skipping failures.
pub fn extract_batch(docs: &[SourceDocument]) -> IngestBatch {
    let mut batch = IngestBatch::default();
    for doc in docs {
        match extract_document(doc) {
            Ok(extracted) => batch.extracted.push((doc.name.clone(), extracted)),
            Err(e) => batch.skipped.push((doc.name.clone(), e.to_string())),
        }
    }
    batch
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedDocument, IngestError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| IngestError::Pdf(e.to_string()))?;

    let pages: Vec<PageText> = pages
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| PageText {
            page_number: Some(i as u32 + 1),
            text,
        })
        .collect();

    Ok(ExtractedDocument::Pages(pages))
}

fn extract_text_file(bytes: &[u8]) -> Result<ExtractedDocument, IngestError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| IngestError::Encoding(e.to_string()))?
        .to_string();
    Ok(ExtractedDocument::Pages(vec![PageText {
        page_number: None,
        text,
    }]))
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDocument, IngestError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| IngestError::Docx(e.to_string()))?;
    let mut doc_xml = Vec::new();
    let mut found = false;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| IngestError::Docx(e.to_string()))?;
        if entry.name() == "word/document.xml" {
            entry
                .take(MAX_XML_ENTRY_BYTES)
                .read_to_end(&mut doc_xml)
                .map_err(|e| IngestError::Docx(e.to_string()))?;
            if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                return Err(IngestError::Docx(
                    "word/document.xml exceeds size limit".to_string(),
                ));
            }
            found = true;
            break;
        }
    }
    if !found {
        return Err(IngestError::Docx("word/document.xml not found".to_string()));
    }

    let text = extract_docx_paragraphs(&doc_xml)?;
    // No page structure in DOCX body XML: one pseudo-page.
    Ok(ExtractedDocument::Pages(vec![PageText {
        page_number: None,
        text,
    }]))
}

/// Pull `<w:t>` run text out of document.xml, joining paragraphs with
/// blank lines so the chunker can split on paragraph boundaries.
fn extract_docx_paragraphs(xml: &[u8]) -> Result<String, IngestError> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        current.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" {
                    if !current.trim().is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(IngestError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n\n"))
}

/// Expand files and directories into a deterministic upload list.
/// Directories are walked recursively; `include_globs` (when non-empty)
/// filter the walked entries by relative path.
pub fn collect_files(paths: &[PathBuf], include_globs: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let include_set = if include_globs.is_empty() {
        None
    } else {
        Some(build_globset(include_globs)?)
    };

    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
                if let Some(ref set) = include_set {
                    if !set.is_match(relative.to_string_lossy().as_ref()) {
                        continue;
                    }
                }
                files.push(entry.path().to_path_buf());
            }
        } else {
            files.push(path.clone());
        }
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

/// Read upload bytes from disk, skipping unreadable paths with a reason.
pub fn load_documents(paths: &[PathBuf]) -> (Vec<SourceDocument>, Vec<(String, String)>) {
    let mut docs = Vec::new();
    let mut skipped = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        match std::fs::read(path) {
            Ok(bytes) => docs.push(SourceDocument {
                format: DocumentFormat::from_name(&name),
                name,
                bytes,
            }),
            Err(e) => skipped.push((name, e.to_string())),
        }
    }
    (docs, skipped)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Read a single image attachment for the vision path.
pub fn load_image_attachment(path: &Path) -> anyhow::Result<(String, Vec<u8>)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    if DocumentFormat::from_name(&name) != DocumentFormat::Image {
        anyhow::bail!("not an image file: {}", path.display());
    }
    let bytes = std::fs::read(path)?;
    Ok((DocumentFormat::media_type(&name), bytes))
}
