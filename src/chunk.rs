//! Overlapping text chunker with page provenance.
//!
//! Splits extracted page text into [`TextChunk`]s of at most
//! `chunk_chars` bytes with `overlap_chars` of overlap between
//! consecutive chunks from the same page. Split points prefer paragraph
//! boundaries (`\n\n`), then sentence ends (`. `), then word boundaries,
//! before falling back to a hard cut. Whitespace-only chunks are
//! discarded.
//!
//! Each chunk receives a UUID, a SHA-256 hash of its text, and the
//! source name / page number / char offset of its origin.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{PageText, TextChunk};

/// Chunk every page of one document. Overlap never crosses a page
/// boundary; chunks appear in page order, then offset order.
pub fn chunk_pages(source_name: &str, pages: &[PageText], config: &ChunkingConfig) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    for page in pages {
        chunk_page(
            source_name,
            page,
            config.chunk_chars,
            config.overlap_chars,
            &mut chunks,
        );
    }
    chunks
}

fn chunk_page(
    source_name: &str,
    page: &PageText,
    max_chars: usize,
    overlap: usize,
    out: &mut Vec<TextChunk>,
) {
    let text = page.text.as_str();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        let mut piece_len = if remaining.len() <= max_chars {
            remaining.len()
        } else {
            let window_end = floor_char_boundary(remaining, max_chars);
            split_point(&remaining[..window_end], overlap)
        };
        if piece_len == 0 {
            // Window smaller than one char: take that char whole.
            piece_len = remaining
                .chars()
                .next()
                .map(|c| c.len_utf8())
                .unwrap_or(remaining.len());
        }

        let piece = &remaining[..piece_len];
        if !piece.trim().is_empty() {
            out.push(make_chunk(
                source_name,
                page.page_number,
                text[..start].chars().count(),
                piece,
            ));
        }

        if start + piece_len >= text.len() {
            break;
        }

        // Next chunk begins `overlap` bytes before this one ended.
        let step = piece_len.saturating_sub(overlap).max(1);
        let mut next = floor_char_boundary(text, start + step);
        if next <= start {
            next = start
                + text[start..]
                    .chars()
                    .next()
                    .map(|c| c.len_utf8())
                    .unwrap_or(1);
        }
        start = next;
    }
}

/// Choose where to cut within a window that is already capped at the
/// chunk size. Boundaries closer to the window start than `overlap`
/// would stall the scan, so they are rejected in favor of the next
/// preference (and ultimately a hard cut at the window end).
fn split_point(window: &str, overlap: usize) -> usize {
    if let Some(pos) = window.rfind("\n\n") {
        let p = pos + 2;
        if p > overlap {
            return p;
        }
    }
    if let Some(pos) = window.rfind(". ") {
        let p = pos + 2;
        if p > overlap {
            return p;
        }
    }
    if let Some(pos) = window.rfind(char::is_whitespace) {
        let p = pos + 1;
        if p > overlap && window.is_char_boundary(p) {
            return p;
        }
    }
    window.len()
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(
    source_name: &str,
    page_number: Option<u32>,
    char_offset: usize,
    text: &str,
) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        chunk_id: Uuid::new_v4().to_string(),
        text: text.to_string(),
        source_name: source_name.to_string(),
        page_number,
        char_offset,
        hash,
    }
}
