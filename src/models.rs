//! Core data models used throughout Nexus.
//!
//! These types represent the documents, chunks, turns, and retrieval results
//! that flow through the ingestion and chat pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared format of an uploaded document, detected from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
    Image,
    Unsupported,
}

impl DocumentFormat {
    /// Detect the format from the file extension (case-insensitive).
    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit('.')
            .next()
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => DocumentFormat::Pdf,
            "docx" => DocumentFormat::Docx,
            "txt" | "md" | "text" => DocumentFormat::Text,
            "png" | "jpg" | "jpeg" | "gif" | "webp" => DocumentFormat::Image,
            _ => DocumentFormat::Unsupported,
        }
    }

    /// MIME type for image formats, used when inlining bytes for the
    /// vision path. Non-image extensions map to `application/octet-stream`.
    pub fn media_type(name: &str) -> String {
        let ext = name
            .rsplit('.')
            .next()
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => "image/png".to_string(),
            "jpg" | "jpeg" => "image/jpeg".to_string(),
            "gif" => "image/gif".to_string(),
            "webp" => "image/webp".to_string(),
            _ => "application/octet-stream".to_string(),
        }
    }
}

/// Raw uploaded file before extraction. Discarded once text (or the image
/// sentinel) has been produced; never persisted.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub name: String,
    pub format: DocumentFormat,
    pub bytes: Vec<u8>,
}

/// One page (or pseudo-page) of extracted text with its provenance.
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based page number for paginated formats; `None` for formats
    /// without page structure (DOCX, plain text).
    pub page_number: Option<u32>,
    pub text: String,
}

/// A bounded slice of a source document's extracted text, the unit of
/// embedding and retrieval. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub chunk_id: String,
    pub text: String,
    pub source_name: String,
    pub page_number: Option<u32>,
    /// Char offset of the chunk's start within its page text.
    pub char_offset: usize,
    /// SHA-256 of the chunk text, for staleness/idempotence checks.
    pub hash: String,
}

/// Speaker role in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the append-only conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A retrieved chunk with its similarity score. Rank-ordered by
/// descending similarity; consumed immediately by the context assembler.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub chunk: TextChunk,
    pub score: f32,
}

/// A live web-search result used to enrich the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSnippet {
    pub title: String,
    pub snippet: String,
}
